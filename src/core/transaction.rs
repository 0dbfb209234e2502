//! Raw transaction codec
//!
//! Implements the Bitcoin wire format shared by the supported chains:
//! - CompactSize counts and script lengths
//! - Segwit marker/flag and per-input witness stacks (BIP144)
//! - Sequence numbers for locktime and opt-in RBF (BIP-125)
//! - Txid over the non-witness serialization

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::varint::{compact_size_len, ensure, read_compact_size, read_var_bytes, write_compact_size, write_var_bytes};
use crate::crypto::double_sha256;

// =============================================================================
// Constants
// =============================================================================

/// Current transaction version
pub const TX_VERSION: u32 = 2;

/// Sequence number that disables locktime
pub const SEQUENCE_FINAL: u32 = 0xFFFFFFFF;

/// Sequence number that enables locktime without signalling RBF
pub const SEQUENCE_LOCKTIME: u32 = 0xFFFFFFFE;

/// Highest sequence number that signals opt-in RBF (BIP-125)
pub const SEQUENCE_RBF: u32 = 0xFFFFFFFD;

/// Locktime threshold: values below are block heights, above are timestamps
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Witness scale factor for weight/vsize
pub const WITNESS_SCALE_FACTOR: usize = 4;

const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

/// Sequence number for every input of a transaction with the given locktime
pub fn sequence_for(locktime: u32, enable_rbf: bool) -> u32 {
    if enable_rbf {
        SEQUENCE_RBF
    } else if locktime != 0 {
        SEQUENCE_LOCKTIME
    } else {
        SEQUENCE_FINAL
    }
}

// =============================================================================
// Error Types
// =============================================================================

/// Transaction-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransactionError {
    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("Non-canonical CompactSize encoding of {0}")]
    NonCanonicalCompactSize(u64),
    #[error("Length {0} does not fit in memory")]
    LengthOverflow(u64),
    #[error("{0} trailing bytes after transaction")]
    TrailingBytes(usize),
    #[error("Invalid segwit flag: 0x{0:02x}")]
    InvalidSegwitFlag(u8),
    #[error("Segwit flag set but every witness is empty")]
    SuperfluousWitness,
    #[error("Witness count {witnesses} does not match input count {inputs}")]
    WitnessCountMismatch { inputs: usize, witnesses: usize },
    #[error("Input index {index} out of range ({count} inputs)")]
    InputOutOfRange { index: usize, count: usize },
    #[error("Invalid hex: {0}")]
    InvalidHex(String),
    #[error("Invalid txid: {0}")]
    InvalidTxid(String),
}

// =============================================================================
// Txid
// =============================================================================

/// Transaction id, stored in wire (little-endian) byte order.
///
/// Displayed and parsed as reversed hex, the way nodes and explorers
/// print it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Txid(pub [u8; 32]);

impl Txid {
    /// All-zero txid referenced by coinbase inputs
    pub const NULL: Txid = Txid([0u8; 32]);

    /// Build from the wire byte order
    pub fn from_wire_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Bytes as they appear in the serialized transaction
    pub fn as_wire_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut display = self.0;
        display.reverse();
        f.write_str(&hex::encode(display))
    }
}

impl fmt::Debug for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txid({})", self)
    }
}

impl FromStr for Txid {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TransactionError::InvalidTxid(s.to_string()))?;
        let mut wire: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransactionError::InvalidTxid(s.to_string()))?;
        wire.reverse();
        Ok(Self(wire))
    }
}

impl TryFrom<String> for Txid {
    type Error = TransactionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Txid> for String {
    fn from(txid: Txid) -> Self {
        txid.to_string()
    }
}

// =============================================================================
// Transaction Input / Output
// =============================================================================

/// Transaction input (reference to previous output)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Transaction ID of the previous transaction
    pub txid: Txid,
    /// Index of the output in the previous transaction
    pub vout: u32,
    /// Unlock script, empty until signed
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    /// Create an unsigned input
    pub fn new(txid: Txid, vout: u32, sequence: u32) -> Self {
        Self {
            txid,
            vout,
            script_sig: Vec::new(),
            sequence,
        }
    }

    /// Check if this input spends the coinbase outpoint
    pub fn is_coinbase(&self) -> bool {
        self.txid.is_null() && self.vout == u32::MAX
    }

    /// Check if this input signals RBF
    pub fn signals_rbf(&self) -> bool {
        self.sequence <= SEQUENCE_RBF
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_slice(&self.txid.0);
        buf.put_u32_le(self.vout);
        write_var_bytes(buf, &self.script_sig);
        buf.put_u32_le(self.sequence);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, TransactionError> {
        ensure(buf, 36)?;
        let mut txid = [0u8; 32];
        buf.copy_to_slice(&mut txid);
        let vout = buf.get_u32_le();
        let script_sig = read_var_bytes(buf)?;
        ensure(buf, 4)?;
        let sequence = buf.get_u32_le();
        Ok(Self {
            txid: Txid(txid),
            vout,
            script_sig,
            sequence,
        })
    }
}

/// Transaction output (amount locked to a script)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount in base units
    pub amount: u64,
    pub lock_script: Vec<u8>,
}

impl TxOutput {
    pub fn new(amount: u64, lock_script: Vec<u8>) -> Self {
        Self { amount, lock_script }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u64_le(self.amount);
        write_var_bytes(buf, &self.lock_script);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, TransactionError> {
        ensure(buf, 8)?;
        let amount = buf.get_u64_le();
        let lock_script = read_var_bytes(buf)?;
        Ok(Self { amount, lock_script })
    }

    /// Serialized size of this output
    pub fn size(&self) -> usize {
        8 + compact_size_len(self.lock_script.len() as u64) + self.lock_script.len()
    }
}

// =============================================================================
// Raw Transaction
// =============================================================================

/// A transaction draft: built unsigned, filled in by the signer, then
/// serialized for broadcast.
///
/// `witnesses` is either empty or holds exactly one stack per input.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawTransaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
    #[serde(default)]
    pub witnesses: Vec<Vec<Vec<u8>>>,
}

impl RawTransaction {
    /// Create an empty transaction
    pub fn new(version: u32, locktime: u32) -> Self {
        Self {
            version,
            locktime,
            ..Default::default()
        }
    }

    /// Whether any input carries witness data (selects the segwit layout)
    pub fn has_witness(&self) -> bool {
        self.witnesses.iter().any(|stack| !stack.is_empty())
    }

    /// Check if this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Sum of all output amounts
    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Replace the witness stack of one input, growing the witness list if needed
    pub fn set_witness(&mut self, index: usize, stack: Vec<Vec<u8>>) -> Result<(), TransactionError> {
        if index >= self.inputs.len() {
            return Err(TransactionError::InputOutOfRange {
                index,
                count: self.inputs.len(),
            });
        }
        if self.witnesses.len() != self.inputs.len() {
            self.witnesses.resize(self.inputs.len(), Vec::new());
        }
        self.witnesses[index] = stack;
        Ok(())
    }

    /// Witness stack of one input (empty if none)
    pub fn witness(&self, index: usize) -> &[Vec<u8>] {
        self.witnesses.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Serialize in the segwit layout when witness data is present
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with(self.has_witness())
    }

    /// Serialize without marker, flag and witnesses (txid preimage)
    pub fn encode_legacy(&self) -> Vec<u8> {
        self.encode_with(false)
    }

    fn encode_with(&self, include_witness: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.estimated_capacity());
        buf.put_u32_le(self.version);
        if include_witness {
            buf.put_u8(SEGWIT_MARKER);
            buf.put_u8(SEGWIT_FLAG);
        }

        write_compact_size(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(&mut buf);
        }

        write_compact_size(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(&mut buf);
        }

        if include_witness {
            for index in 0..self.inputs.len() {
                let stack = self.witness(index);
                write_compact_size(&mut buf, stack.len() as u64);
                for item in stack {
                    write_var_bytes(&mut buf, item);
                }
            }
        }

        buf.put_u32_le(self.locktime);
        buf
    }

    fn estimated_capacity(&self) -> usize {
        10 + self.inputs.len() * 41
            + self.inputs.iter().map(|i| i.script_sig.len()).sum::<usize>()
            + self.outputs.iter().map(TxOutput::size).sum::<usize>()
    }

    /// Serialize to hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.encode())
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    /// Decode a serialized transaction; exact inverse of [`encode`](Self::encode)
    pub fn decode(bytes: &[u8]) -> Result<Self, TransactionError> {
        let mut buf = bytes;
        ensure(&buf, 4)?;
        let version = buf.get_u32_le();

        let segwit = buf.len() >= 2 && buf[0] == SEGWIT_MARKER;
        if segwit {
            buf.advance(1);
            let flag = buf.get_u8();
            if flag != SEGWIT_FLAG {
                return Err(TransactionError::InvalidSegwitFlag(flag));
            }
        }

        let input_count = read_count(&mut buf)?;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(TxInput::decode(&mut buf)?);
        }

        let output_count = read_count(&mut buf)?;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            outputs.push(TxOutput::decode(&mut buf)?);
        }

        let mut witnesses = Vec::new();
        if segwit {
            for _ in 0..inputs.len() {
                let items = read_count(&mut buf)?;
                let mut stack = Vec::with_capacity(items.min(64));
                for _ in 0..items {
                    stack.push(read_var_bytes(&mut buf)?);
                }
                witnesses.push(stack);
            }
            if witnesses.iter().all(Vec::is_empty) {
                return Err(TransactionError::SuperfluousWitness);
            }
        }

        ensure(&buf, 4)?;
        let locktime = buf.get_u32_le();
        if !buf.is_empty() {
            return Err(TransactionError::TrailingBytes(buf.len()));
        }

        Ok(Self {
            version,
            inputs,
            outputs,
            locktime,
            witnesses,
        })
    }

    /// Decode from hex
    pub fn from_hex(tx_hex: &str) -> Result<Self, TransactionError> {
        let bytes = hex::decode(tx_hex.trim()).map_err(|e| TransactionError::InvalidHex(e.to_string()))?;
        Self::decode(&bytes)
    }

    // =========================================================================
    // Identity and size
    // =========================================================================

    /// Transaction id (double SHA-256 of the non-witness serialization)
    pub fn txid(&self) -> Txid {
        Txid(double_sha256(&self.encode_legacy()))
    }

    /// Witness transaction id (equals the txid when there is no witness)
    pub fn wtxid(&self) -> Txid {
        Txid(double_sha256(&self.encode()))
    }

    /// Full serialized size in bytes
    pub fn size(&self) -> usize {
        self.encode().len()
    }

    /// Transaction weight (BIP141)
    pub fn weight(&self) -> usize {
        let base = self.encode_legacy().len();
        let total = self.size();
        base * (WITNESS_SCALE_FACTOR - 1) + total
    }

    /// Virtual size used for fee-rate calculations
    pub fn vsize(&self) -> usize {
        self.weight().div_ceil(WITNESS_SCALE_FACTOR)
    }

    /// Check if any input signals RBF
    pub fn signals_rbf(&self) -> bool {
        self.inputs.iter().any(TxInput::signals_rbf)
    }

    /// Check if locktime is height-based (vs time-based)
    pub fn is_height_locktime(&self) -> bool {
        self.locktime < LOCKTIME_THRESHOLD
    }
}

fn read_count(buf: &mut &[u8]) -> Result<usize, TransactionError> {
    let count = read_compact_size(buf)?;
    usize::try_from(count).map_err(|_| TransactionError::LengthOverflow(count))
}

// =============================================================================
// Tests
// =============================================================================
