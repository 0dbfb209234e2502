//! Signature-hash engine
//!
//! Computes the digest a signature commits to for one input, using either
//! the legacy algorithm (copy, blank scriptSigs, splice in the script code)
//! or the BIP143 segwit algorithm with cached intermediate hashes.

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::transaction::{RawTransaction, TxOutput};
use super::varint::write_var_bytes;
use crate::crypto::double_sha256;

/// Digest returned by the legacy algorithm for SIGHASH_SINGLE without a
/// matching output
const SIGHASH_ONE: [u8; 32] = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

const ANYONECANPAY_FLAG: u8 = 0x80;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SigHashError {
    #[error("Input index {index} out of range ({count} inputs)")]
    InputOutOfRange { index: usize, count: usize },
    #[error("Invalid sighash type: 0x{0:02x}")]
    InvalidSigHashType(u8),
}

// =============================================================================
// Sighash Types
// =============================================================================

/// Signature hash types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SigHashType {
    /// Sign all inputs and outputs (default)
    #[default]
    All,
    /// Sign all inputs, no outputs
    None,
    /// Sign all inputs, only the output with the same index
    Single,
    AllAnyoneCanPay,
    NoneAnyoneCanPay,
    SingleAnyoneCanPay,
}

impl SigHashType {
    pub fn from_byte(byte: u8) -> Result<Self, SigHashError> {
        match byte {
            0x01 => Ok(SigHashType::All),
            0x02 => Ok(SigHashType::None),
            0x03 => Ok(SigHashType::Single),
            0x81 => Ok(SigHashType::AllAnyoneCanPay),
            0x82 => Ok(SigHashType::NoneAnyoneCanPay),
            0x83 => Ok(SigHashType::SingleAnyoneCanPay),
            _ => Err(SigHashError::InvalidSigHashType(byte)),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            SigHashType::All => 0x01,
            SigHashType::None => 0x02,
            SigHashType::Single => 0x03,
            SigHashType::AllAnyoneCanPay => 0x81,
            SigHashType::NoneAnyoneCanPay => 0x82,
            SigHashType::SingleAnyoneCanPay => 0x83,
        }
    }

    pub fn anyone_can_pay(self) -> bool {
        self.to_byte() & ANYONECANPAY_FLAG != 0
    }

    /// The type with the ANYONECANPAY bit stripped
    pub fn base(self) -> SigHashType {
        match self {
            SigHashType::All | SigHashType::AllAnyoneCanPay => SigHashType::All,
            SigHashType::None | SigHashType::NoneAnyoneCanPay => SigHashType::None,
            SigHashType::Single | SigHashType::SingleAnyoneCanPay => SigHashType::Single,
        }
    }
}

fn check_index(tx: &RawTransaction, index: usize) -> Result<(), SigHashError> {
    if index >= tx.inputs.len() {
        return Err(SigHashError::InputOutOfRange {
            index,
            count: tx.inputs.len(),
        });
    }
    Ok(())
}

// =============================================================================
// Legacy
// =============================================================================

/// Pre-segwit signature hash.
///
/// `script_code` is the lock script of the spent output, or the redeem
/// script for P2SH.
pub fn legacy_sighash(
    tx: &RawTransaction,
    index: usize,
    script_code: &[u8],
    sighash_type: SigHashType,
) -> Result<[u8; 32], SigHashError> {
    check_index(tx, index)?;
    let base = sighash_type.base();
    if base == SigHashType::Single && index >= tx.outputs.len() {
        return Ok(SIGHASH_ONE);
    }

    let mut copy = RawTransaction {
        version: tx.version,
        inputs: tx.inputs.clone(),
        outputs: tx.outputs.clone(),
        locktime: tx.locktime,
        witnesses: Vec::new(),
    };
    for (i, input) in copy.inputs.iter_mut().enumerate() {
        input.script_sig.clear();
        if i == index {
            input.script_sig = script_code.to_vec();
        } else if base != SigHashType::All {
            input.sequence = 0;
        }
    }

    match base {
        SigHashType::None => copy.outputs.clear(),
        SigHashType::Single => {
            copy.outputs.truncate(index + 1);
            for output in copy.outputs.iter_mut().take(index) {
                *output = TxOutput::new(u64::MAX, Vec::new());
            }
        }
        _ => {}
    }

    if sighash_type.anyone_can_pay() {
        let input = copy.inputs.swap_remove(index);
        copy.inputs = vec![input];
    }

    let mut preimage = copy.encode_legacy();
    preimage.put_u32_le(sighash_type.to_byte() as u32);
    Ok(double_sha256(&preimage))
}

// =============================================================================
// BIP143
// =============================================================================

/// BIP143 hasher with the transaction-wide hashes computed once and reused
/// for every input
#[derive(Debug, Clone)]
pub struct Bip143Hasher<'a> {
    tx: &'a RawTransaction,
    hash_prevouts: [u8; 32],
    hash_sequence: [u8; 32],
    hash_outputs: [u8; 32],
}

impl<'a> Bip143Hasher<'a> {
    pub fn new(tx: &'a RawTransaction) -> Self {
        let mut prevouts = Vec::with_capacity(tx.inputs.len() * 36);
        let mut sequences = Vec::with_capacity(tx.inputs.len() * 4);
        for input in &tx.inputs {
            prevouts.put_slice(input.txid.as_wire_bytes());
            prevouts.put_u32_le(input.vout);
            sequences.put_u32_le(input.sequence);
        }

        Self {
            tx,
            hash_prevouts: double_sha256(&prevouts),
            hash_sequence: double_sha256(&sequences),
            hash_outputs: double_sha256(&encode_outputs(&tx.outputs)),
        }
    }

    pub fn hash_prevouts(&self) -> &[u8; 32] {
        &self.hash_prevouts
    }

    pub fn hash_sequence(&self) -> &[u8; 32] {
        &self.hash_sequence
    }

    pub fn hash_outputs(&self) -> &[u8; 32] {
        &self.hash_outputs
    }

    /// Signature hash for input `index` spending `amount` with `script_code`
    pub fn sighash(
        &self,
        index: usize,
        script_code: &[u8],
        amount: u64,
        sighash_type: SigHashType,
    ) -> Result<[u8; 32], SigHashError> {
        let tx = self.tx;
        check_index(tx, index)?;
        let base = sighash_type.base();
        let zero = [0u8; 32];

        let hash_prevouts = if sighash_type.anyone_can_pay() {
            zero
        } else {
            self.hash_prevouts
        };
        let hash_sequence = if sighash_type.anyone_can_pay() || base != SigHashType::All {
            zero
        } else {
            self.hash_sequence
        };
        let hash_outputs = match base {
            SigHashType::All => self.hash_outputs,
            SigHashType::Single if index < tx.outputs.len() => {
                double_sha256(&encode_outputs(&tx.outputs[index..=index]))
            }
            _ => zero,
        };

        let input = &tx.inputs[index];
        let mut preimage = Vec::with_capacity(160 + script_code.len());
        preimage.put_u32_le(tx.version);
        preimage.put_slice(&hash_prevouts);
        preimage.put_slice(&hash_sequence);
        preimage.put_slice(input.txid.as_wire_bytes());
        preimage.put_u32_le(input.vout);
        write_var_bytes(&mut preimage, script_code);
        preimage.put_u64_le(amount);
        preimage.put_u32_le(input.sequence);
        preimage.put_slice(&hash_outputs);
        preimage.put_u32_le(tx.locktime);
        preimage.put_u32_le(sighash_type.to_byte() as u32);

        Ok(double_sha256(&preimage))
    }
}

/// One-off BIP143 signature hash
pub fn segwit_sighash(
    tx: &RawTransaction,
    index: usize,
    script_code: &[u8],
    amount: u64,
    sighash_type: SigHashType,
) -> Result<[u8; 32], SigHashError> {
    Bip143Hasher::new(tx).sighash(index, script_code, amount, sighash_type)
}

fn encode_outputs(outputs: &[TxOutput]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(outputs.iter().map(TxOutput::size).sum());
    for output in outputs {
        buf.put_u64_le(output.amount);
        write_var_bytes(&mut buf, &output.lock_script);
    }
    buf
}

// =============================================================================
// Tests
// =============================================================================
