//! Script codec for lock, redeem and unlock scripts
//!
//! Classifies standard lock scripts by fixed byte patterns, builds them
//! from hashes, and encodes/parses the push-only scripts used in
//! scriptSigs and redeem scripts.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Opcodes
// =============================================================================

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;

// =============================================================================
// Script Constants
// =============================================================================

/// Largest single element a script may push
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Largest OP_RETURN payload relayed as standard
pub const MAX_NULL_DATA_SIZE: usize = 80;

// =============================================================================
// Script Errors
// =============================================================================

/// Script-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("Truncated push at offset {0}")]
    TruncatedPush(usize),
    #[error("Non-push opcode 0x{0:02x} in push-only script")]
    NonPushOpcode(u8),
    #[error("Script too large: {0} bytes")]
    ScriptTooLarge(usize),
    #[error("Invalid witness version: {0}")]
    InvalidWitnessVersion(u8),
    #[error("Invalid witness program length: {0}")]
    InvalidProgramLength(usize),
    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

// =============================================================================
// Script Types
// =============================================================================

/// Classification of a lock script (scriptPubKey)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptType {
    /// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
    P2PKH,
    /// `OP_HASH160 <20> OP_EQUAL`
    P2SH,
    /// `OP_0 <20>`
    P2WPKH,
    /// `OP_0 <32>`
    P2WSH,
    /// `OP_n <2..40>` for witness versions 1 to 16
    WitnessProgram { version: u8 },
    /// `OP_RETURN <data>`, provably unspendable
    NullData,
    Unknown,
}

impl ScriptType {
    /// Whether the script is a witness program (addressed with Bech32)
    pub fn is_bech32(&self) -> bool {
        matches!(
            self,
            ScriptType::P2WPKH | ScriptType::P2WSH | ScriptType::WitnessProgram { .. }
        )
    }

    /// Whether spending this output uses the BIP143 signature hash
    pub fn is_segwit(&self) -> bool {
        matches!(self, ScriptType::P2WPKH | ScriptType::P2WSH)
    }

    /// Check if this script type is spendable
    pub fn is_spendable(&self) -> bool {
        !matches!(self, ScriptType::NullData)
    }

    /// Get the script type name
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptType::P2PKH => "P2PKH",
            ScriptType::P2SH => "P2SH",
            ScriptType::P2WPKH => "P2WPKH",
            ScriptType::P2WSH => "P2WSH",
            ScriptType::WitnessProgram { .. } => "WITNESS",
            ScriptType::NullData => "OP_RETURN",
            ScriptType::Unknown => "UNKNOWN",
        }
    }
}

/// Classify a lock script by opcode sequence and length
pub fn classify(script: &[u8]) -> ScriptType {
    match script {
        [OP_DUP, OP_HASH160, 0x14, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            ScriptType::P2PKH
        }
        [OP_HASH160, 0x14, hash @ .., OP_EQUAL] if hash.len() == 20 => ScriptType::P2SH,
        [OP_0, 0x14, program @ ..] if program.len() == 20 => ScriptType::P2WPKH,
        [OP_0, 0x20, program @ ..] if program.len() == 32 => ScriptType::P2WSH,
        [OP_RETURN, ..] => ScriptType::NullData,
        [version @ OP_1..=OP_16, len, program @ ..]
            if (2..=40).contains(&program.len()) && *len as usize == program.len() =>
        {
            ScriptType::WitnessProgram {
                version: version - OP_1 + 1,
            }
        }
        _ => ScriptType::Unknown,
    }
}

/// The hash or witness program committed to by a standard lock script
pub fn extract_hash(script: &[u8]) -> Option<&[u8]> {
    match classify(script) {
        ScriptType::P2PKH => Some(&script[3..23]),
        ScriptType::P2SH => Some(&script[2..22]),
        ScriptType::P2WPKH | ScriptType::P2WSH | ScriptType::WitnessProgram { .. } => {
            Some(&script[2..])
        }
        ScriptType::NullData | ScriptType::Unknown => None,
    }
}

// =============================================================================
// Lock Script Builders
// =============================================================================

pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
    script.extend_from_slice(pubkey_hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[OP_HASH160, 0x14]);
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}

pub fn p2wpkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(22);
    script.extend_from_slice(&[OP_0, 0x14]);
    script.extend_from_slice(pubkey_hash);
    script
}

pub fn p2wsh_script(script_hash: &[u8; 32]) -> Vec<u8> {
    let mut script = Vec::with_capacity(34);
    script.extend_from_slice(&[OP_0, 0x20]);
    script.extend_from_slice(script_hash);
    script
}

/// Lock script for an arbitrary witness version and program
pub fn witness_script(version: u8, program: &[u8]) -> Result<Vec<u8>, ScriptError> {
    if version > 16 {
        return Err(ScriptError::InvalidWitnessVersion(version));
    }
    if !(2..=40).contains(&program.len()) {
        return Err(ScriptError::InvalidProgramLength(program.len()));
    }
    let mut script = Vec::with_capacity(2 + program.len());
    script.push(small_int_opcode(version));
    script.push(program.len() as u8);
    script.extend_from_slice(program);
    Ok(script)
}

/// Create an OP_RETURN output script (data carrier, unspendable)
pub fn null_data_script(data: &[u8]) -> Result<Vec<u8>, ScriptError> {
    if data.len() > MAX_NULL_DATA_SIZE {
        return Err(ScriptError::ScriptTooLarge(data.len()));
    }
    let mut script = vec![OP_RETURN];
    push_data(&mut script, data);
    Ok(script)
}

// =============================================================================
// Push Encoding
// =============================================================================

/// Opcode pushing the small integer `n` (0..=16)
pub fn small_int_opcode(n: u8) -> u8 {
    if n == 0 {
        OP_0
    } else {
        OP_1 + n - 1
    }
}

/// Small integer pushed by an `OP_0`/`OP_1..OP_16` opcode
pub fn decode_small_int(opcode: u8) -> Option<u8> {
    match opcode {
        OP_0 => Some(0),
        OP_1..=OP_16 => Some(opcode - OP_1 + 1),
        _ => None,
    }
}

/// Append a minimal data push
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// Minimal little-endian script number with a sign bit
pub fn encode_script_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::with_capacity(9);
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out.last().is_some_and(|b| b & 0x80 != 0) {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        if let Some(last) = out.last_mut() {
            *last |= 0x80;
        }
    }
    out
}

/// A single operation of a decoded script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOp {
    Push(Vec<u8>),
    Op(u8),
}

/// Decode a script into pushes and opcodes
pub fn decode_ops(script: &[u8]) -> Result<Vec<ScriptOp>, ScriptError> {
    let mut ops = Vec::new();
    let mut pos = 0;
    while pos < script.len() {
        let opcode = script[pos];
        let start = pos;
        pos += 1;
        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => read_len(script, &mut pos, 1, start)?,
            OP_PUSHDATA2 => read_len(script, &mut pos, 2, start)?,
            OP_PUSHDATA4 => read_len(script, &mut pos, 4, start)?,
            OP_0 => {
                ops.push(ScriptOp::Push(Vec::new()));
                continue;
            }
            _ => {
                ops.push(ScriptOp::Op(opcode));
                continue;
            }
        };
        let end = pos
            .checked_add(len)
            .filter(|end| *end <= script.len())
            .ok_or(ScriptError::TruncatedPush(start))?;
        ops.push(ScriptOp::Push(script[pos..end].to_vec()));
        pos = end;
    }
    Ok(ops)
}

fn read_len(script: &[u8], pos: &mut usize, width: usize, start: usize) -> Result<usize, ScriptError> {
    let bytes = script
        .get(*pos..*pos + width)
        .ok_or(ScriptError::TruncatedPush(start))?;
    *pos += width;
    let mut buf = [0u8; 4];
    buf[..width].copy_from_slice(bytes);
    Ok(u32::from_le_bytes(buf) as usize)
}

/// Parse a push-only script (scriptSig) into its pushed elements.
///
/// `OP_1NEGATE` and `OP_1..OP_16` are returned as their minimal numeric
/// encodings.
pub fn parse_pushes(script: &[u8]) -> Result<Vec<Vec<u8>>, ScriptError> {
    decode_ops(script)?
        .into_iter()
        .map(|op| match op {
            ScriptOp::Push(data) => Ok(data),
            ScriptOp::Op(OP_1NEGATE) => Ok(vec![0x81]),
            ScriptOp::Op(code @ OP_1..=OP_16) => Ok(vec![code - OP_1 + 1]),
            ScriptOp::Op(code) => Err(ScriptError::NonPushOpcode(code)),
        })
        .collect()
}

/// Parse a hex-encoded script
pub fn script_from_hex(script_hex: &str) -> Result<Vec<u8>, ScriptError> {
    hex::decode(script_hex).map_err(|e| ScriptError::InvalidHex(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
