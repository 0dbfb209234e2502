//! M-of-N redeem scripts
//!
//! Builds `OP_m <pubkeys...> OP_n OP_CHECKMULTISIG` scripts, derives their
//! P2SH/P2WSH addresses and assembles the unlock data that spends them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::address::{Address, AddressConfig, AddressError};
use crate::core::script::{
    self, decode_small_int, push_data, small_int_opcode, ScriptOp, OP_0, OP_CHECKMULTISIG,
    MAX_SCRIPT_ELEMENT_SIZE,
};
use crate::crypto::{hash160, sha256};

/// Most keys a standard CHECKMULTISIG script may list
pub const MAX_MULTISIG_KEYS: usize = 16;

/// Errors related to multisig operations
#[derive(Error, Debug)]
pub enum MultisigError {
    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
    #[error("Invalid signer count: {0} (1 to 16 keys)")]
    InvalidSignerCount(usize),
    #[error("Invalid public key length {len} at position {index}")]
    InvalidPublicKey { index: usize, len: usize },
    #[error("Duplicate signer public key")]
    DuplicateSigner,
    #[error("Redeem script too large: {0} bytes")]
    ScriptTooLarge(usize),
    #[error("Not a multisig script")]
    NotMultisig,
    #[error("Insufficient signatures: have {have}, need {need}")]
    InsufficientSignatures { have: usize, need: u8 },
    #[error("Script error: {0}")]
    Script(#[from] script::ScriptError),
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
}

/// How the redeem script is committed to in the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultisigKind {
    /// HASH160 of the script behind a P2SH output
    #[default]
    P2sh,
    /// SHA256 of the script behind a P2WSH output
    P2wsh,
}

/// A validated M-of-N redeem script
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedeemScript {
    threshold: u8,
    pubkeys: Vec<Vec<u8>>,
    script: Vec<u8>,
}

impl RedeemScript {
    /// Create a new M-of-N redeem script
    ///
    /// # Errors
    /// Returns error unless `1 <= threshold <= pubkeys.len() <= 16`, every key
    /// is 33 or 65 bytes, keys are distinct, and the script fits in one
    /// script element.
    pub fn new(threshold: u8, pubkeys: Vec<Vec<u8>>) -> Result<Self, MultisigError> {
        if pubkeys.is_empty() || pubkeys.len() > MAX_MULTISIG_KEYS {
            return Err(MultisigError::InvalidSignerCount(pubkeys.len()));
        }
        if threshold == 0 {
            return Err(MultisigError::InvalidThreshold(
                "threshold must be at least 1".to_string(),
            ));
        }
        if threshold as usize > pubkeys.len() {
            return Err(MultisigError::InvalidThreshold(format!(
                "threshold {} exceeds signer count {}",
                threshold,
                pubkeys.len()
            )));
        }
        for (index, key) in pubkeys.iter().enumerate() {
            if key.len() != 33 && key.len() != 65 {
                return Err(MultisigError::InvalidPublicKey {
                    index,
                    len: key.len(),
                });
            }
        }

        // Check for duplicates
        let mut sorted = pubkeys.clone();
        sorted.sort();
        if sorted.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(MultisigError::DuplicateSigner);
        }

        let mut script = vec![small_int_opcode(threshold)];
        for key in &pubkeys {
            push_data(&mut script, key);
        }
        script.push(small_int_opcode(pubkeys.len() as u8));
        script.push(OP_CHECKMULTISIG);

        if script.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(MultisigError::ScriptTooLarge(script.len()));
        }

        Ok(Self {
            threshold,
            pubkeys,
            script,
        })
    }

    /// Create from hex-encoded public keys
    pub fn from_hex_keys(threshold: u8, pubkeys: &[String]) -> Result<Self, MultisigError> {
        let keys = pubkeys
            .iter()
            .map(|k| script::script_from_hex(k))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(threshold, keys)
    }

    /// Same keys in lexicographic order, so every cosigner derives the same
    /// script regardless of the order they were supplied in
    pub fn sorted(threshold: u8, mut pubkeys: Vec<Vec<u8>>) -> Result<Self, MultisigError> {
        pubkeys.sort();
        Self::new(threshold, pubkeys)
    }

    /// Parse and validate a serialized redeem script
    pub fn parse(bytes: &[u8]) -> Result<Self, MultisigError> {
        let ops = script::decode_ops(bytes)?;
        let (first, rest) = ops.split_first().ok_or(MultisigError::NotMultisig)?;
        let (last, middle) = rest.split_last().ok_or(MultisigError::NotMultisig)?;
        let (count_op, key_ops) = middle.split_last().ok_or(MultisigError::NotMultisig)?;

        if *last != ScriptOp::Op(OP_CHECKMULTISIG) {
            return Err(MultisigError::NotMultisig);
        }
        let threshold = small_int(first)?;
        let count = small_int(count_op)?;

        let pubkeys = key_ops
            .iter()
            .map(|op| match op {
                ScriptOp::Push(key) => Ok(key.clone()),
                ScriptOp::Op(_) => Err(MultisigError::NotMultisig),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if pubkeys.len() != count as usize {
            return Err(MultisigError::NotMultisig);
        }

        let parsed = Self::new(threshold, pubkeys)?;
        if parsed.script != bytes {
            return Err(MultisigError::NotMultisig);
        }
        Ok(parsed)
    }

    /// Get the threshold (M)
    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Get the total signer count (N)
    pub fn signer_count(&self) -> usize {
        self.pubkeys.len()
    }

    pub fn pubkeys(&self) -> &[Vec<u8>] {
        &self.pubkeys
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.script
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.script)
    }

    /// Position of a key in the script, which fixes its signature order
    pub fn key_index(&self, pubkey: &[u8]) -> Option<usize> {
        self.pubkeys.iter().position(|k| k == pubkey)
    }

    /// Address committing to this script
    pub fn address(&self, kind: MultisigKind) -> Address {
        match kind {
            MultisigKind::P2sh => Address::P2sh(hash160(&self.script)),
            MultisigKind::P2wsh => Address::Witness {
                version: 0,
                program: sha256(&self.script).to_vec(),
            },
        }
    }

    /// Lock script of the output paying to this script
    pub fn lock_script(&self, kind: MultisigKind) -> Vec<u8> {
        self.address(kind).lock_script()
    }

    /// P2SH scriptSig: `OP_0 <sig>... <redeem script>`
    ///
    /// Signatures must already carry their sighash byte and be ordered by
    /// key position.
    pub fn script_sig(&self, signatures: &[Vec<u8>]) -> Result<Vec<u8>, MultisigError> {
        self.check_signature_count(signatures)?;
        let mut out = vec![OP_0];
        for sig in signatures {
            push_data(&mut out, sig);
        }
        push_data(&mut out, &self.script);
        Ok(out)
    }

    /// P2WSH witness stack: `<empty> <sig>... <witness script>`
    pub fn witness(&self, signatures: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, MultisigError> {
        self.check_signature_count(signatures)?;
        let mut stack = Vec::with_capacity(signatures.len() + 2);
        stack.push(Vec::new());
        stack.extend(signatures.iter().cloned());
        stack.push(self.script.clone());
        Ok(stack)
    }

    fn check_signature_count(&self, signatures: &[Vec<u8>]) -> Result<(), MultisigError> {
        if signatures.len() < self.threshold as usize {
            return Err(MultisigError::InsufficientSignatures {
                have: signatures.len(),
                need: self.threshold,
            });
        }
        Ok(())
    }
}

fn small_int(op: &ScriptOp) -> Result<u8, MultisigError> {
    match op {
        ScriptOp::Op(code) => decode_small_int(*code)
            .filter(|n| *n > 0)
            .ok_or(MultisigError::NotMultisig),
        ScriptOp::Push(_) => Err(MultisigError::NotMultisig),
    }
}

/// Build an M-of-N redeem script and return `(address, redeem_script_hex)`
pub fn build_redeem_script(
    threshold: u8,
    pubkeys: Vec<Vec<u8>>,
    kind: MultisigKind,
    config: &AddressConfig,
) -> Result<(String, String), MultisigError> {
    let redeem = RedeemScript::new(threshold, pubkeys)?;
    let address = redeem.address(kind).encode(config)?;
    Ok((address, redeem.to_hex()))
}
