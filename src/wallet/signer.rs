//! Transaction signer and verifier
//!
//! Each input is resolved to a spend path from its lock script and unlock
//! data, which fixes the sighash algorithm, the script code, and where the
//! signature goes:
//!
//! | Path          | Sighash | Script code            | Signature in      |
//! |---------------|---------|------------------------|-------------------|
//! | P2PKH         | legacy  | lock script            | scriptSig         |
//! | P2WPKH        | BIP143  | P2PKH of the key hash  | witness           |
//! | P2SH-P2WPKH   | BIP143  | P2PKH of the key hash  | witness           |
//! | P2SH multisig | legacy  | redeem script          | scriptSig         |
//! | P2WSH multisig| BIP143  | witness script         | witness           |

use log::debug;
use zeroize::Zeroizing;

use super::error::WalletError;
use super::utxo::UnspentOutput;
use crate::core::script::{self, classify, p2pkh_script, parse_pushes, push_data, ScriptType};
use crate::core::sighash::{legacy_sighash, Bip143Hasher, SigHashError, SigHashType};
use crate::core::transaction::RawTransaction;
use crate::crypto::{der_decode, der_encode, hash160, sha256, verify_digest, KeyError, KeyPair};
use crate::multisig::RedeemScript;

/// Private key bytes, zeroed on drop
pub type SecretBytes = Zeroizing<[u8; 32]>;

// =============================================================================
// Unlock data
// =============================================================================

/// Everything needed to sign one input
#[derive(Clone)]
pub struct UnlockDescriptor {
    /// Lock script of the output being spent
    pub lock_script: Vec<u8>,
    /// Amount of the output being spent (committed to by BIP143)
    pub amount: u64,
    /// Redeem or witness script for P2SH/P2WSH outputs
    pub redeem_script: Option<Vec<u8>>,
    keys: Vec<SecretBytes>,
}

impl UnlockDescriptor {
    /// Descriptor without keys, for inputs signed externally
    pub fn new(lock_script: Vec<u8>, amount: u64) -> Self {
        Self {
            lock_script,
            amount,
            redeem_script: None,
            keys: Vec::new(),
        }
    }

    pub fn from_utxo(utxo: &UnspentOutput) -> Result<Self, WalletError> {
        Ok(Self::new(utxo.lock_script()?, utxo.amount))
    }

    pub fn with_redeem_script(mut self, redeem_script: Vec<u8>) -> Self {
        self.redeem_script = Some(redeem_script);
        self
    }

    /// Add a signing key; multisig inputs take one per cosigner
    pub fn with_key(mut self, secret: SecretBytes) -> Self {
        self.keys.push(secret);
        self
    }

    pub fn with_keypair(self, keypair: &KeyPair) -> Self {
        self.with_key(Zeroizing::new(keypair.secret_bytes()))
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }
}

impl std::fmt::Debug for UnlockDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockDescriptor")
            .field("lock_script", &hex::encode(&self.lock_script))
            .field("amount", &self.amount)
            .field("redeem_script", &self.redeem_script.as_ref().map(hex::encode))
            .field("keys", &self.keys.len())
            .finish()
    }
}

/// A signature produced for one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSlot {
    /// Compact low-S `r || s`
    pub signature: [u8; 64],
    /// Compressed public key
    pub pubkey: Vec<u8>,
}

impl SignatureSlot {
    /// DER signature followed by the sighash type byte
    pub fn encode(&self, sighash_type: SigHashType) -> Result<Vec<u8>, KeyError> {
        let mut out = der_encode(&self.signature)?;
        out.push(sighash_type.to_byte());
        Ok(out)
    }
}

// =============================================================================
// Spend paths
// =============================================================================

/// How an input is unlocked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendPath {
    P2pkh { pubkey_hash: [u8; 20] },
    P2wpkh { pubkey_hash: [u8; 20] },
    P2shP2wpkh { pubkey_hash: [u8; 20] },
    P2shMultisig(RedeemScript),
    P2wshMultisig(RedeemScript),
}

impl SpendPath {
    /// Resolve the path for input `index`
    pub fn resolve(index: usize, unlock: &UnlockDescriptor) -> Result<Self, WalletError> {
        let lock = &unlock.lock_script;
        let script_type = classify(lock);
        let committed = script::extract_hash(lock).unwrap_or_default();

        match script_type {
            ScriptType::P2PKH => Ok(SpendPath::P2pkh {
                pubkey_hash: to_hash20(committed),
            }),
            ScriptType::P2WPKH => Ok(SpendPath::P2wpkh {
                pubkey_hash: to_hash20(committed),
            }),
            ScriptType::P2SH => {
                let redeem = match &unlock.redeem_script {
                    Some(redeem) => redeem.clone(),
                    None => {
                        // wrapped P2WPKH of the first key
                        let key = unlock.keys.first().ok_or(WalletError::MissingUnlockData {
                            index,
                            what: "redeem script",
                        })?;
                        let keypair = KeyPair::from_secret_bytes(key)
                            .map_err(|source| WalletError::Signature { index, source })?;
                        script::p2wpkh_script(&keypair.pubkey_hash())
                    }
                };
                if hash160(&redeem)[..] != *committed {
                    return Err(WalletError::verify(index, "redeem script does not match P2SH hash"));
                }
                if classify(&redeem) == ScriptType::P2WPKH {
                    Ok(SpendPath::P2shP2wpkh {
                        pubkey_hash: to_hash20(&redeem[2..]),
                    })
                } else {
                    Ok(SpendPath::P2shMultisig(RedeemScript::parse(&redeem)?))
                }
            }
            ScriptType::P2WSH => {
                let witness_script = unlock.redeem_script.as_ref().ok_or(
                    WalletError::MissingUnlockData {
                        index,
                        what: "witness script",
                    },
                )?;
                if sha256(witness_script)[..] != *committed {
                    return Err(WalletError::verify(index, "witness script does not match P2WSH hash"));
                }
                Ok(SpendPath::P2wshMultisig(RedeemScript::parse(witness_script)?))
            }
            other => Err(WalletError::UnsupportedScript {
                index,
                script_type: other.type_name().to_string(),
            }),
        }
    }

    /// Whether the input is signed with the BIP143 sighash
    pub fn is_segwit(&self) -> bool {
        !matches!(self, SpendPath::P2pkh { .. } | SpendPath::P2shMultisig(_))
    }

    /// Signature hash for this input
    pub fn sighash(
        &self,
        hasher: &Bip143Hasher<'_>,
        tx: &RawTransaction,
        index: usize,
        unlock: &UnlockDescriptor,
        sighash_type: SigHashType,
    ) -> Result<[u8; 32], SigHashError> {
        match self {
            SpendPath::P2pkh { .. } => legacy_sighash(tx, index, &unlock.lock_script, sighash_type),
            SpendPath::P2shMultisig(redeem) => {
                legacy_sighash(tx, index, redeem.as_bytes(), sighash_type)
            }
            SpendPath::P2wpkh { pubkey_hash } | SpendPath::P2shP2wpkh { pubkey_hash } => hasher
                .sighash(index, &p2pkh_script(pubkey_hash), unlock.amount, sighash_type),
            SpendPath::P2wshMultisig(redeem) => {
                hasher.sighash(index, redeem.as_bytes(), unlock.amount, sighash_type)
            }
        }
    }
}

fn to_hash20(bytes: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    if bytes.len() == 20 {
        out.copy_from_slice(bytes);
    }
    out
}

fn check_unlock_count(tx: &RawTransaction, unlocks: &[UnlockDescriptor]) -> Result<(), WalletError> {
    if tx.inputs.len() != unlocks.len() {
        return Err(WalletError::UnlockCountMismatch {
            inputs: tx.inputs.len(),
            descriptors: unlocks.len(),
        });
    }
    Ok(())
}

// =============================================================================
// Signing
// =============================================================================

/// Per-input signature hashes, for handing to an external signer
pub fn input_sighashes(
    tx: &RawTransaction,
    unlocks: &[UnlockDescriptor],
    sighash_type: SigHashType,
) -> Result<Vec<[u8; 32]>, WalletError> {
    check_unlock_count(tx, unlocks)?;
    let hasher = Bip143Hasher::new(tx);
    unlocks
        .iter()
        .enumerate()
        .map(|(index, unlock)| -> Result<[u8; 32], WalletError> {
            let path = SpendPath::resolve(index, unlock)?;
            Ok(path.sighash(&hasher, tx, index, unlock, sighash_type)?)
        })
        .collect()
}

/// Sign every input that has keys.
///
/// Works on a copy: on error the draft is left untouched and no input is
/// partially signed. Inputs without keys are left for external signers.
pub fn sign_transaction(
    tx: &RawTransaction,
    unlocks: &[UnlockDescriptor],
    sighash_type: SigHashType,
) -> Result<RawTransaction, WalletError> {
    check_unlock_count(tx, unlocks)?;
    let hasher = Bip143Hasher::new(tx);
    let mut signed = tx.clone();

    for (index, unlock) in unlocks.iter().enumerate() {
        if !unlock.has_keys() {
            debug!("Input {} has no keys, leaving it for an external signer", index);
            continue;
        }
        let path = SpendPath::resolve(index, unlock)?;
        let digest = path.sighash(&hasher, tx, index, unlock, sighash_type)?;

        let slots = unlock
            .keys
            .iter()
            .map(|key| sign_with(key, &digest))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| WalletError::Signature { index, source })?;

        insert_signatures(&mut signed, index, &path, &slots, sighash_type)?;
    }

    Ok(signed)
}

fn sign_with(key: &SecretBytes, digest: &[u8; 32]) -> Result<SignatureSlot, crate::crypto::KeyError> {
    let keypair = KeyPair::from_secret_bytes(key)?;
    Ok(SignatureSlot {
        signature: keypair.sign_digest(digest)?,
        pubkey: keypair.public_key_bytes().to_vec(),
    })
}

/// Place signatures for input `index` into its scriptSig and/or witness
pub fn insert_signatures(
    tx: &mut RawTransaction,
    index: usize,
    path: &SpendPath,
    slots: &[SignatureSlot],
    sighash_type: SigHashType,
) -> Result<(), WalletError> {
    if index >= tx.inputs.len() {
        return Err(SigHashError::InputOutOfRange {
            index,
            count: tx.inputs.len(),
        }
        .into());
    }

    match path {
        SpendPath::P2pkh { pubkey_hash }
        | SpendPath::P2wpkh { pubkey_hash }
        | SpendPath::P2shP2wpkh { pubkey_hash } => {
            let slot = slots
                .iter()
                .find(|s| hash160(&s.pubkey) == *pubkey_hash)
                .ok_or(WalletError::MissingUnlockData {
                    index,
                    what: "key matching the lock script",
                })?;
            let sig = slot
                .encode(sighash_type)
                .map_err(|source| WalletError::Signature { index, source })?;

            if let SpendPath::P2pkh { .. } = path {
                let mut script_sig = Vec::with_capacity(sig.len() + slot.pubkey.len() + 2);
                push_data(&mut script_sig, &sig);
                push_data(&mut script_sig, &slot.pubkey);
                tx.inputs[index].script_sig = script_sig;
            } else {
                tx.inputs[index].script_sig = match path {
                    SpendPath::P2shP2wpkh { pubkey_hash } => {
                        let mut script_sig = Vec::with_capacity(23);
                        push_data(&mut script_sig, &script::p2wpkh_script(pubkey_hash));
                        script_sig
                    }
                    _ => Vec::new(),
                };
                tx.set_witness(index, vec![sig, slot.pubkey.clone()])?;
            }
        }
        SpendPath::P2shMultisig(redeem) => {
            let sigs = ordered_multisig(index, redeem, slots, sighash_type)?;
            tx.inputs[index].script_sig = redeem.script_sig(&sigs)?;
        }
        SpendPath::P2wshMultisig(redeem) => {
            let sigs = ordered_multisig(index, redeem, slots, sighash_type)?;
            tx.inputs[index].script_sig.clear();
            tx.set_witness(index, redeem.witness(&sigs)?)?;
        }
    }
    Ok(())
}

/// Signatures in key order, cut to the threshold CHECKMULTISIG consumes
fn ordered_multisig(
    index: usize,
    redeem: &RedeemScript,
    slots: &[SignatureSlot],
    sighash_type: SigHashType,
) -> Result<Vec<Vec<u8>>, WalletError> {
    let mut positioned = Vec::with_capacity(slots.len());
    for slot in slots {
        let position = redeem.key_index(&slot.pubkey).ok_or(WalletError::MissingUnlockData {
            index,
            what: "key listed in the redeem script",
        })?;
        let sig = slot
            .encode(sighash_type)
            .map_err(|source| WalletError::Signature { index, source })?;
        positioned.push((position, sig));
    }
    positioned.sort_by_key(|(position, _)| *position);
    positioned.dedup_by_key(|(position, _)| *position);
    positioned.truncate(redeem.threshold() as usize);
    Ok(positioned.into_iter().map(|(_, sig)| sig).collect())
}

// =============================================================================
// Verification
// =============================================================================

/// Verify every input's signatures against the outputs they spend
pub fn verify_transaction(tx: &RawTransaction, unlocks: &[UnlockDescriptor]) -> Result<(), WalletError> {
    check_unlock_count(tx, unlocks)?;
    let hasher = Bip143Hasher::new(tx);
    for (index, unlock) in unlocks.iter().enumerate() {
        verify_input(tx, &hasher, index, unlock)?;
    }
    Ok(())
}

fn verify_input(
    tx: &RawTransaction,
    hasher: &Bip143Hasher<'_>,
    index: usize,
    unlock: &UnlockDescriptor,
) -> Result<(), WalletError> {
    let input = &tx.inputs[index];
    let witness = tx.witness(index);
    let lock = &unlock.lock_script;
    let committed = script::extract_hash(lock).unwrap_or_default();

    // rebuild the unlock data from what the transaction reveals
    let (path, sigs, pubkeys): (SpendPath, Vec<Vec<u8>>, Vec<Vec<u8>>) = match classify(lock) {
        ScriptType::P2PKH => {
            let pushes = parse_pushes(&input.script_sig)?;
            let [sig, pubkey] = two_items(index, pushes)?;
            if hash160(&pubkey)[..] != *committed {
                return Err(WalletError::verify(index, "public key does not match lock script"));
            }
            (
                SpendPath::P2pkh {
                    pubkey_hash: to_hash20(committed),
                },
                vec![sig],
                vec![pubkey],
            )
        }
        ScriptType::P2WPKH => {
            if !input.script_sig.is_empty() {
                return Err(WalletError::verify(index, "native witness input has a scriptSig"));
            }
            let [sig, pubkey] = two_items(index, witness.to_vec())?;
            if hash160(&pubkey)[..] != *committed {
                return Err(WalletError::verify(index, "public key does not match witness program"));
            }
            (
                SpendPath::P2wpkh {
                    pubkey_hash: to_hash20(committed),
                },
                vec![sig],
                vec![pubkey],
            )
        }
        ScriptType::P2SH => {
            let mut pushes = parse_pushes(&input.script_sig)?;
            let redeem = pushes
                .pop()
                .ok_or_else(|| WalletError::verify(index, "empty scriptSig"))?;
            if hash160(&redeem)[..] != *committed {
                return Err(WalletError::verify(index, "redeem script does not match P2SH hash"));
            }
            if classify(&redeem) == ScriptType::P2WPKH {
                if !pushes.is_empty() {
                    return Err(WalletError::verify(index, "extra pushes before redeem script"));
                }
                let [sig, pubkey] = two_items(index, witness.to_vec())?;
                if hash160(&pubkey)[..] != redeem[2..] {
                    return Err(WalletError::verify(index, "public key does not match redeem script"));
                }
                (
                    SpendPath::P2shP2wpkh {
                        pubkey_hash: to_hash20(&redeem[2..]),
                    },
                    vec![sig],
                    vec![pubkey],
                )
            } else {
                let redeem = RedeemScript::parse(&redeem)?;
                let sigs = multisig_sigs(index, pushes)?;
                let keys = redeem.pubkeys().to_vec();
                (SpendPath::P2shMultisig(redeem), sigs, keys)
            }
        }
        ScriptType::P2WSH => {
            if !input.script_sig.is_empty() {
                return Err(WalletError::verify(index, "native witness input has a scriptSig"));
            }
            let mut stack = witness.to_vec();
            let witness_script = stack
                .pop()
                .ok_or_else(|| WalletError::verify(index, "empty witness"))?;
            if sha256(&witness_script)[..] != *committed {
                return Err(WalletError::verify(index, "witness script does not match P2WSH hash"));
            }
            let redeem = RedeemScript::parse(&witness_script)?;
            let sigs = multisig_sigs(index, stack)?;
            let keys = redeem.pubkeys().to_vec();
            (SpendPath::P2wshMultisig(redeem), sigs, keys)
        }
        other => {
            return Err(WalletError::UnsupportedScript {
                index,
                script_type: other.type_name().to_string(),
            })
        }
    };

    let required = match &path {
        SpendPath::P2shMultisig(redeem) | SpendPath::P2wshMultisig(redeem) => {
            redeem.threshold() as usize
        }
        _ => 1,
    };
    if sigs.len() != required {
        return Err(WalletError::verify(
            index,
            format!("expected {} signatures, found {}", required, sigs.len()),
        ));
    }

    // CHECKMULTISIG order: each signature matches a later key than the previous one
    let mut keys = pubkeys.iter();
    for sig in &sigs {
        let (sighash_type, compact) = split_signature(index, sig)?;
        let digest = path.sighash(hasher, tx, index, unlock, sighash_type)?;
        if !keys.any(|key| verify_digest(key, &digest, &compact)) {
            return Err(WalletError::verify(index, "signature does not verify"));
        }
    }
    Ok(())
}

fn two_items(index: usize, items: Vec<Vec<u8>>) -> Result<[Vec<u8>; 2], WalletError> {
    items
        .try_into()
        .map_err(|_| WalletError::verify(index, "expected signature and public key"))
}

/// Strip the CHECKMULTISIG dummy element and return the signatures
fn multisig_sigs(index: usize, mut items: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, WalletError> {
    if items.is_empty() || !items[0].is_empty() {
        return Err(WalletError::verify(index, "missing CHECKMULTISIG dummy element"));
    }
    items.remove(0);
    Ok(items)
}

fn split_signature(index: usize, sig: &[u8]) -> Result<(SigHashType, [u8; 64]), WalletError> {
    let (type_byte, der) = sig
        .split_last()
        .ok_or_else(|| WalletError::verify(index, "empty signature"))?;
    let sighash_type = SigHashType::from_byte(*type_byte)?;
    let compact = der_decode(der).map_err(|source| WalletError::Signature { index, source })?;
    Ok((sighash_type, compact))
}

// =============================================================================
// Tests
// =============================================================================
