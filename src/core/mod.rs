//! Core transaction components
//!
//! This module contains the chain-agnostic building blocks:
//! - CompactSize varint and amount conversion
//! - Script classification and push encoding (P2PKH, P2SH, P2WPKH, P2WSH)
//! - Address codec (Base58Check, Bech32/Bech32m)
//! - Raw transaction codec (segwit-aware)
//! - Signature hashes (legacy and BIP143)
//! - Fee rate and size estimation

pub mod address;
pub mod amount;
pub mod fee;
pub mod script;
pub mod sighash;
pub mod transaction;
pub mod varint;

pub use address::{
    address_for_script, address_to_hash, hash_to_address, lock_script_for, Address, AddressConfig,
    AddressError,
};
pub use amount::{from_base_units, to_base_units, AmountError, DEFAULT_DECIMALS};
pub use fee::{estimate_fee, estimate_size, FeeRate, INPUT_BYTES, OUTPUT_BYTES, TX_OVERHEAD_BYTES};
pub use script::{classify, ScriptError, ScriptType, MAX_SCRIPT_ELEMENT_SIZE};
pub use sighash::{legacy_sighash, segwit_sighash, Bip143Hasher, SigHashError, SigHashType};
pub use transaction::{
    sequence_for, RawTransaction, TransactionError, TxInput, TxOutput, Txid, LOCKTIME_THRESHOLD,
    SEQUENCE_FINAL, SEQUENCE_LOCKTIME, SEQUENCE_RBF, TX_VERSION,
};
