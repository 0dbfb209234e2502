//! utxo-wallet: transaction engine and block scanner for Bitcoin-like chains
//!
//! This crate provides:
//! - Script, address and raw transaction codecs (CompactSize, segwit, Bech32/Bech32m)
//! - Legacy and BIP143 signature hashes with every sighash type
//! - ECDSA signing and verification (secp256k1, RFC6979, low-S, DER)
//! - Coin selection with fixed-point fee convergence
//! - P2SH and P2WSH multisig redeem scripts
//! - One wallet engine for many chains via `AddressConfig` and `ChainQuirks`
//! - A block scanner with fork rollback, mempool scanning and a retry queue
//!
//! # Example
//!
//! ```rust
//! use utxo_wallet::core::{Address, AddressConfig};
//! use utxo_wallet::crypto::KeyPair;
//!
//! let key = KeyPair::generate();
//! let address = Address::P2pkh(key.pubkey_hash())
//!     .encode(&AddressConfig::qtum())
//!     .unwrap();
//! assert!(address.starts_with('Q'));
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod multisig;
pub mod scanner;
pub mod storage;
pub mod wallet;

// Re-export commonly used types
pub use config::{ChainConfig, ConfigError, ScannerConfig, WalletConfig};
pub use core::{Address, AddressConfig, FeeRate, RawTransaction, ScriptType, SigHashType, Txid};
pub use crypto::KeyPair;
pub use multisig::{build_redeem_script, MultisigKind, RedeemScript};
pub use scanner::{AddressRegistry, BlockObserver, BlockScanner, ChainRpc, ExtractedRecord, TickReport};
pub use storage::{JsonFileStore, MemoryScanStore, ScanStore};
pub use wallet::{ChainQuirks, Destination, UnlockDescriptor, UnspentOutput, WalletError, WalletManager};
