//! Multi-signature redeem scripts
//!
//! Provides M-of-N CHECKMULTISIG scripts that M signatures from N listed
//! keys can spend, committed to through P2SH or P2WSH outputs.
//!
//! # Example
//!
//! ```ignore
//! use utxo_wallet::multisig::{build_redeem_script, MultisigKind};
//! use utxo_wallet::core::AddressConfig;
//!
//! // Create a 2-of-3 P2SH address
//! let (address, redeem_hex) =
//!     build_redeem_script(2, vec![pk1, pk2, pk3], MultisigKind::P2sh, &AddressConfig::bitcoin())?;
//! ```

pub mod redeem;

pub use redeem::{build_redeem_script, MultisigError, MultisigKind, RedeemScript, MAX_MULTISIG_KEYS};
