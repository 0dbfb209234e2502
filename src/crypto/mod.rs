//! Cryptographic utilities
//!
//! This module provides:
//! - SHA-256, double SHA-256 and HASH160
//! - ECDSA key management and signing (secp256k1, low-S, DER)

pub mod hash;
pub mod keys;

pub use hash::{checksum, double_sha256, double_sha256_hex, hash160, sha256};
pub use keys::{
    der_decode, der_encode, is_low_s, normalize_s, parse_public_key, sign_digest, verify_digest,
    KeyError, KeyPair,
};
