//! ECDSA key management and signing over secp256k1
//!
//! Signatures are produced as raw 64-byte `r || s` values with the low-S
//! rule enforced, and converted to strict DER when they are placed into a
//! scriptSig or witness.

use rand::rngs::OsRng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::hash160;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid DER encoding: {0}")]
    InvalidDer(String),
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from 32 raw secret bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, KeyError> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(secret).map_err(|_| KeyError::InvalidPrivateKey)?;
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidPrivateKey)?;
        Self::from_secret_bytes(&secret)
    }

    /// Raw secret scalar; callers should wrap it in `Zeroizing`
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret_key.secret_bytes()
    }

    /// Compressed SEC1 public key
    pub fn public_key_bytes(&self) -> [u8; 33] {
        self.public_key.serialize()
    }

    /// Get the public key as a hex string (compressed format)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// HASH160 of the compressed public key
    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.public_key.serialize())
    }

    /// Sign a 32-byte digest, returning a low-S `r || s`
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<[u8; 64], KeyError> {
        sign_digest(&self.secret_key.secret_bytes(), digest)
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret_key.non_secure_erase();
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a compressed (33-byte) or uncompressed (65-byte) public key
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, KeyError> {
    if bytes.len() != 33 && bytes.len() != 65 {
        return Err(KeyError::InvalidPublicKey);
    }
    PublicKey::from_slice(bytes).map_err(|_| KeyError::InvalidPublicKey)
}

/// Sign a digest with raw secret bytes.
///
/// The secp256k1 secret is erased before returning; the caller remains
/// responsible for zeroing `secret` itself.
pub fn sign_digest(secret: &[u8; 32], digest: &[u8; 32]) -> Result<[u8; 64], KeyError> {
    let secp = Secp256k1::signing_only();
    let mut secret_key =
        SecretKey::from_slice(secret).map_err(|_| KeyError::InvalidPrivateKey)?;
    let message = Message::from_digest_slice(digest)?;
    let mut signature = secp.sign_ecdsa(&message, &secret_key);
    secret_key.non_secure_erase();

    signature.normalize_s();
    Ok(signature.serialize_compact())
}

/// Verify a compact `r || s` signature over a digest.
///
/// High-S signatures are rejected, as are malformed keys and signatures.
pub fn verify_digest(pubkey: &[u8], digest: &[u8; 32], signature: &[u8; 64]) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(public_key) = parse_public_key(pubkey) else {
        return false;
    };
    let Ok(message) = Message::from_digest_slice(digest) else {
        return false;
    };
    let Ok(sig) = Signature::from_compact(signature) else {
        return false;
    };
    secp.verify_ecdsa(&message, &sig, &public_key).is_ok()
}

/// Whether `s <= n/2`; false for values that are not valid signatures
pub fn is_low_s(signature: &[u8; 64]) -> bool {
    let Ok(sig) = Signature::from_compact(signature) else {
        return false;
    };
    let mut normalized = sig;
    normalized.normalize_s();
    normalized == sig
}

/// Replace `s` with `n - s` when `s` is in the upper half of the order
pub fn normalize_s(signature: &mut [u8; 64]) -> Result<(), KeyError> {
    let mut sig = Signature::from_compact(signature)?;
    sig.normalize_s();
    *signature = sig.serialize_compact();
    Ok(())
}

/// Strict DER encoding of a compact signature
pub fn der_encode(signature: &[u8; 64]) -> Result<Vec<u8>, KeyError> {
    let sig = Signature::from_compact(signature).map_err(|_| KeyError::InvalidSignature)?;
    Ok(sig.serialize_der().to_vec())
}

/// Parse a strict DER signature back into compact form
pub fn der_decode(der: &[u8]) -> Result<[u8; 64], KeyError> {
    let sig = Signature::from_der(der).map_err(|e| KeyError::InvalidDer(e.to_string()))?;
    Ok(sig.serialize_compact())
}
