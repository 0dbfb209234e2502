//! Address codec
//!
//! Base58Check (version byte + payload + 4-byte double-SHA256 checksum)
//! for P2PKH/P2SH and Bech32/Bech32m (BIP173/BIP350) for witness programs.
//! Chain differences are carried by [`AddressConfig`].

use bech32::{FromBase32, ToBase32, Variant};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::script::{self, ScriptType};
use crate::crypto::checksum;

// =============================================================================
// Errors
// =============================================================================

/// Address decode/encode errors
#[derive(Error, Debug)]
pub enum AddressError {
    #[error("Invalid Base58 encoding: {0}")]
    Base58(#[from] bs58::decode::Error),
    #[error("Invalid Bech32 encoding: {0}")]
    Bech32(#[from] bech32::Error),
    #[error("Invalid checksum")]
    InvalidChecksum,
    #[error("Invalid payload length: {0}")]
    InvalidLength(usize),
    #[error("Unknown version byte: 0x{0:02x}")]
    UnknownVersion(u8),
    #[error("Wrong human-readable prefix: expected {expected}, found {found}")]
    WrongHrp { expected: String, found: String },
    #[error("Witness version {version} must use {expected:?} checksum")]
    WrongVariant { version: u8, expected: Variant },
    #[error("Invalid witness version: {0}")]
    InvalidWitnessVersion(u8),
    #[error("Segwit addresses are not supported on this chain")]
    SegwitUnsupported,
    #[error("Script has no address form")]
    NonStandardScript,
}

// =============================================================================
// Address Config
// =============================================================================

/// Per-chain address parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressConfig {
    pub p2pkh_version: u8,
    pub p2sh_version: u8,
    /// Human-readable prefix for Bech32 addresses
    pub bech32_hrp: String,
    /// Whether the chain accepts witness outputs
    pub segwit: bool,
}

impl AddressConfig {
    pub fn bitcoin() -> Self {
        Self {
            p2pkh_version: 0x00,
            p2sh_version: 0x05,
            bech32_hrp: "bc".to_string(),
            segwit: true,
        }
    }

    pub fn bitcoin_testnet() -> Self {
        Self {
            p2pkh_version: 0x6f,
            p2sh_version: 0xc4,
            bech32_hrp: "tb".to_string(),
            segwit: true,
        }
    }

    pub fn qtum() -> Self {
        Self {
            p2pkh_version: 0x3a,
            p2sh_version: 0x32,
            bech32_hrp: "qc".to_string(),
            segwit: true,
        }
    }

    pub fn qtum_testnet() -> Self {
        Self {
            p2pkh_version: 0x78,
            p2sh_version: 0x6e,
            bech32_hrp: "tq".to_string(),
            segwit: true,
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "bitcoin" | "btc" => Some(Self::bitcoin()),
            "bitcoin-testnet" | "btc-testnet" => Some(Self::bitcoin_testnet()),
            "qtum" => Some(Self::qtum()),
            "qtum-testnet" => Some(Self::qtum_testnet()),
            _ => None,
        }
    }
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self::bitcoin()
    }
}

const BECH32_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Single-case string of the form `<hrp>1<charset data>` for this chain's HRP.
/// Base58 addresses can start with the HRP and a '1' too, e.g. QTUM "Qc1...".
fn looks_like_bech32(address: &str, config: &AddressConfig) -> bool {
    if config.bech32_hrp.is_empty() {
        return false;
    }
    let lower = address.to_lowercase();
    if address != lower && address != address.to_uppercase() {
        return false;
    }
    match lower.rfind('1') {
        Some(separator) => {
            lower[..separator] == config.bech32_hrp.to_lowercase()
                && lower[separator + 1..].chars().all(|c| BECH32_CHARSET.contains(c))
        }
        None => false,
    }
}

// =============================================================================
// Address
// =============================================================================

/// A decoded address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    P2pkh([u8; 20]),
    P2sh([u8; 20]),
    Witness { version: u8, program: Vec<u8> },
}

impl Address {
    /// Parse an address string under the given chain parameters
    pub fn decode(address: &str, config: &AddressConfig) -> Result<Self, AddressError> {
        if !looks_like_bech32(address, config) {
            return Self::decode_base58(address, config);
        }
        if !config.segwit {
            return Self::decode_base58(address, config).map_err(|_| AddressError::SegwitUnsupported);
        }
        Self::decode_bech32(address, config)
            .or_else(|e| Self::decode_base58(address, config).map_err(|_| e))
    }

    fn decode_base58(address: &str, config: &AddressConfig) -> Result<Self, AddressError> {
        let data = bs58::decode(address).into_vec()?;
        if data.len() != 25 {
            return Err(AddressError::InvalidLength(data.len()));
        }
        let (payload, check) = data.split_at(21);
        if checksum(payload) != check {
            return Err(AddressError::InvalidChecksum);
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        match payload[0] {
            v if v == config.p2pkh_version => Ok(Address::P2pkh(hash)),
            v if v == config.p2sh_version => Ok(Address::P2sh(hash)),
            v => Err(AddressError::UnknownVersion(v)),
        }
    }

    fn decode_bech32(address: &str, config: &AddressConfig) -> Result<Self, AddressError> {
        let (hrp, data, variant) = bech32::decode(address)?;
        if hrp != config.bech32_hrp.to_lowercase() {
            return Err(AddressError::WrongHrp {
                expected: config.bech32_hrp.clone(),
                found: hrp,
            });
        }
        let (version, program) = data.split_first().ok_or(AddressError::InvalidLength(0))?;
        let version = version.to_u8();
        if version > 16 {
            return Err(AddressError::InvalidWitnessVersion(version));
        }
        let expected = variant_for(version);
        if variant != expected {
            return Err(AddressError::WrongVariant { version, expected });
        }

        let program = Vec::<u8>::from_base32(program)?;
        check_program(version, &program)?;
        Ok(Address::Witness { version, program })
    }

    /// Render the address under the given chain parameters
    pub fn encode(&self, config: &AddressConfig) -> Result<String, AddressError> {
        match self {
            Address::P2pkh(hash) => Ok(encode_base58check(config.p2pkh_version, hash)),
            Address::P2sh(hash) => Ok(encode_base58check(config.p2sh_version, hash)),
            Address::Witness { version, program } => {
                if !config.segwit {
                    return Err(AddressError::SegwitUnsupported);
                }
                check_program(*version, program)?;
                let mut data = vec![bech32::u5::try_from_u8(*version)?];
                data.extend(program.to_base32());
                Ok(bech32::encode(&config.bech32_hrp, data, variant_for(*version))?)
            }
        }
    }

    /// Lock script paying to this address
    pub fn lock_script(&self) -> Vec<u8> {
        match self {
            Address::P2pkh(hash) => script::p2pkh_script(hash),
            Address::P2sh(hash) => script::p2sh_script(hash),
            Address::Witness { version, program } => {
                let mut out = Vec::with_capacity(2 + program.len());
                out.push(script::small_int_opcode(*version));
                out.push(program.len() as u8);
                out.extend_from_slice(program);
                out
            }
        }
    }

    /// Address form of a standard lock script
    pub fn from_lock_script(lock_script: &[u8]) -> Option<Self> {
        let hash = script::extract_hash(lock_script)?;
        match script::classify(lock_script) {
            ScriptType::P2PKH => Some(Address::P2pkh(hash.try_into().ok()?)),
            ScriptType::P2SH => Some(Address::P2sh(hash.try_into().ok()?)),
            ScriptType::P2WPKH | ScriptType::P2WSH => Some(Address::Witness {
                version: 0,
                program: hash.to_vec(),
            }),
            ScriptType::WitnessProgram { version } => Some(Address::Witness {
                version,
                program: hash.to_vec(),
            }),
            ScriptType::NullData | ScriptType::Unknown => None,
        }
    }

    pub fn script_type(&self) -> ScriptType {
        script::classify(&self.lock_script())
    }

    /// The committed hash or witness program
    pub fn payload(&self) -> &[u8] {
        match self {
            Address::P2pkh(hash) | Address::P2sh(hash) => hash,
            Address::Witness { program, .. } => program,
        }
    }
}

fn variant_for(version: u8) -> Variant {
    if version == 0 {
        Variant::Bech32
    } else {
        Variant::Bech32m
    }
}

fn check_program(version: u8, program: &[u8]) -> Result<(), AddressError> {
    let valid = match version {
        0 => program.len() == 20 || program.len() == 32,
        1..=16 => (2..=40).contains(&program.len()),
        _ => return Err(AddressError::InvalidWitnessVersion(version)),
    };
    if valid {
        Ok(())
    } else {
        Err(AddressError::InvalidLength(program.len()))
    }
}

fn encode_base58check(version: u8, hash: &[u8; 20]) -> String {
    let mut data = Vec::with_capacity(25);
    data.push(version);
    data.extend_from_slice(hash);
    let check = checksum(&data);
    data.extend_from_slice(&check);
    bs58::encode(data).into_string()
}

// =============================================================================
// Convenience functions
// =============================================================================

/// Hash (or witness program) committed to by an address
pub fn address_to_hash(address: &str, config: &AddressConfig) -> Result<Vec<u8>, AddressError> {
    Ok(Address::decode(address, config)?.payload().to_vec())
}

/// Address for a 20-byte key/script hash or witness program of the given type
pub fn hash_to_address(
    hash: &[u8],
    script_type: ScriptType,
    config: &AddressConfig,
) -> Result<String, AddressError> {
    let hash20 = || -> Result<[u8; 20], AddressError> {
        hash.try_into().map_err(|_| AddressError::InvalidLength(hash.len()))
    };
    let address = match script_type {
        ScriptType::P2PKH => Address::P2pkh(hash20()?),
        ScriptType::P2SH => Address::P2sh(hash20()?),
        ScriptType::P2WPKH | ScriptType::P2WSH => Address::Witness {
            version: 0,
            program: hash.to_vec(),
        },
        ScriptType::WitnessProgram { version } => Address::Witness {
            version,
            program: hash.to_vec(),
        },
        ScriptType::NullData | ScriptType::Unknown => return Err(AddressError::NonStandardScript),
    };
    address.encode(config)
}

/// Lock script paying to an address string
pub fn lock_script_for(address: &str, config: &AddressConfig) -> Result<Vec<u8>, AddressError> {
    Ok(Address::decode(address, config)?.lock_script())
}

/// Address string for a lock script, if it has one
pub fn address_for_script(lock_script: &[u8], config: &AddressConfig) -> Option<String> {
    Address::from_lock_script(lock_script)?.encode(config).ok()
}

// =============================================================================
// Tests
// =============================================================================
