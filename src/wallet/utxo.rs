//! Spendable outputs and payment destinations

use serde::{Deserialize, Serialize};

use crate::core::script::{script_from_hex, ScriptError};
use crate::core::transaction::Txid;

/// An unspent output as reported by the chain backend.
///
/// Spend state is not tracked locally: an output stops being offered once
/// the backend no longer lists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub txid: Txid,
    pub vout: u32,
    pub address: String,
    pub lock_script_hex: String,
    /// Amount in base units
    pub amount: u64,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default = "default_spendable")]
    pub spendable: bool,
}

fn default_spendable() -> bool {
    true
}

impl UnspentOutput {
    pub fn new(txid: Txid, vout: u32, address: &str, lock_script: &[u8], amount: u64) -> Self {
        Self {
            txid,
            vout,
            address: address.to_string(),
            lock_script_hex: hex::encode(lock_script),
            amount,
            confirmations: 1,
            spendable: true,
        }
    }

    pub fn lock_script(&self) -> Result<Vec<u8>, ScriptError> {
        script_from_hex(&self.lock_script_hex)
    }

    /// `txid:vout` outpoint string
    pub fn outpoint(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }
}

/// A payment to one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub address: String,
    /// Amount in base units
    pub amount: u64,
}

impl Destination {
    pub fn new(address: &str, amount: u64) -> Self {
        Self {
            address: address.to_string(),
            amount,
        }
    }
}

/// Total amount of a set of outputs
pub fn total_amount(utxos: &[UnspentOutput]) -> u64 {
    utxos.iter().map(|u| u.amount).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_script_hex() {
        let utxo = UnspentOutput::new(Txid([1u8; 32]), 2, "addr", &[0x76, 0xa9], 500);
        assert_eq!(utxo.lock_script_hex, "76a9");
        assert_eq!(utxo.lock_script().unwrap(), vec![0x76, 0xa9]);
        assert!(utxo.outpoint().ends_with(":2"));
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{
            "txid": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            "vout": 0,
            "address": "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
            "lock_script_hex": "",
            "amount": 5000000000
        }"#;
        let utxo: UnspentOutput = serde_json::from_str(json).unwrap();
        assert!(utxo.spendable);
        assert_eq!(utxo.confirmations, 0);
        assert_eq!(total_amount(&[utxo.clone(), utxo]), 10_000_000_000);
    }
}
