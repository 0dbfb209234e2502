//! Chain backend interface
//!
//! Implemented per chain over full-node JSON-RPC or an explorer REST API.
//! Amounts cross this boundary in base units; hashes and txids as the hex
//! strings the backend prints.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bitcoin Core's "No information available about transaction" code
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

/// Backend errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    /// Whether the backend reports the object as permanently unknown
    pub fn is_not_found(&self) -> bool {
        match self {
            RpcError::NotFound(_) => true,
            RpcError::Remote { code, .. } => *code == RPC_INVALID_ADDRESS_OR_KEY,
            _ => false,
        }
    }
}

/// Block summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    pub txids: Vec<String>,
}

impl BlockInfo {
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            height: self.height,
            hash: self.hash.clone(),
            prev_hash: self.prev_hash.clone(),
        }
    }
}

/// The part of a block kept locally for fork detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
}

/// Transaction input as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxVin {
    /// Spent transaction; `None` for coinbase inputs
    pub prev_txid: Option<String>,
    pub prev_vout: Option<u32>,
    /// Address of the spent output when the backend resolves it
    pub address: Option<String>,
    /// Amount of the spent output when the backend resolves it
    pub amount: Option<u64>,
}

impl TxVin {
    pub fn is_coinbase(&self) -> bool {
        self.prev_txid.is_none()
    }
}

/// Transaction output as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxVout {
    pub n: u32,
    pub address: Option<String>,
    pub lock_script_hex: String,
    pub amount: u64,
}

/// Transaction detail
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxDetail {
    pub txid: String,
    pub vins: Vec<TxVin>,
    pub vouts: Vec<TxVout>,
    pub confirmations: u64,
    /// `None` while in the mempool
    pub block_hash: Option<String>,
    pub block_height: Option<u64>,
}

/// An unspent output looked up by outpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutInfo {
    pub lock_script_hex: String,
    pub amount: u64,
    pub confirmations: u64,
}

/// Chain backend operations used by the wallet and the scanner
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_block_height(&self) -> Result<u64, RpcError>;

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError>;

    async fn get_block(&self, hash: &str) -> Result<BlockInfo, RpcError>;

    async fn get_transaction(&self, txid: &str) -> Result<TxDetail, RpcError>;

    /// `None` when the output is spent or unknown
    async fn get_tx_out(&self, txid: &str, vout: u32) -> Result<Option<TxOutInfo>, RpcError>;

    async fn get_mempool_txids(&self) -> Result<Vec<String>, RpcError>;

    /// Broadcast a signed transaction, returning its txid
    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError>;

    /// Fee rate in coins per kilobyte
    async fn estimate_fee_rate(&self) -> Result<Decimal, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(RpcError::NotFound("tx".into()).is_not_found());
        assert!(RpcError::Remote {
            code: -5,
            message: "No information available about transaction".into()
        }
        .is_not_found());
        assert!(!RpcError::Remote {
            code: -28,
            message: "Loading block index".into()
        }
        .is_not_found());
        assert!(!RpcError::Transport("timeout".into()).is_not_found());
    }

    #[test]
    fn test_coinbase_vin() {
        assert!(TxVin::default().is_coinbase());
        let vin = TxVin {
            prev_txid: Some("ab".into()),
            prev_vout: Some(0),
            ..Default::default()
        };
        assert!(!vin.is_coinbase());
    }
}
