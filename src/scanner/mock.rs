//! In-memory chain backend and observer for deterministic scanner tests

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::observer::{BlockObserver, NotifyError};
use super::pipeline::ExtractedRecord;
use super::rpc::{BlockHeader, BlockInfo, ChainRpc, RpcError, TxDetail, TxOutInfo, TxVin, TxVout};

/// A payment of `amount` to `address` from a coinbase-like input
pub fn payment(txid: &str, address: &str, amount: u64) -> TxDetail {
    TxDetail {
        txid: txid.to_string(),
        vins: vec![TxVin::default()],
        vouts: vec![TxVout {
            n: 0,
            address: Some(address.to_string()),
            lock_script_hex: String::new(),
            amount,
        }],
        ..Default::default()
    }
}

/// A spend of `prev_txid:prev_vout` whose input the backend does not resolve
pub fn spend(txid: &str, prev_txid: &str, prev_vout: u32, outputs: &[(&str, u64)]) -> TxDetail {
    TxDetail {
        txid: txid.to_string(),
        vins: vec![TxVin {
            prev_txid: Some(prev_txid.to_string()),
            prev_vout: Some(prev_vout),
            address: None,
            amount: None,
        }],
        vouts: outputs
            .iter()
            .enumerate()
            .map(|(n, (address, amount))| TxVout {
                n: n as u32,
                address: Some(address.to_string()),
                lock_script_hex: String::new(),
                amount: *amount,
            })
            .collect(),
        ..Default::default()
    }
}

#[derive(Debug, Default)]
struct MockState {
    /// Main chain by height
    chain: BTreeMap<u64, BlockInfo>,
    /// Every block ever produced, including orphans
    blocks: HashMap<String, BlockInfo>,
    transactions: HashMap<String, TxDetail>,
    mempool: Vec<String>,
    tx_failures: HashMap<String, RpcError>,
    /// Served by `get_tx_out` only, like a node without a transaction index
    unindexed: HashSet<String>,
    block_failures: HashSet<u64>,
    fail_tip: bool,
    generation: u64,
    broadcasted: Vec<String>,
    fee_rate: Decimal,
    transaction_calls: usize,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Scriptable chain backend
#[derive(Debug, Clone)]
pub struct MockChainRpc {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockChainRpc {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainRpc {
    /// A chain holding only an empty genesis block at height 0
    pub fn new() -> Self {
        let mock = Self {
            state: Arc::new(Mutex::new(MockState {
                fee_rate: Decimal::new(1, 3),
                ..Default::default()
            })),
        };
        mock.push_block(&[]);
        mock
    }

    pub fn block_hash_for(height: u64, generation: u64) -> String {
        format!("blk-{}-{}", height, generation)
    }

    /// Append a block with the given transactions and return it
    pub fn push_block(&self, transactions: &[TxDetail]) -> BlockInfo {
        let mut state = self.state.lock().unwrap();
        let height = state.chain.keys().next_back().map(|h| h + 1).unwrap_or(0);
        let prev_hash = state
            .chain
            .get(&height.wrapping_sub(1))
            .map(|b| b.hash.clone())
            .unwrap_or_default();
        let block = BlockInfo {
            height,
            hash: Self::block_hash_for(height, state.generation),
            prev_hash,
            txids: transactions.iter().map(|t| t.txid.clone()).collect(),
        };
        for tx in transactions {
            let mut tx = tx.clone();
            tx.block_hash = Some(block.hash.clone());
            tx.block_height = Some(height);
            state.transactions.insert(tx.txid.clone(), tx);
        }
        state.chain.insert(height, block.clone());
        state.blocks.insert(block.hash.clone(), block.clone());
        block
    }

    /// Append `count` empty blocks
    pub fn mine(&self, count: usize) {
        for _ in 0..count {
            self.push_block(&[]);
        }
    }

    /// Drop the main chain from `height` up; later blocks get fresh hashes
    pub fn reorg_from(&self, height: u64) {
        let mut state = self.state.lock().unwrap();
        state.chain.retain(|h, _| *h < height);
        state.generation += 1;
    }

    pub fn tip(&self) -> BlockInfo {
        let state = self.state.lock().unwrap();
        state.chain.values().next_back().cloned().unwrap_or_else(|| BlockInfo {
            height: 0,
            hash: String::new(),
            prev_hash: String::new(),
            txids: Vec::new(),
        })
    }

    pub fn block_at(&self, height: u64) -> Option<BlockInfo> {
        self.state.lock().unwrap().chain.get(&height).cloned()
    }

    pub fn add_transaction(&self, tx: TxDetail) {
        self.state
            .lock()
            .unwrap()
            .transactions
            .insert(tx.txid.clone(), tx);
    }

    /// Add transactions to the mempool, replacing the previous contents
    pub fn set_mempool(&self, transactions: &[TxDetail]) {
        let mut state = self.state.lock().unwrap();
        state.mempool = transactions.iter().map(|t| t.txid.clone()).collect();
        for tx in transactions {
            state.transactions.insert(tx.txid.clone(), tx.clone());
        }
    }

    /// Fail every fetch of `txid` until cleared
    pub fn fail_transaction(&self, txid: &str, error: RpcError) {
        self.state
            .lock()
            .unwrap()
            .tx_failures
            .insert(txid.to_string(), error);
    }

    /// Hide `txid` from `get_transaction` while keeping its outputs visible to `get_tx_out`
    pub fn unindex_transaction(&self, txid: &str) {
        self.state.lock().unwrap().unindexed.insert(txid.to_string());
    }

    pub fn clear_transaction_failure(&self, txid: &str) {
        self.state.lock().unwrap().tx_failures.remove(txid);
    }

    /// Fail block hash lookups at `height` until cleared
    pub fn fail_block_at(&self, height: u64) {
        self.state.lock().unwrap().block_failures.insert(height);
    }

    pub fn clear_block_failures(&self) {
        self.state.lock().unwrap().block_failures.clear();
    }

    pub fn fail_tip(&self, fail: bool) {
        self.state.lock().unwrap().fail_tip = fail;
    }

    pub fn set_fee_rate(&self, rate: Decimal) {
        self.state.lock().unwrap().fee_rate = rate;
    }

    pub fn broadcasted(&self) -> Vec<String> {
        self.state.lock().unwrap().broadcasted.clone()
    }

    pub fn transaction_calls(&self) -> usize {
        self.state.lock().unwrap().transaction_calls
    }

    /// Most `get_transaction` calls ever running at once
    pub fn peak_in_flight(&self) -> usize {
        self.state.lock().unwrap().peak_in_flight
    }

    fn lookup_transaction(&self, txid: &str) -> Result<TxDetail, RpcError> {
        let mut state = self.state.lock().unwrap();
        state.transaction_calls += 1;
        if let Some(error) = state.tx_failures.get(txid) {
            return Err(error.clone());
        }
        let not_found = || RpcError::Remote {
            code: -5,
            message: "No information available about transaction".into(),
        };
        if state.unindexed.contains(txid) {
            return Err(not_found());
        }
        state.transactions.get(txid).cloned().ok_or_else(not_found)
    }
}

#[async_trait]
impl ChainRpc for MockChainRpc {
    async fn get_block_height(&self) -> Result<u64, RpcError> {
        let state = self.state.lock().unwrap();
        if state.fail_tip {
            return Err(RpcError::Transport("node unreachable".into()));
        }
        Ok(state.chain.keys().next_back().copied().unwrap_or(0))
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        let state = self.state.lock().unwrap();
        if state.block_failures.contains(&height) {
            return Err(RpcError::Transport(format!("timeout fetching block {}", height)));
        }
        state
            .chain
            .get(&height)
            .map(|b| b.hash.clone())
            .ok_or_else(|| RpcError::Remote {
                code: -8,
                message: "Block height out of range".into(),
            })
    }

    async fn get_block(&self, hash: &str) -> Result<BlockInfo, RpcError> {
        let state = self.state.lock().unwrap();
        state
            .blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| RpcError::NotFound(format!("block {}", hash)))
    }

    async fn get_transaction(&self, txid: &str) -> Result<TxDetail, RpcError> {
        {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
        }
        // let other workers start before this call finishes
        tokio::task::yield_now().await;
        let result = self.lookup_transaction(txid);
        self.state.lock().unwrap().in_flight -= 1;
        result
    }

    async fn get_tx_out(&self, txid: &str, vout: u32) -> Result<Option<TxOutInfo>, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(state.transactions.get(txid).and_then(|tx| {
            tx.vouts.iter().find(|v| v.n == vout).map(|v| TxOutInfo {
                lock_script_hex: v.lock_script_hex.clone(),
                amount: v.amount,
                confirmations: tx.confirmations,
            })
        }))
    }

    async fn get_mempool_txids(&self) -> Result<Vec<String>, RpcError> {
        Ok(self.state.lock().unwrap().mempool.clone())
    }

    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String, RpcError> {
        let txid = crate::core::RawTransaction::from_hex(tx_hex)
            .map_err(|e| RpcError::Remote {
                code: -22,
                message: format!("TX decode failed: {}", e),
            })?
            .txid();
        self.state
            .lock()
            .unwrap()
            .broadcasted
            .push(tx_hex.to_string());
        Ok(txid.to_string())
    }

    async fn estimate_fee_rate(&self) -> Result<Decimal, RpcError> {
        Ok(self.state.lock().unwrap().fee_rate)
    }
}

// =============================================================================
// Recording observer
// =============================================================================

#[derive(Debug, Default)]
struct Recorded {
    blocks: Vec<(BlockHeader, bool)>,
    records: Vec<ExtractedRecord>,
    rejected_keys: HashSet<String>,
    rejections: usize,
}

/// Observer that keeps every notification and can reject chosen watchers
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject records for `source_key` until accepted again
    pub fn reject(&self, source_key: &str) {
        self.inner
            .lock()
            .unwrap()
            .rejected_keys
            .insert(source_key.to_string());
    }

    pub fn accept(&self, source_key: &str) {
        self.inner.lock().unwrap().rejected_keys.remove(source_key);
    }

    pub fn blocks(&self) -> Vec<(BlockHeader, bool)> {
        self.inner.lock().unwrap().blocks.clone()
    }

    pub fn records(&self) -> Vec<ExtractedRecord> {
        self.inner.lock().unwrap().records.clone()
    }

    pub fn rejections(&self) -> usize {
        self.inner.lock().unwrap().rejections
    }
}

#[async_trait]
impl BlockObserver for RecordingObserver {
    async fn on_block_scanned(&self, header: &BlockHeader, is_fork: bool) {
        self.inner
            .lock()
            .unwrap()
            .blocks
            .push((header.clone(), is_fork));
    }

    async fn on_extracted_record(&self, source_key: &str, record: ExtractedRecord) -> Result<(), NotifyError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.rejected_keys.contains(source_key) {
            inner.rejections += 1;
            return Err(NotifyError::new(format!("{} is not accepting records", source_key)));
        }
        inner.records.push(record);
        Ok(())
    }
}
