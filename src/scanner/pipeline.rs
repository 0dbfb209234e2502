//! Bounded-concurrency transaction extraction
//!
//! Every txid of a batch gets its own task; a semaphore caps how many fetch
//! from the backend at once. The batch completes only when every submitted
//! txid has an outcome, in submission order.

use std::collections::{BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::registry::AddressLookup;
use super::rpc::{ChainRpc, RpcError, TxVout};
use crate::core::address::{address_for_script, AddressConfig};
use crate::storage::FailureKind;

// =============================================================================
// Records
// =============================================================================

/// Where a batch of transactions was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRef {
    /// 0 for the mempool
    pub height: u64,
    pub hash: Option<String>,
}

impl BlockRef {
    pub fn confirmed(height: u64, hash: &str) -> Self {
        Self {
            height,
            hash: Some(hash.to_string()),
        }
    }

    pub fn mempool() -> Self {
        Self { height: 0, hash: None }
    }
}

/// A resolved transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInput {
    pub prev_txid: Option<String>,
    pub prev_vout: Option<u32>,
    pub address: Option<String>,
    pub amount: Option<u64>,
    /// Watcher owning the spent output
    pub source_key: Option<String>,
}

/// A resolved transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutput {
    pub index: u32,
    pub address: Option<String>,
    pub amount: u64,
    pub source_key: Option<String>,
}

/// A transaction as seen by one watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub txid: String,
    pub block_height: u64,
    pub block_hash: Option<String>,
    pub source_key: String,
    pub inputs: Vec<RecordInput>,
    pub outputs: Vec<RecordOutput>,
    /// Inputs minus outputs; `None` if an input amount is unknown
    pub fee: Option<u64>,
}

impl ExtractedRecord {
    /// Total paid to this watcher's addresses
    pub fn received(&self) -> u64 {
        self.outputs
            .iter()
            .filter(|o| o.source_key.as_deref() == Some(self.source_key.as_str()))
            .map(|o| o.amount)
            .sum()
    }

    /// Total spent from this watcher's addresses
    pub fn spent(&self) -> u64 {
        self.inputs
            .iter()
            .filter(|i| i.source_key.as_deref() == Some(self.source_key.as_str()))
            .filter_map(|i| i.amount)
            .sum()
    }
}

/// A transaction that could not be extracted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionFailure {
    pub txid: String,
    pub kind: FailureKind,
    pub reason: String,
}

/// Result for one submitted txid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// Fetched; empty when no watched address is involved
    Extracted { txid: String, records: Vec<ExtractedRecord> },
    Failed(ExtractionFailure),
    /// Skipped because of shutdown
    Cancelled { txid: String },
}

impl TxOutcome {
    pub fn txid(&self) -> &str {
        match self {
            TxOutcome::Extracted { txid, .. } => txid,
            TxOutcome::Failed(failure) => &failure.txid,
            TxOutcome::Cancelled { txid } => txid,
        }
    }
}

/// All outcomes of one batch, in submission order
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub block: BlockRef,
    pub outcomes: Vec<TxOutcome>,
}

impl BatchResult {
    pub fn is_cancelled(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o, TxOutcome::Cancelled { .. }))
    }

    pub fn records(&self) -> impl Iterator<Item = &ExtractedRecord> {
        self.outcomes.iter().flat_map(|o| match o {
            TxOutcome::Extracted { records, .. } => records.as_slice(),
            _ => &[][..],
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExtractionFailure> {
        self.outcomes.iter().filter_map(|o| match o {
            TxOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
    }
}

// =============================================================================
// Pipeline
// =============================================================================

struct WorkerContext {
    rpc: Arc<dyn ChainRpc>,
    lookup: Arc<dyn AddressLookup>,
    address_config: AddressConfig,
}

/// Fans a batch of txids out to bounded workers and gathers the outcomes
pub struct ExtractionPipeline {
    context: Arc<WorkerContext>,
    concurrency: usize,
}

impl ExtractionPipeline {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        lookup: Arc<dyn AddressLookup>,
        address_config: AddressConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            context: Arc::new(WorkerContext {
                rpc,
                lookup,
                address_config,
            }),
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Extract every txid; returns exactly one outcome per submitted txid
    pub async fn extract(&self, block: BlockRef, txids: &[String], cancel: &CancellationToken) -> BatchResult {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut pending: HashSet<usize> = (0..txids.len()).collect();

        for (index, txid) in txids.iter().enumerate() {
            let context = self.context.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let block = block.clone();
            let txid = txid.clone();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let outcome = match permit {
                    None => TxOutcome::Cancelled { txid },
                    Some(_permit) => {
                        let work = extract_transaction(&context, &block, &txid);
                        let result = AssertUnwindSafe(work).catch_unwind().await;
                        match result {
                            Ok(outcome) => outcome,
                            Err(_) => TxOutcome::Failed(ExtractionFailure {
                                txid,
                                kind: FailureKind::Panic,
                                reason: "extraction worker panicked".to_string(),
                            }),
                        }
                    }
                };
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<TxOutcome>> = vec![None; txids.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if pending.remove(&index) {
                        slots[index] = Some(outcome);
                    }
                }
                Err(e) => warn!("Extraction task failed to join: {}", e),
            }
        }

        for index in pending {
            slots[index] = Some(TxOutcome::Failed(ExtractionFailure {
                txid: txids[index].clone(),
                kind: FailureKind::Panic,
                reason: "extraction task aborted".to_string(),
            }));
        }

        let outcomes: Vec<TxOutcome> = slots.into_iter().flatten().collect();
        debug!(
            "Extracted {} transactions at height {}",
            outcomes.len(),
            block.height
        );
        BatchResult { block, outcomes }
    }
}

fn failure(txid: &str, error: &RpcError) -> TxOutcome {
    let kind = if error.is_not_found() {
        FailureKind::TxNotFound
    } else {
        FailureKind::Rpc
    };
    TxOutcome::Failed(ExtractionFailure {
        txid: txid.to_string(),
        kind,
        reason: error.to_string(),
    })
}

async fn extract_transaction(context: &WorkerContext, block: &BlockRef, txid: &str) -> TxOutcome {
    let detail = match context.rpc.get_transaction(txid).await {
        Ok(detail) => detail,
        Err(e) => return failure(txid, &e),
    };

    let is_coinbase = detail.vins.iter().all(|v| v.is_coinbase());
    let mut inputs = Vec::with_capacity(detail.vins.len());
    for vin in &detail.vins {
        let resolved = resolve_input(
            context,
            vin.prev_txid.as_deref(),
            vin.prev_vout,
            vin.address.clone(),
            vin.amount,
        )
        .await;
        let (address, amount) = match resolved {
            Ok(resolved) => resolved,
            // the transaction itself exists, so only a retry can fix its inputs
            Err(e) => {
                return TxOutcome::Failed(ExtractionFailure {
                    txid: txid.to_string(),
                    kind: FailureKind::Rpc,
                    reason: format!("resolving input: {}", e),
                })
            }
        };
        inputs.push(RecordInput {
            prev_txid: vin.prev_txid.clone(),
            prev_vout: vin.prev_vout,
            address,
            amount,
            source_key: None,
        });
    }

    let mut outputs: Vec<RecordOutput> = detail
        .vouts
        .iter()
        .map(|vout| RecordOutput {
            index: vout.n,
            address: output_address(vout, &context.address_config),
            amount: vout.amount,
            source_key: None,
        })
        .collect();

    let mut keys = BTreeSet::new();
    for input in inputs.iter_mut() {
        if let Some(address) = &input.address {
            input.source_key = context.lookup.lookup(address).await;
            keys.extend(input.source_key.clone());
        }
    }
    for output in outputs.iter_mut() {
        if let Some(address) = &output.address {
            output.source_key = context.lookup.lookup(address).await;
            keys.extend(output.source_key.clone());
        }
    }

    let fee = if is_coinbase {
        Some(0)
    } else {
        let total_in: Option<u64> = inputs.iter().map(|i| i.amount).sum();
        let total_out: u64 = outputs.iter().map(|o| o.amount).sum();
        total_in.and_then(|t| t.checked_sub(total_out))
    };

    let records = keys
        .into_iter()
        .map(|source_key| ExtractedRecord {
            txid: detail.txid.clone(),
            block_height: block.height,
            block_hash: block.hash.clone(),
            source_key,
            inputs: inputs.clone(),
            outputs: outputs.clone(),
            fee,
        })
        .collect();

    TxOutcome::Extracted {
        txid: txid.to_string(),
        records,
    }
}

/// Fill in a spent output's address and amount from its transaction.
///
/// Nodes without a transaction index answer -5 for most previous
/// transactions; `get_tx_out` is tried next and the input is left
/// unresolved when neither knows the output.
async fn resolve_input(
    context: &WorkerContext,
    prev_txid: Option<&str>,
    prev_vout: Option<u32>,
    address: Option<String>,
    amount: Option<u64>,
) -> Result<(Option<String>, Option<u64>), RpcError> {
    let (Some(prev_txid), Some(prev_vout)) = (prev_txid, prev_vout) else {
        return Ok((address, amount));
    };
    if address.is_some() && amount.is_some() {
        return Ok((address, amount));
    }

    let config = &context.address_config;
    match context.rpc.get_transaction(prev_txid).await {
        Ok(previous) => {
            let vout = previous.vouts.iter().find(|v| v.n == prev_vout).ok_or_else(|| {
                RpcError::InvalidResponse(format!("{}:{} has no such output", prev_txid, prev_vout))
            })?;
            Ok((
                address.or_else(|| output_address(vout, config)),
                amount.or(Some(vout.amount)),
            ))
        }
        Err(e) if e.is_not_found() => match context.rpc.get_tx_out(prev_txid, prev_vout).await? {
            Some(out) => {
                let script_address = hex::decode(&out.lock_script_hex)
                    .ok()
                    .and_then(|script| address_for_script(&script, config));
                Ok((address.or(script_address), amount.or(Some(out.amount))))
            }
            None => {
                debug!("Input {}:{} unknown to the node, left unresolved", prev_txid, prev_vout);
                Ok((address, amount))
            }
        },
        Err(e) => Err(e),
    }
}

fn output_address(vout: &TxVout, config: &AddressConfig) -> Option<String> {
    if vout.address.is_some() {
        return vout.address.clone();
    }
    let script = hex::decode(&vout.lock_script_hex).ok()?;
    address_for_script(&script, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::mock::{payment, spend, MockChainRpc};
    use crate::scanner::registry::AddressRegistry;
    use async_trait::async_trait;

    async fn registry(entries: &[(&str, &str)]) -> Arc<AddressRegistry> {
        let registry = Arc::new(AddressRegistry::new());
        registry.register_many(entries.iter().copied()).await;
        registry
    }

    fn txids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("tx{}", i)).collect()
    }

    #[tokio::test]
    async fn test_every_txid_gets_one_outcome() {
        let rpc = Arc::new(MockChainRpc::new());
        let watched = registry(&[("addr-even", "even")]).await;

        for count in [0usize, 1, 50, 1000] {
            for (i, txid) in txids(count).iter().enumerate() {
                let to = if i % 2 == 0 { "addr-even" } else { "addr-odd" };
                rpc.add_transaction(payment(txid, to, 1_000));
            }
            let pipeline = ExtractionPipeline::new(rpc.clone(), watched.clone(), AddressConfig::bitcoin(), 4);
            let batch = pipeline
                .extract(BlockRef::confirmed(5, "h5"), &txids(count), &CancellationToken::new())
                .await;

            assert_eq!(batch.outcomes.len(), count);
            let seen: HashSet<&str> = batch.outcomes.iter().map(|o| o.txid()).collect();
            assert_eq!(seen.len(), count);
            for (i, outcome) in batch.outcomes.iter().enumerate() {
                assert_eq!(outcome.txid(), format!("tx{}", i));
            }
            assert_eq!(batch.records().count(), count.div_ceil(2));
            assert!(!batch.is_cancelled());
        }
    }

    #[tokio::test]
    async fn test_record_contents() {
        let rpc = Arc::new(MockChainRpc::new());
        rpc.add_transaction(payment("funding", "alice-addr", 50_000));
        // spend resolves its input through the funding transaction
        rpc.add_transaction(spend("pay", "funding", 0, &[("bob-addr", 30_000), ("alice-addr", 19_000)]));
        let watched = registry(&[("alice-addr", "alice"), ("bob-addr", "bob")]).await;

        let pipeline = ExtractionPipeline::new(rpc.clone(), watched, AddressConfig::bitcoin(), 2);
        let batch = pipeline
            .extract(BlockRef::confirmed(9, "h9"), &["pay".to_string()], &CancellationToken::new())
            .await;

        let records: Vec<_> = batch.records().collect();
        assert_eq!(records.len(), 2);
        let alice = records.iter().find(|r| r.source_key == "alice").unwrap();
        assert_eq!(alice.block_height, 9);
        assert_eq!(alice.block_hash.as_deref(), Some("h9"));
        assert_eq!(alice.spent(), 50_000);
        assert_eq!(alice.received(), 19_000);
        assert_eq!(alice.fee, Some(1_000));
        assert_eq!(alice.inputs[0].address.as_deref(), Some("alice-addr"));

        let bob = records.iter().find(|r| r.source_key == "bob").unwrap();
        assert_eq!(bob.received(), 30_000);
        assert_eq!(bob.spent(), 0);
    }

    #[tokio::test]
    async fn test_output_address_from_lock_script() {
        let rpc = Arc::new(MockChainRpc::new());
        let mut tx = payment("scripted", "ignored", 2_500);
        tx.vouts[0].address = None;
        // P2PKH for hash 751e76e8...; 1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH on mainnet
        tx.vouts[0].lock_script_hex = "76a914751e76e8199196d454941c45d1b3a323f1433bd688ac".to_string();
        rpc.add_transaction(tx);
        let watched = registry(&[("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH", "carol")]).await;

        let pipeline = ExtractionPipeline::new(rpc, watched, AddressConfig::bitcoin(), 1);
        let batch = pipeline
            .extract(BlockRef::mempool(), &["scripted".to_string()], &CancellationToken::new())
            .await;
        let record = batch.records().next().unwrap();
        assert_eq!(record.source_key, "carol");
        assert_eq!(record.block_height, 0);
        assert_eq!(record.block_hash, None);
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let rpc = Arc::new(MockChainRpc::new());
        rpc.add_transaction(payment("good", "a", 1));
        rpc.add_transaction(payment("flaky", "a", 1));
        rpc.fail_transaction("flaky", RpcError::Transport("connection reset".into()));
        let watched = registry(&[("a", "alice")]).await;

        let pipeline = ExtractionPipeline::new(rpc, watched, AddressConfig::bitcoin(), 3);
        let ids = vec!["good".to_string(), "flaky".to_string(), "missing".to_string()];
        let batch = pipeline
            .extract(BlockRef::confirmed(1, "h1"), &ids, &CancellationToken::new())
            .await;

        let failures: Vec<_> = batch.failures().collect();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].txid, "flaky");
        assert_eq!(failures[0].kind, FailureKind::Rpc);
        assert_eq!(failures[1].txid, "missing");
        assert_eq!(failures[1].kind, FailureKind::TxNotFound);
        assert_eq!(batch.records().count(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        for k in [1usize, 3, 8] {
            let rpc = Arc::new(MockChainRpc::new());
            for txid in txids(200) {
                rpc.add_transaction(payment(&txid, "a", 1));
            }
            let pipeline = ExtractionPipeline::new(rpc.clone(), registry(&[]).await, AddressConfig::bitcoin(), k);
            let batch = pipeline
                .extract(BlockRef::confirmed(1, "h1"), &txids(200), &CancellationToken::new())
                .await;

            assert_eq!(batch.outcomes.len(), 200);
            assert!(rpc.peak_in_flight() <= k, "peak {} above {}", rpc.peak_in_flight(), k);
            if k > 1 {
                assert!(rpc.peak_in_flight() > 1);
            }
        }
    }

    #[tokio::test]
    async fn test_unindexed_previous_transaction() {
        let rpc = Arc::new(MockChainRpc::new());
        // funding output still served by gettxout
        rpc.add_transaction(payment("funding", "alice-addr", 800));
        rpc.unindex_transaction("funding");
        rpc.add_transaction(spend("from-utxo", "funding", 0, &[("bob-addr", 700)]));
        // funding unknown everywhere
        rpc.add_transaction(spend("deposit", "unindexed-prev", 0, &[("alice-addr", 500)]));
        let watched = registry(&[("alice-addr", "alice"), ("bob-addr", "bob")]).await;

        let pipeline = ExtractionPipeline::new(rpc, watched, AddressConfig::bitcoin(), 2);
        let ids = vec!["from-utxo".to_string(), "deposit".to_string()];
        let batch = pipeline
            .extract(BlockRef::confirmed(4, "h4"), &ids, &CancellationToken::new())
            .await;

        assert_eq!(batch.failures().count(), 0);
        let records: Vec<_> = batch.records().collect();
        let bob = records.iter().find(|r| r.txid == "from-utxo" && r.source_key == "bob").unwrap();
        assert_eq!(bob.inputs[0].amount, Some(800));
        assert_eq!(bob.fee, Some(100));

        let deposit = records.iter().find(|r| r.txid == "deposit").unwrap();
        assert_eq!(deposit.source_key, "alice");
        assert_eq!(deposit.received(), 500);
        assert_eq!(deposit.inputs[0].amount, None);
        assert_eq!(deposit.fee, None);
    }

    #[tokio::test]
    async fn test_input_lookup_failures_are_retryable() {
        let rpc = Arc::new(MockChainRpc::new());
        rpc.add_transaction(payment("funding", "a", 10));
        rpc.add_transaction(payment("flaky-funding", "a", 10));
        rpc.fail_transaction("flaky-funding", RpcError::Transport("connection reset".into()));
        rpc.add_transaction(spend("bad-vout", "funding", 7, &[("a", 5)]));
        rpc.add_transaction(spend("flaky-input", "flaky-funding", 0, &[("a", 5)]));
        let watched = registry(&[("a", "alice")]).await;

        let pipeline = ExtractionPipeline::new(rpc, watched, AddressConfig::bitcoin(), 2);
        let ids = vec!["bad-vout".to_string(), "flaky-input".to_string()];
        let batch = pipeline
            .extract(BlockRef::confirmed(2, "h2"), &ids, &CancellationToken::new())
            .await;

        let failures: Vec<_> = batch.failures().collect();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.kind == FailureKind::Rpc));
        assert!(failures.iter().all(|f| !f.kind.is_permanent()));
    }

    struct PanickingLookup;

    #[async_trait]
    impl AddressLookup for PanickingLookup {
        async fn lookup(&self, address: &str) -> Option<String> {
            if address == "boom" {
                panic!("lookup exploded");
            }
            None
        }
    }

    #[tokio::test]
    async fn test_worker_panic_becomes_failure() {
        let rpc = Arc::new(MockChainRpc::new());
        rpc.add_transaction(payment("fine", "calm", 1));
        rpc.add_transaction(payment("bad", "boom", 1));

        let pipeline = ExtractionPipeline::new(rpc, Arc::new(PanickingLookup), AddressConfig::bitcoin(), 2);
        let ids = vec!["fine".to_string(), "bad".to_string()];
        let batch = pipeline
            .extract(BlockRef::confirmed(1, "h1"), &ids, &CancellationToken::new())
            .await;

        assert_eq!(batch.outcomes.len(), 2);
        assert!(matches!(batch.outcomes[0], TxOutcome::Extracted { .. }));
        match &batch.outcomes[1] {
            TxOutcome::Failed(f) => assert_eq!(f.kind, FailureKind::Panic),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_batch() {
        let rpc = Arc::new(MockChainRpc::new());
        for txid in txids(10) {
            rpc.add_transaction(payment(&txid, "a", 1));
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let pipeline = ExtractionPipeline::new(rpc, registry(&[]).await, AddressConfig::bitcoin(), 2);
        let batch = pipeline.extract(BlockRef::confirmed(1, "h1"), &txids(10), &cancel).await;
        assert_eq!(batch.outcomes.len(), 10);
        assert!(batch.is_cancelled());
    }
}
