//! Block scanner
//!
//! One scanner drives one chain. Each tick walks from the stored cursor to
//! the backend tip, rolling back when a block does not build on the cursor,
//! then optionally scans the mempool and finally retries queued failures.
//!
//! Only the scan loop touches the store; extraction workers never do.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::observer::{BlockObserver, NotifyError};
use super::pipeline::{BlockRef, ExtractedRecord, ExtractionPipeline, TxOutcome};
use super::registry::AddressLookup;
use super::rpc::{BlockHeader, BlockInfo, ChainRpc, RpcError};
use crate::config::{ChainConfig, ScannerConfig};
use crate::core::address::AddressConfig;
use crate::storage::{FailureKind, ScanCursor, ScanStore, StorageError, UnscannedRecord};

/// Errors that end a tick early
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What the scanner is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    Scanning,
    ForkDetected,
    RescanMempool,
    RescanFailed,
}

/// Summary of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub start_height: u64,
    pub end_height: u64,
    pub blocks_scanned: usize,
    pub forks: usize,
    /// Records delivered to observers
    pub records: usize,
    /// Transactions queued for retry
    pub failures: usize,
    pub mempool_transactions: usize,
    /// Queued transactions delivered on retry
    pub retried: usize,
    /// Queued transactions dropped as permanently unknown
    pub purged: usize,
    pub cancelled: bool,
    /// Error that stopped block scanning, if any
    pub interrupted: Option<String>,
}

/// Polls a chain backend and reports watched-address activity
pub struct BlockScanner<S: ScanStore> {
    rpc: Arc<dyn ChainRpc>,
    pipeline: ExtractionPipeline,
    store: S,
    observers: Vec<Arc<dyn BlockObserver>>,
    config: ScannerConfig,
    state: watch::Sender<ScanState>,
    mempool_seen: HashSet<String>,
}

impl<S: ScanStore> BlockScanner<S> {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        lookup: Arc<dyn AddressLookup>,
        address_config: AddressConfig,
        config: ScannerConfig,
        store: S,
    ) -> Self {
        let pipeline = ExtractionPipeline::new(rpc.clone(), lookup, address_config, config.worker_concurrency);
        let (state, _) = watch::channel(ScanState::Idle);
        Self {
            rpc,
            pipeline,
            store,
            observers: Vec::new(),
            config,
            state,
            mempool_seen: HashSet::new(),
        }
    }

    pub fn from_chain_config(
        chain: &ChainConfig,
        rpc: Arc<dyn ChainRpc>,
        lookup: Arc<dyn AddressLookup>,
        store: S,
    ) -> Self {
        Self::new(rpc, lookup, chain.address.clone(), chain.scanner.clone(), store)
    }

    pub fn with_observer(mut self, observer: Arc<dyn BlockObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn BlockObserver>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    /// Follow state changes from another task
    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn set_state(&self, state: ScanState) {
        self.state.send_replace(state);
    }

    /// Poll until cancelled
    pub async fn run(&mut self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Block scanner started, polling every {}s", period.as_secs());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.tick(&cancel).await;
                    if report.cancelled {
                        break;
                    }
                }
            }
        }
        info!("Block scanner stopped");
    }

    /// One pass: blocks, then mempool, then the retry queue
    pub async fn tick(&mut self, cancel: &CancellationToken) -> TickReport {
        let mut report = TickReport::default();

        self.set_state(ScanState::Scanning);
        if let Err(e) = self.scan_blocks(cancel, &mut report).await {
            warn!("Block scan interrupted at height {}: {}", report.end_height, e);
            report.interrupted = Some(e.to_string());
            self.set_state(ScanState::Idle);
            return report;
        }

        if self.config.scan_mempool && !cancel.is_cancelled() {
            self.set_state(ScanState::RescanMempool);
            if let Err(e) = self.scan_mempool(cancel, &mut report).await {
                warn!("Mempool scan failed: {}", e);
                report.interrupted = Some(e.to_string());
            }
        }

        if !cancel.is_cancelled() {
            self.set_state(ScanState::RescanFailed);
            if let Err(e) = self.rescan_failed(cancel, &mut report).await {
                warn!("Retry pass failed: {}", e);
                report.interrupted.get_or_insert(e.to_string());
            }
        }

        report.cancelled = cancel.is_cancelled();
        self.set_state(ScanState::Idle);
        if report.blocks_scanned > 0 || report.forks > 0 || report.failures > 0 {
            info!(
                "Scanned {} blocks to height {} ({} forks, {} records, {} failures, {} retried, {} purged)",
                report.blocks_scanned,
                report.end_height,
                report.forks,
                report.records,
                report.failures,
                report.retried,
                report.purged
            );
        }
        report
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Stored cursor, or one placed before the configured start height
    async fn load_cursor(&mut self) -> Result<ScanCursor, ScanError> {
        if let Some(cursor) = self.store.cursor()? {
            return Ok(cursor);
        }
        let height = match self.config.start_height {
            Some(start) => start.saturating_sub(1),
            None => self.rpc.get_block_height().await?,
        };
        let hash = self.rpc.get_block_hash(height).await?;
        let block = self.rpc.get_block(&hash).await?;
        let cursor = ScanCursor::new(block.height, &block.hash);
        self.store.save_header(&block.header())?;
        self.store.set_cursor(&cursor)?;
        info!("No scan cursor stored, starting after height {}", cursor.height);
        Ok(cursor)
    }

    async fn scan_blocks(&mut self, cancel: &CancellationToken, report: &mut TickReport) -> Result<(), ScanError> {
        let mut cursor = self.load_cursor().await?;
        report.start_height = cursor.height;
        report.end_height = cursor.height;

        let tip = self.rpc.get_block_height().await?;
        debug!("Cursor at {}, tip at {}", cursor.height, tip);

        let mut replaced_up_to: Option<u64> = None;
        while cursor.height < tip {
            if cancel.is_cancelled() {
                break;
            }
            let hash = self.rpc.get_block_hash(cursor.height + 1).await?;
            let block = self.rpc.get_block(&hash).await?;

            if block.prev_hash != cursor.hash {
                if report.forks >= self.config.max_rollbacks_per_tick {
                    warn!(
                        "Rollback limit of {} reached at height {}, continuing next tick",
                        self.config.max_rollbacks_per_tick, cursor.height
                    );
                    break;
                }
                report.forks += 1;
                replaced_up_to = Some(replaced_up_to.map_or(cursor.height, |h| h.max(cursor.height)));
                cursor = self.roll_back(&cursor, &block).await?;
                report.end_height = cursor.height;
                self.set_state(ScanState::Scanning);
                continue;
            }

            let is_fork = replaced_up_to.is_some_and(|h| block.height <= h);
            if !self.scan_block(&block, is_fork, cancel, report).await? {
                break;
            }
            cursor = ScanCursor::new(block.height, &block.hash);
            report.end_height = cursor.height;
        }
        Ok(())
    }

    /// Step the cursor back after `fetched` failed to build on it.
    ///
    /// Records queued at the cursor height are dropped and the new cursor
    /// sits one below it (never below 1). The cached header is used when
    /// available so that deeper reorgs are detected on the next block.
    pub(crate) async fn roll_back(&mut self, cursor: &ScanCursor, fetched: &BlockInfo) -> Result<ScanCursor, ScanError> {
        self.set_state(ScanState::ForkDetected);
        warn!(
            "Fork at height {}: block {} builds on {}, local block is {}",
            fetched.height, fetched.hash, fetched.prev_hash, cursor.hash
        );

        let dropped = self.store.delete_unscanned_at(cursor.height)?;
        let target = cursor.height.saturating_sub(1).max(1).min(cursor.height);

        let cached = if target < cursor.height {
            self.store.header(target)?
        } else {
            None
        };
        let header = match cached {
            Some(header) => header,
            None => {
                let hash = self.rpc.get_block_hash(target).await?;
                self.rpc.get_block(&hash).await?.header()
            }
        };

        self.store.truncate_headers(target)?;
        self.store.save_header(&header)?;
        let rolled = ScanCursor::new(header.height, &header.hash);
        self.store.set_cursor(&rolled)?;
        info!(
            "Rolled back from {} to {} ({}), dropped {} queued transactions",
            cursor.height, rolled.height, rolled.hash, dropped
        );
        Ok(rolled)
    }

    /// Returns false when shutdown interrupted the block
    async fn scan_block(
        &mut self,
        block: &BlockInfo,
        is_fork: bool,
        cancel: &CancellationToken,
        report: &mut TickReport,
    ) -> Result<bool, ScanError> {
        let batch = self
            .pipeline
            .extract(BlockRef::confirmed(block.height, &block.hash), &block.txids, cancel)
            .await;
        if batch.is_cancelled() {
            info!("Shutdown while scanning block {}, cursor left in place", block.height);
            return Ok(false);
        }

        for outcome in &batch.outcomes {
            self.handle_outcome(block.height, outcome, report).await?;
        }

        let header = block.header();
        self.store.save_header(&header)?;
        self.store.set_cursor(&ScanCursor::new(block.height, &block.hash))?;
        self.notify_block(&header, is_fork).await;
        report.blocks_scanned += 1;
        debug!("Scanned block {} ({} txs)", block.height, block.txids.len());
        Ok(true)
    }

    // =========================================================================
    // Mempool
    // =========================================================================

    async fn scan_mempool(&mut self, cancel: &CancellationToken, report: &mut TickReport) -> Result<(), ScanError> {
        let txids = self.rpc.get_mempool_txids().await?;
        let current: HashSet<&String> = txids.iter().collect();
        self.mempool_seen.retain(|txid| current.contains(txid));

        let fresh: Vec<String> = txids
            .iter()
            .filter(|txid| !self.mempool_seen.contains(*txid))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        let batch = self.pipeline.extract(BlockRef::mempool(), &fresh, cancel).await;
        for outcome in &batch.outcomes {
            match outcome {
                TxOutcome::Cancelled { .. } => continue,
                TxOutcome::Failed(failure) if failure.kind == FailureKind::TxNotFound => {
                    debug!("{} left the mempool before it was fetched", failure.txid);
                    continue;
                }
                _ => {}
            }
            self.mempool_seen.insert(outcome.txid().to_string());
            report.mempool_transactions += 1;
            self.handle_outcome(0, outcome, report).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Retry queue
    // =========================================================================

    async fn rescan_failed(&mut self, cancel: &CancellationToken, report: &mut TickReport) -> Result<(), ScanError> {
        let queued = self.store.unscanned()?;
        if queued.is_empty() {
            return Ok(());
        }

        let mut by_height: BTreeMap<u64, Vec<UnscannedRecord>> = BTreeMap::new();
        for record in queued {
            by_height.entry(record.block_height).or_default().push(record);
        }

        for (height, records) in by_height {
            if cancel.is_cancelled() {
                break;
            }

            let mut txids = Vec::with_capacity(records.len());
            for record in records {
                if record.kind.is_permanent() && self.config.purge_unknown_transactions {
                    warn!(
                        "Purging {} at height {} after {} attempts: {}",
                        record.txid, height, record.attempts, record.reason
                    );
                    self.store.delete_unscanned(height, &record.txid)?;
                    report.purged += 1;
                } else {
                    txids.push(record.txid);
                }
            }
            if txids.is_empty() {
                continue;
            }

            let hash = if height == 0 {
                None
            } else {
                self.store.header(height)?.map(|h| h.hash)
            };
            let batch = self.pipeline.extract(BlockRef { height, hash }, &txids, cancel).await;
            for outcome in &batch.outcomes {
                if self.handle_outcome(height, outcome, report).await? {
                    self.store.delete_unscanned(height, outcome.txid())?;
                    report.retried += 1;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Deliver an outcome or queue it; returns whether it was delivered
    async fn handle_outcome(&mut self, height: u64, outcome: &TxOutcome, report: &mut TickReport) -> Result<bool, ScanError> {
        match outcome {
            TxOutcome::Extracted { txid, records } => match self.notify_records(records).await {
                Ok(()) => {
                    report.records += records.len();
                    Ok(true)
                }
                Err(e) => {
                    warn!("Notification for {} at height {} failed: {}", txid, height, e);
                    report.failures += 1;
                    self.store
                        .save_unscanned(UnscannedRecord::new(height, txid, FailureKind::Notify, e.to_string()))?;
                    Ok(false)
                }
            },
            TxOutcome::Failed(failure) => {
                warn!(
                    "Extraction of {} at height {} failed: {}",
                    failure.txid, height, failure.reason
                );
                report.failures += 1;
                self.store.save_unscanned(UnscannedRecord::new(
                    height,
                    &failure.txid,
                    failure.kind,
                    failure.reason.clone(),
                ))?;
                Ok(false)
            }
            TxOutcome::Cancelled { .. } => Ok(false),
        }
    }

    /// Every observer sees every record; the first rejection is returned
    async fn notify_records(&self, records: &[ExtractedRecord]) -> Result<(), NotifyError> {
        let mut first_error = None;
        for record in records {
            for observer in &self.observers {
                if let Err(e) = observer
                    .on_extracted_record(&record.source_key, record.clone())
                    .await
                {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn notify_block(&self, header: &BlockHeader, is_fork: bool) {
        for observer in &self.observers {
            observer.on_block_scanned(header, is_fork).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::mock::{payment, spend, MockChainRpc, RecordingObserver};
    use crate::scanner::registry::AddressRegistry;
    use crate::storage::{JsonFileStore, MemoryScanStore};

    struct Harness {
        rpc: Arc<MockChainRpc>,
        observer: RecordingObserver,
        scanner: BlockScanner<MemoryScanStore>,
    }

    async fn harness(config: ScannerConfig) -> Harness {
        let rpc = Arc::new(MockChainRpc::new());
        let registry = Arc::new(AddressRegistry::new());
        registry
            .register_many(vec![("alice-addr", "alice"), ("bob-addr", "bob")])
            .await;
        let observer = RecordingObserver::new();
        let scanner = BlockScanner::new(
            rpc.clone(),
            registry,
            AddressConfig::bitcoin(),
            config,
            MemoryScanStore::default(),
        )
        .with_observer(Arc::new(observer.clone()));
        Harness { rpc, observer, scanner }
    }

    fn from_height(start: u64) -> ScannerConfig {
        ScannerConfig {
            start_height: Some(start),
            worker_concurrency: 3,
            ..Default::default()
        }
    }

    fn cursor_of<S: ScanStore>(scanner: &BlockScanner<S>) -> ScanCursor {
        scanner.store().cursor().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_at_tip() {
        let mut h = harness(ScannerConfig::default()).await;
        h.rpc.mine(5);
        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.blocks_scanned, 0);
        assert_eq!(cursor_of(&h.scanner).height, 5);

        h.rpc.push_block(&[payment("t1", "alice-addr", 700)]);
        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.blocks_scanned, 1);
        assert_eq!(report.records, 1);
        assert_eq!(h.observer.records()[0].block_height, 6);
        assert_eq!(h.scanner.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_scans_from_start_height() {
        let mut h = harness(from_height(1)).await;
        h.rpc.push_block(&[payment("a1", "alice-addr", 10), payment("x1", "stranger", 5)]);
        h.rpc.push_block(&[payment("b1", "bob-addr", 20)]);
        h.rpc.mine(2);

        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.start_height, 0);
        assert_eq!(report.end_height, 4);
        assert_eq!(report.blocks_scanned, 4);
        assert_eq!(report.records, 2);
        assert_eq!(report.interrupted, None);

        let cursor = cursor_of(&h.scanner);
        assert_eq!(cursor, ScanCursor::new(4, &h.rpc.tip().hash));
        let heights: Vec<u64> = h.observer.blocks().iter().map(|(b, _)| b.height).collect();
        assert_eq!(heights, vec![1, 2, 3, 4]);
        assert!(h.observer.blocks().iter().all(|(_, fork)| !fork));
        assert_eq!(h.scanner.store().header(2).unwrap().unwrap().hash, h.rpc.block_at(2).unwrap().hash);
    }

    #[tokio::test]
    async fn test_roll_back_moves_cursor_one_below() {
        let mut h = harness(from_height(1)).await;
        h.rpc.mine(5);
        h.scanner.tick(&CancellationToken::new()).await;
        let cursor = cursor_of(&h.scanner);
        assert_eq!(cursor.height, 5);

        h.scanner
            .store
            .save_unscanned(UnscannedRecord::new(5, "orphaned", FailureKind::Rpc, "timeout"))
            .unwrap();
        h.scanner
            .store
            .save_unscanned(UnscannedRecord::new(4, "older", FailureKind::Rpc, "timeout"))
            .unwrap();

        h.rpc.reorg_from(5);
        h.rpc.mine(2);
        let fetched = h.rpc.block_at(6).unwrap();
        let rolled = h.scanner.roll_back(&cursor, &fetched).await.unwrap();

        assert_eq!(rolled.height, 4);
        assert_eq!(rolled.hash, h.rpc.block_at(4).unwrap().hash);
        assert_eq!(cursor_of(&h.scanner), rolled);
        assert!(h.scanner.store().unscanned_at(5).unwrap().is_empty());
        assert_eq!(h.scanner.store().unscanned_at(4).unwrap().len(), 1);
        assert_eq!(h.scanner.store().header(5).unwrap(), None);
    }

    #[tokio::test]
    async fn test_roll_back_clamps_at_height_one() {
        let mut h = harness(from_height(1)).await;
        h.rpc.mine(1);
        h.scanner.tick(&CancellationToken::new()).await;
        let cursor = cursor_of(&h.scanner);
        assert_eq!(cursor.height, 1);

        h.rpc.reorg_from(1);
        h.rpc.mine(2);
        let fetched = h.rpc.block_at(2).unwrap();
        let rolled = h.scanner.roll_back(&cursor, &fetched).await.unwrap();
        // stays at 1 but picks up the replacement block
        assert_eq!(rolled, ScanCursor::new(1, &h.rpc.block_at(1).unwrap().hash));
    }

    #[tokio::test]
    async fn test_single_block_reorg() {
        let mut h = harness(from_height(1)).await;
        h.rpc.mine(4);
        h.rpc.push_block(&[payment("old", "alice-addr", 1)]);
        h.scanner.tick(&CancellationToken::new()).await;

        h.rpc.reorg_from(5);
        h.rpc.push_block(&[payment("new", "alice-addr", 2)]);
        h.rpc.mine(1);

        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.forks, 1);
        assert_eq!(report.blocks_scanned, 2);
        assert_eq!(cursor_of(&h.scanner), ScanCursor::new(6, &h.rpc.tip().hash));

        let blocks = h.observer.blocks();
        let replayed: Vec<(u64, bool)> = blocks[5..].iter().map(|(b, f)| (b.height, *f)).collect();
        assert_eq!(replayed, vec![(5, true), (6, false)]);
        let txids: Vec<String> = h.observer.records().into_iter().map(|r| r.txid).collect();
        assert_eq!(txids, vec!["old".to_string(), "new".to_string()]);
    }

    #[tokio::test]
    async fn test_deep_reorg_respects_rollback_limit() {
        let mut h = harness(ScannerConfig {
            max_rollbacks_per_tick: 2,
            ..from_height(1)
        })
        .await;
        h.rpc.mine(6);
        h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(cursor_of(&h.scanner).height, 6);

        h.rpc.reorg_from(3);
        h.rpc.mine(5);

        let first = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(first.forks, 2);
        assert_eq!(first.blocks_scanned, 0);
        assert_eq!(cursor_of(&h.scanner).height, 4);

        let second = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(second.forks, 2);
        assert_eq!(second.blocks_scanned, 5);
        assert_eq!(cursor_of(&h.scanner), ScanCursor::new(7, &h.rpc.tip().hash));
        for height in 3..=7 {
            assert_eq!(
                h.scanner.store().header(height).unwrap().unwrap().hash,
                h.rpc.block_at(height).unwrap().hash
            );
        }
    }

    #[tokio::test]
    async fn test_rpc_failure_interrupts_tick() {
        let mut h = harness(from_height(1)).await;
        h.rpc.mine(5);
        h.rpc.fail_block_at(3);

        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert!(report.interrupted.is_some());
        assert_eq!(report.blocks_scanned, 2);
        assert_eq!(cursor_of(&h.scanner).height, 2);

        h.rpc.clear_block_failures();
        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.interrupted, None);
        assert_eq!(cursor_of(&h.scanner).height, 5);

        h.rpc.fail_tip(true);
        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert!(report.interrupted.is_some());
        assert_eq!(h.scanner.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_failed_extraction_is_retried() {
        let mut h = harness(from_height(1)).await;
        h.rpc.push_block(&[payment("flaky", "alice-addr", 42)]);
        h.rpc.fail_transaction("flaky", RpcError::Transport("reset".into()));

        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.blocks_scanned, 1);
        // fails during the scan and again in the retry pass
        assert_eq!(report.failures, 2);
        assert_eq!(cursor_of(&h.scanner).height, 1);
        let queued = h.scanner.store().unscanned().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, FailureKind::Rpc);
        assert_eq!(queued[0].attempts, 2);
        assert!(h.observer.records().is_empty());

        h.rpc.clear_transaction_failure("flaky");
        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.retried, 1);
        assert!(h.scanner.store().unscanned().unwrap().is_empty());
        let records = h.observer.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].block_height, 1);
        assert_eq!(records[0].block_hash.as_deref(), Some(h.rpc.block_at(1).unwrap().hash.as_str()));
    }

    #[tokio::test]
    async fn test_rejected_notification_is_retried() {
        let mut h = harness(from_height(1)).await;
        h.observer.reject("bob");
        h.rpc.push_block(&[payment("to-bob", "bob-addr", 9)]);

        h.scanner.tick(&CancellationToken::new()).await;
        let queued = h.scanner.store().unscanned().unwrap();
        assert_eq!(queued[0].kind, FailureKind::Notify);
        assert_eq!(h.observer.rejections(), 2);

        h.observer.accept("bob");
        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.retried, 1);
        assert_eq!(h.observer.records()[0].txid, "to-bob");
    }

    #[tokio::test]
    async fn test_unknown_transactions_are_purged() {
        let mut h = harness(from_height(1)).await;
        h.rpc.push_block(&[payment("real", "alice-addr", 1)]);
        h.rpc.push_block(&[payment("ghost", "alice-addr", 1)]);
        // the node has since forgotten it
        h.rpc.fail_transaction(
            "ghost",
            RpcError::Remote {
                code: -5,
                message: "No information available about transaction".into(),
            },
        );

        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.failures, 1);
        assert_eq!(report.purged, 1);
        assert!(h.scanner.store().unscanned().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deposit_with_unknown_funding_is_kept() {
        let mut h = harness(from_height(1)).await;
        h.rpc.push_block(&[
            spend("deposit", "unindexed-prev", 0, &[("alice-addr", 500)]),
            spend("stuck", "flaky-prev", 0, &[("bob-addr", 300)]),
        ]);
        h.rpc.add_transaction(payment("flaky-prev", "carol-addr", 400));
        h.rpc.fail_transaction("flaky-prev", RpcError::Transport("reset".into()));

        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.purged, 0);
        let records = h.observer.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].txid, "deposit");
        assert_eq!(records[0].received(), 500);

        // an input that cannot be fetched right now stays queued for retry
        let queued = h.scanner.store().unscanned().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].txid, "stuck");
        assert_eq!(queued[0].kind, FailureKind::Rpc);

        h.rpc.clear_transaction_failure("flaky-prev");
        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.retried, 1);
        assert!(h.scanner.store().unscanned().unwrap().is_empty());
        assert_eq!(h.observer.records()[1].spent(), 0);
        assert_eq!(h.observer.records()[1].fee, Some(100));
    }

    #[tokio::test]
    async fn test_unknown_transactions_kept_when_purge_disabled() {
        let mut h = harness(ScannerConfig {
            purge_unknown_transactions: false,
            ..from_height(1)
        })
        .await;
        h.rpc.push_block(&[payment("ghost", "alice-addr", 1)]);
        h.rpc.fail_transaction("ghost", RpcError::NotFound("ghost".into()));

        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.purged, 0);
        let queued = h.scanner.store().unscanned().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, FailureKind::TxNotFound);
    }

    #[tokio::test]
    async fn test_mempool_scan() {
        let mut h = harness(ScannerConfig {
            scan_mempool: true,
            ..from_height(1)
        })
        .await;
        h.rpc.set_mempool(&[payment("pending", "alice-addr", 5), payment("noise", "stranger", 1)]);

        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.mempool_transactions, 2);
        assert_eq!(report.records, 1);
        let record = &h.observer.records()[0];
        assert_eq!(record.block_height, 0);
        assert_eq!(record.block_hash, None);

        // already seen transactions are not reported again
        let report = h.scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.mempool_transactions, 0);
        assert_eq!(h.observer.records().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_tick_keeps_cursor() {
        let mut h = harness(from_height(1)).await;
        h.rpc.mine(3);
        h.scanner.tick(&CancellationToken::new()).await;
        h.rpc.push_block(&[payment("late", "alice-addr", 1)]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h.scanner.tick(&cancel).await;
        assert!(report.cancelled);
        assert_eq!(report.blocks_scanned, 0);
        assert_eq!(cursor_of(&h.scanner).height, 3);
        assert!(h.observer.records().is_empty());
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let h = harness(ScannerConfig {
            poll_interval_secs: 1,
            ..from_height(1)
        })
        .await;
        h.rpc.push_block(&[payment("r1", "alice-addr", 3)]);

        let mut scanner = h.scanner;
        let mut states = scanner.subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            scanner.run(token).await;
            scanner
        });

        // the first interval tick fires immediately
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.observer.blocks().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();

        let scanner = handle.await.unwrap();
        assert_eq!(cursor_of(&scanner).height, 1);
        assert_eq!(h.observer.records().len(), 1);
        assert!(states.has_changed().is_ok());
        assert_eq!(*states.borrow_and_update(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_cursor_survives_restart_with_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc_scan.json");
        let rpc = Arc::new(MockChainRpc::new());
        rpc.mine(3);

        {
            let store = JsonFileStore::open(&path, 100).unwrap();
            let mut scanner = BlockScanner::new(
                rpc.clone(),
                Arc::new(AddressRegistry::new()),
                AddressConfig::bitcoin(),
                from_height(1),
                store,
            );
            scanner.tick(&CancellationToken::new()).await;
        }

        rpc.mine(2);
        let store = JsonFileStore::open(&path, 100).unwrap();
        assert_eq!(store.cursor().unwrap().unwrap().height, 3);
        let mut scanner = BlockScanner::new(
            rpc.clone(),
            Arc::new(AddressRegistry::new()),
            AddressConfig::bitcoin(),
            from_height(1),
            store,
        );
        let report = scanner.tick(&CancellationToken::new()).await;
        assert_eq!(report.start_height, 3);
        assert_eq!(report.blocks_scanned, 2);
    }
}
