//! Scan cursor, header cache and retry queue
//!
//! The store is owned by the scan loop and never shared with extraction
//! workers, so the trait is synchronous and takes `&mut self` for writes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::persistence::StorageError;
use crate::scanner::rpc::BlockHeader;

// =============================================================================
// Records
// =============================================================================

/// Last fully scanned block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub height: u64,
    pub hash: String,
}

impl ScanCursor {
    pub fn new(height: u64, hash: &str) -> Self {
        Self {
            height,
            hash: hash.to_string(),
        }
    }
}

/// Why a transaction was queued for retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The node has no record of the transaction
    TxNotFound,
    /// Any other backend failure while fetching
    Rpc,
    /// An observer rejected the extracted record
    Notify,
    /// The extraction worker panicked
    Panic,
}

impl FailureKind {
    /// Failures that will never succeed on retry
    pub fn is_permanent(&self) -> bool {
        matches!(self, FailureKind::TxNotFound)
    }
}

/// A transaction whose extraction or notification failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnscannedRecord {
    /// Block height, 0 for mempool transactions
    pub block_height: u64,
    pub txid: String,
    pub reason: String,
    pub kind: FailureKind,
    /// Failed attempts so far
    #[serde(default = "one")]
    pub attempts: u32,
    #[serde(default = "Utc::now")]
    pub last_attempt: DateTime<Utc>,
}

fn one() -> u32 {
    1
}

impl UnscannedRecord {
    pub fn new(block_height: u64, txid: &str, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            block_height,
            txid: txid.to_string(),
            reason: reason.into(),
            kind,
            attempts: 1,
            last_attempt: Utc::now(),
        }
    }
}

// =============================================================================
// Store trait
// =============================================================================

/// Persistence used by the block scanner
pub trait ScanStore: Send + Sync {
    fn cursor(&self) -> Result<Option<ScanCursor>, StorageError>;

    fn set_cursor(&mut self, cursor: &ScanCursor) -> Result<(), StorageError>;

    /// Cache a block header, evicting the lowest heights past the limit
    fn save_header(&mut self, header: &BlockHeader) -> Result<(), StorageError>;

    fn header(&self, height: u64) -> Result<Option<BlockHeader>, StorageError>;

    /// Drop cached headers above `height`
    fn truncate_headers(&mut self, height: u64) -> Result<(), StorageError>;

    /// Queue a failed transaction; an existing record for the same
    /// height and txid is replaced and its attempt count bumped
    fn save_unscanned(&mut self, record: UnscannedRecord) -> Result<(), StorageError>;

    /// All queued records, ordered by height
    fn unscanned(&self) -> Result<Vec<UnscannedRecord>, StorageError>;

    fn unscanned_at(&self, height: u64) -> Result<Vec<UnscannedRecord>, StorageError>;

    /// Returns whether a record was removed
    fn delete_unscanned(&mut self, height: u64, txid: &str) -> Result<bool, StorageError>;

    /// Returns how many records were removed
    fn delete_unscanned_at(&mut self, height: u64) -> Result<usize, StorageError>;
}

// =============================================================================
// Shared state
// =============================================================================

/// Serializable contents of a scan store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanData {
    pub cursor: Option<ScanCursor>,
    #[serde(default)]
    pub headers: BTreeMap<u64, BlockHeader>,
    #[serde(default)]
    pub unscanned: Vec<UnscannedRecord>,
}

impl ScanData {
    pub(crate) fn save_header(&mut self, header: &BlockHeader, max_headers: usize) {
        self.headers.insert(header.height, header.clone());
        while self.headers.len() > max_headers.max(1) {
            if self.headers.pop_first().is_none() {
                break;
            }
        }
    }

    pub(crate) fn truncate_headers(&mut self, height: u64) {
        self.headers.retain(|h, _| *h <= height);
    }

    pub(crate) fn save_unscanned(&mut self, mut record: UnscannedRecord) {
        if let Some(existing) = self
            .unscanned
            .iter_mut()
            .find(|r| r.block_height == record.block_height && r.txid == record.txid)
        {
            record.attempts = existing.attempts.saturating_add(1);
            *existing = record;
        } else {
            self.unscanned.push(record);
        }
        self.unscanned.sort_by_key(|r| r.block_height);
    }

    pub(crate) fn unscanned_at(&self, height: u64) -> Vec<UnscannedRecord> {
        self.unscanned
            .iter()
            .filter(|r| r.block_height == height)
            .cloned()
            .collect()
    }

    pub(crate) fn delete_unscanned(&mut self, height: u64, txid: &str) -> bool {
        let before = self.unscanned.len();
        self.unscanned
            .retain(|r| !(r.block_height == height && r.txid == txid));
        before != self.unscanned.len()
    }

    pub(crate) fn delete_unscanned_at(&mut self, height: u64) -> usize {
        let before = self.unscanned.len();
        self.unscanned.retain(|r| r.block_height != height);
        before - self.unscanned.len()
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Non-persistent store, for tests and one-shot scans
#[derive(Debug, Clone)]
pub struct MemoryScanStore {
    data: ScanData,
    max_headers: usize,
}

impl MemoryScanStore {
    pub fn new(max_headers: usize) -> Self {
        Self {
            data: ScanData::default(),
            max_headers,
        }
    }

    pub fn data(&self) -> &ScanData {
        &self.data
    }
}

impl Default for MemoryScanStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl ScanStore for MemoryScanStore {
    fn cursor(&self) -> Result<Option<ScanCursor>, StorageError> {
        Ok(self.data.cursor.clone())
    }

    fn set_cursor(&mut self, cursor: &ScanCursor) -> Result<(), StorageError> {
        self.data.cursor = Some(cursor.clone());
        Ok(())
    }

    fn save_header(&mut self, header: &BlockHeader) -> Result<(), StorageError> {
        self.data.save_header(header, self.max_headers);
        Ok(())
    }

    fn header(&self, height: u64) -> Result<Option<BlockHeader>, StorageError> {
        Ok(self.data.headers.get(&height).cloned())
    }

    fn truncate_headers(&mut self, height: u64) -> Result<(), StorageError> {
        self.data.truncate_headers(height);
        Ok(())
    }

    fn save_unscanned(&mut self, record: UnscannedRecord) -> Result<(), StorageError> {
        self.data.save_unscanned(record);
        Ok(())
    }

    fn unscanned(&self) -> Result<Vec<UnscannedRecord>, StorageError> {
        Ok(self.data.unscanned.clone())
    }

    fn unscanned_at(&self, height: u64) -> Result<Vec<UnscannedRecord>, StorageError> {
        Ok(self.data.unscanned_at(height))
    }

    fn delete_unscanned(&mut self, height: u64, txid: &str) -> Result<bool, StorageError> {
        Ok(self.data.delete_unscanned(height, txid))
    }

    fn delete_unscanned_at(&mut self, height: u64) -> Result<usize, StorageError> {
        Ok(self.data.delete_unscanned_at(height))
    }
}
