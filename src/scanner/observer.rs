//! Scan notifications

use async_trait::async_trait;
use thiserror::Error;

use super::pipeline::ExtractedRecord;
use super::rpc::BlockHeader;

/// An observer failed to accept a record; the transaction is queued for retry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("notification rejected: {0}")]
pub struct NotifyError(pub String);

impl NotifyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Receives scanner events
#[async_trait]
pub trait BlockObserver: Send + Sync {
    /// Called after a block is persisted. `is_fork` is set for blocks that
    /// replace previously scanned ones after a rollback.
    async fn on_block_scanned(&self, header: &BlockHeader, is_fork: bool);

    /// Called once per watcher touched by a transaction
    async fn on_extracted_record(&self, source_key: &str, record: ExtractedRecord) -> Result<(), NotifyError>;
}
