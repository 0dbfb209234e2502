//! Storage for scanner state

pub mod persistence;
pub mod scan_store;

pub use persistence::{load_from_file, save_to_file, JsonFileStore, StorageError};
pub use scan_store::{FailureKind, MemoryScanStore, ScanCursor, ScanData, ScanStore, UnscannedRecord};
