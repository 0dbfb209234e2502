//! JSON file persistence for the scan store
//!
//! The whole store is rewritten on every change: serialize to a temporary
//! file, then rename over the previous one, so a crash never leaves a torn
//! cursor behind.

use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use super::scan_store::{ScanCursor, ScanData, ScanStore, UnscannedRecord};
use crate::config::ChainConfig;
use crate::scanner::rpc::BlockHeader;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Scan store backed by a single JSON file
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    data: ScanData,
    max_headers: usize,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty when the file is missing
    pub fn open(path: &Path, max_headers: usize) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = if path.exists() {
            load_from_file(path)?
        } else {
            ScanData::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            data,
            max_headers,
        })
    }

    /// Open the store configured for a chain
    pub fn for_chain(config: &ChainConfig) -> Result<Self, StorageError> {
        Self::open(&config.store_path(), config.scanner.max_cached_headers)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &ScanData {
        &self.data
    }

    /// Apply `change` to a copy and adopt it only once it is on disk
    fn commit<T>(&mut self, change: impl FnOnce(&mut ScanData) -> T) -> Result<T, StorageError> {
        let mut next = self.data.clone();
        let result = change(&mut next);
        if next != self.data {
            save_to_file(&next, &self.path)?;
            debug!("Saved scan store to {}", self.path.display());
            self.data = next;
        }
        Ok(result)
    }
}

impl ScanStore for JsonFileStore {
    fn cursor(&self) -> Result<Option<ScanCursor>, StorageError> {
        Ok(self.data.cursor.clone())
    }

    fn set_cursor(&mut self, cursor: &ScanCursor) -> Result<(), StorageError> {
        self.commit(|data| data.cursor = Some(cursor.clone()))
    }

    fn save_header(&mut self, header: &BlockHeader) -> Result<(), StorageError> {
        let max_headers = self.max_headers;
        self.commit(|data| data.save_header(header, max_headers))
    }

    fn header(&self, height: u64) -> Result<Option<BlockHeader>, StorageError> {
        Ok(self.data.headers.get(&height).cloned())
    }

    fn truncate_headers(&mut self, height: u64) -> Result<(), StorageError> {
        self.commit(|data| data.truncate_headers(height))
    }

    fn save_unscanned(&mut self, record: UnscannedRecord) -> Result<(), StorageError> {
        self.commit(|data| data.save_unscanned(record))
    }

    fn unscanned(&self) -> Result<Vec<UnscannedRecord>, StorageError> {
        Ok(self.data.unscanned.clone())
    }

    fn unscanned_at(&self, height: u64) -> Result<Vec<UnscannedRecord>, StorageError> {
        Ok(self.data.unscanned_at(height))
    }

    fn delete_unscanned(&mut self, height: u64, txid: &str) -> Result<bool, StorageError> {
        self.commit(|data| data.delete_unscanned(height, txid))
    }

    fn delete_unscanned_at(&mut self, height: u64) -> Result<usize, StorageError> {
        self.commit(|data| data.delete_unscanned_at(height))
    }
}

/// Write store contents atomically via a sibling temporary file
pub fn save_to_file(data: &ScanData, path: &Path) -> Result<(), StorageError> {
    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    let file = fs::File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, data)?;
    writer.flush()?;
    drop(writer);

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read store contents from a file
pub fn load_from_file(path: &Path) -> Result<ScanData, StorageError> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let data: ScanData = serde_json::from_reader(reader)?;
    if let Some(cursor) = &data.cursor {
        if cursor.hash.is_empty() {
            return Err(StorageError::InvalidData(format!(
                "cursor at height {} has no block hash",
                cursor.height
            )));
        }
    }
    Ok(data)
}
