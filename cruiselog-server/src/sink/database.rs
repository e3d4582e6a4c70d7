//! Database sink and the record stores behind it.

use async_trait::async_trait;
use cruiselog_core::Record;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::{Sink, SinkError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Cannot serialize record: {0}")]
    Serialize(String),
    #[error("Store unavailable")]
    Unavailable,
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Table-oriented persistence for records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, table: &str, record: &Record) -> Result<(), StoreError>;
}

/// Appends one JSON object per record to `<dir>/<table>.jsonl`.
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub fn new(dir: PathBuf) -> Self {
        JsonlStore { dir }
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", table))
    }
}

#[async_trait]
impl RecordStore for JsonlStore {
    async fn insert(&self, table: &str, record: &Record) -> Result<(), StoreError> {
        let mut line =
            serde_json::to_vec(record).map_err(|e| StoreError::Serialize(e.to_string()))?;
        line.push(b'\n');

        fs::create_dir_all(&self.dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.table_path(table))
            .await?;
        // One write per row so concurrent appenders never interleave
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps rows in memory. Can be switched into a failing state.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, Vec<Record>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.rows
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, table: &str) -> usize {
        self.rows.lock().unwrap().get(table).map_or(0, Vec::len)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, table: &str, record: &Record) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        self.rows
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }
}

/// Inserts records into one table of a [`RecordStore`].
///
/// Retrying is left to the queue worker that drives the sink.
pub struct DatabaseSink {
    table: String,
    store: Arc<dyn RecordStore>,
}

impl DatabaseSink {
    pub fn new(table: String, store: Arc<dyn RecordStore>) -> Self {
        DatabaseSink { table, store }
    }
}

#[async_trait]
impl Sink for DatabaseSink {
    async fn accept(&mut self, record: &Record) -> Result<(), SinkError> {
        self.store
            .insert(&self.table, record)
            .await
            .map_err(|e| SinkError::write(format!("db:{}", self.table), e))
    }
}
