//! Record sinks.
//!
//! A sink only has to accept records one at a time. Pipelines never call a
//! file or database sink directly: each one runs behind a
//! [`queued::SinkQueue`] so a slow write never stalls the listener.

use async_trait::async_trait;
use cruiselog_core::{InstrumentId, Record, SinkSpec};
use log::debug;
use std::sync::Arc;
use thiserror::Error;

pub mod database;
pub mod file;
pub mod queued;

pub use database::{DatabaseSink, JsonlStore, MemoryStore, RecordStore, StoreError};
pub use file::FileSink;
pub use queued::{spawn_queued, Drained, RetryPolicy, SinkProbe, SinkQueue, SinkWorker};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Write to {sink} failed: {message}")]
    Write { sink: String, message: String },
    #[error("Sink {0} is closed")]
    Closed(String),
}

impl SinkError {
    pub fn write(sink: impl ToString, message: impl ToString) -> Self {
        SinkError::Write {
            sink: sink.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
pub trait Sink: Send {
    async fn accept(&mut self, record: &Record) -> Result<(), SinkError>;

    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Flush and release resources. The sink is not used afterwards.
    async fn close(&mut self) -> Result<(), SinkError> {
        self.flush().await
    }
}

/// Accepts everything and keeps nothing: the "off" sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn accept(&mut self, _record: &Record) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Fans every record out to all children.
///
/// A failing child never prevents delivery to the others. The composite
/// only reports an error when every child failed; individual failures are
/// counted per child.
pub struct CompositeSink {
    children: Vec<Box<dyn Sink>>,
    failures: Vec<u64>,
}

impl CompositeSink {
    pub fn new(children: Vec<Box<dyn Sink>>) -> Self {
        let failures = vec![0; children.len()];
        CompositeSink { children, failures }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Failed deliveries per child, in construction order.
    pub fn failures(&self) -> &[u64] {
        &self.failures
    }
}

#[async_trait]
impl Sink for CompositeSink {
    async fn accept(&mut self, record: &Record) -> Result<(), SinkError> {
        let mut last_error = None;
        let mut delivered = 0;
        for (child, failures) in self.children.iter_mut().zip(self.failures.iter_mut()) {
            match child.accept(record).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!("{}: {}", record.instrument, e);
                    *failures += 1;
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        let mut result = Ok(());
        for child in self.children.iter_mut() {
            if let Err(e) = child.flush().await {
                result = Err(e);
            }
        }
        result
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        let mut result = Ok(());
        for child in self.children.iter_mut() {
            if let Err(e) = child.close().await {
                result = Err(e);
            }
        }
        result
    }
}

/// Builds the concrete sink for one entry of a sink plan.
pub trait SinkFactory: Send + Sync {
    fn create(&self, instrument: &InstrumentId, spec: &SinkSpec) -> Result<Box<dyn Sink>, SinkError>;
}

/// File sinks on the local filesystem, database sinks on a shared store.
pub struct DefaultSinkFactory {
    store: Arc<dyn RecordStore>,
}

impl DefaultSinkFactory {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        DefaultSinkFactory { store }
    }
}

impl SinkFactory for DefaultSinkFactory {
    fn create(&self, _instrument: &InstrumentId, spec: &SinkSpec) -> Result<Box<dyn Sink>, SinkError> {
        Ok(match spec {
            SinkSpec::File { path, rotation } => Box::new(FileSink::new(path.clone(), *rotation)),
            SinkSpec::Db { table } => Box::new(DatabaseSink::new(table.clone(), self.store.clone())),
        })
    }
}
