//! Queue-then-write: every real sink runs in its own task behind a bounded
//! drop-oldest queue, so the pipeline only ever enqueues.

use async_trait::async_trait;
use cruiselog_core::{Record, SinkSpec, SinkStatus};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{Sink, SinkError};
use crate::queue::{DropOldestQueue, Pushed};

/// Extra attempts for a failed write, before it is counted as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        retries: 0,
        delay: Duration::ZERO,
    };
}

/// Live counters of one queued sink, shared between the pipeline and the
/// worker task.
pub struct SinkCounters {
    written: AtomicU64,
    failed: AtomicU64,
    healthy: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Default for SinkCounters {
    fn default() -> Self {
        SinkCounters {
            written: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            last_error: Mutex::new(None),
        }
    }
}

impl SinkCounters {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn success(&self) -> bool {
        self.written.fetch_add(1, Ordering::Relaxed);
        !self.healthy.swap(true, Ordering::Relaxed)
    }

    fn failure(&self, error: &SinkError) -> bool {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap() = Some(error.to_string());
        self.healthy.swap(false, Ordering::Relaxed)
    }
}

/// Producer side: enqueues records for the worker.
#[derive(Clone)]
pub struct SinkQueue {
    spec: SinkSpec,
    queue: Arc<DropOldestQueue<Record>>,
}

#[async_trait]
impl Sink for SinkQueue {
    async fn accept(&mut self, record: &Record) -> Result<(), SinkError> {
        match self.queue.push(record.clone()) {
            Pushed::Queued | Pushed::Overflow { first: false } => Ok(()),
            Pushed::Overflow { first: true } => {
                warn!(
                    "{}: {} queue full, dropping oldest records",
                    record.instrument, self.spec
                );
                Ok(())
            }
            Pushed::Closed => Err(SinkError::Closed(self.spec.to_string())),
        }
    }
}

/// Consumer side: the task writing to the real sink.
pub struct SinkWorker {
    spec: SinkSpec,
    queue: Arc<DropOldestQueue<Record>>,
    counters: Arc<SinkCounters>,
    task: JoinHandle<()>,
}

/// Start a worker for `sink`.
pub fn spawn_queued(
    label: String,
    spec: SinkSpec,
    sink: Box<dyn Sink>,
    capacity: usize,
    retry: RetryPolicy,
) -> (SinkQueue, SinkWorker) {
    let queue = Arc::new(DropOldestQueue::new(capacity));
    let counters = Arc::new(SinkCounters::default());
    let task = tokio::spawn(write_loop(
        label,
        spec.clone(),
        sink,
        queue.clone(),
        counters.clone(),
        retry,
    ));

    (
        SinkQueue {
            spec: spec.clone(),
            queue: queue.clone(),
        },
        SinkWorker {
            spec,
            queue,
            counters,
            task,
        },
    )
}

async fn write_loop(
    label: String,
    spec: SinkSpec,
    mut sink: Box<dyn Sink>,
    queue: Arc<DropOldestQueue<Record>>,
    counters: Arc<SinkCounters>,
    retry: RetryPolicy,
) {
    while let Some(record) = queue.pop().await {
        let mut attempt = 0;
        loop {
            match sink.accept(&record).await {
                Ok(()) => {
                    if counters.success() {
                        info!("{}: {} recovered", label, spec);
                    }
                    break;
                }
                Err(e) if attempt < retry.retries => {
                    attempt += 1;
                    debug!("{}: {} (attempt {} of {})", label, e, attempt, retry.retries + 1);
                    tokio::time::sleep(retry.delay).await;
                }
                Err(e) => {
                    if counters.failure(&e) {
                        warn!("{}: {}", label, e);
                    } else {
                        debug!("{}: {}", label, e);
                    }
                    break;
                }
            }
        }
    }
    if let Err(e) = sink.close().await {
        warn!("{}: closing {}: {}", label, spec, e);
    }
    debug!("{}: {} closed", label, spec);
}

/// How a worker ended on [`SinkWorker::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drained {
    /// Everything queued was written (or failed) and the sink closed
    Complete,
    /// The timeout expired; the worker was aborted mid-write
    Abandoned { pending: usize },
}

impl SinkWorker {
    pub fn spec(&self) -> &SinkSpec {
        &self.spec
    }

    pub fn status(&self) -> SinkStatus {
        status_of(&self.spec, &self.counters, &self.queue)
    }

    /// Close the queue and wait up to `timeout` for the worker to finish.
    pub async fn drain(mut self, timeout: Duration) -> Drained {
        self.queue.close();
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(_) => Drained::Complete,
            Err(_) => {
                self.task.abort();
                Drained::Abandoned {
                    pending: self.queue.len(),
                }
            }
        }
    }
}

/// Everything needed to report on a sink after its worker is gone.
#[derive(Clone)]
pub struct SinkProbe {
    spec: SinkSpec,
    queue: Arc<DropOldestQueue<Record>>,
    counters: Arc<SinkCounters>,
}

impl SinkProbe {
    pub fn of(worker: &SinkWorker) -> Self {
        SinkProbe {
            spec: worker.spec.clone(),
            queue: worker.queue.clone(),
            counters: worker.counters.clone(),
        }
    }

    pub fn status(&self) -> SinkStatus {
        status_of(&self.spec, &self.counters, &self.queue)
    }

    pub fn is_healthy(&self) -> bool {
        self.counters.is_healthy()
    }
}

fn status_of(spec: &SinkSpec, counters: &SinkCounters, queue: &DropOldestQueue<Record>) -> SinkStatus {
    SinkStatus {
        sink: spec.clone(),
        written: counters.written(),
        failed: counters.failed(),
        dropped: queue.dropped(),
        healthy: counters.is_healthy(),
        last_error: counters.last_error.lock().unwrap().clone(),
    }
}
