//! The orchestrator owns one [`LoggerPipeline`] per configured instrument.
//!
//! All pipelines live in a single table behind an async `RwLock`. Every
//! mutation holds the write lock for the whole operation, so there is one
//! writer at a time and a [`Orchestrator::status`] snapshot never shows a
//! half-applied transition. Listener faults arrive on a channel and are
//! applied by a supervisor task through the same lock.

use cruiselog_core::{
    FleetConfig, FleetStatus, InstrumentId, LoggerStatus, ModeName, UnknownModeError,
};
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::listener::ListenerHub;
use crate::pipeline::{ListenerFault, LoggerPipeline, PipelineContext, PipelineError, StateChange};
use crate::sink::{RetryPolicy, SinkFactory};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error(transparent)]
    UnknownMode(#[from] UnknownModeError),
    #[error("Unknown instrument '{0}'")]
    UnknownInstrument(String),
    #[error("{0}: {1}")]
    Pipeline(InstrumentId, PipelineError),
    #[error("Shutting down")]
    ShuttingDown,
}

/// Per-instrument outcome of a fleet-wide operation.
pub type FleetOutcome = BTreeMap<InstrumentId, Result<(), PipelineError>>;

/// Failures of a fleet outcome, rendered for operators.
pub fn failures(outcome: &FleetOutcome) -> BTreeMap<InstrumentId, String> {
    outcome
        .iter()
        .filter_map(|(id, r)| r.as_ref().err().map(|e| (id.clone(), e.to_string())))
        .collect()
}

struct LoggerEntry {
    pipeline: LoggerPipeline,
    /// Mode applied to this logger, `None` while stopped
    mode: Option<ModeName>,
    overridden: bool,
}

impl LoggerEntry {
    fn status(&self) -> LoggerStatus {
        self.pipeline.status(self.mode.clone(), self.overridden)
    }

    async fn apply(&mut self, fleet: &FleetConfig, mode: &ModeName) -> Result<(), PipelineError> {
        let plan = fleet.modes.resolve(mode.as_str(), self.pipeline.config())?;
        self.mode = Some(mode.clone());
        let result = self.pipeline.start(plan).await;
        if result.is_err() {
            self.mode = None;
        }
        result
    }
}

struct FleetTable {
    global_mode: Option<ModeName>,
    loggers: BTreeMap<InstrumentId, LoggerEntry>,
    shut_down: bool,
}

struct Shared {
    fleet: Arc<FleetConfig>,
    table: RwLock<FleetTable>,
    events: broadcast::Sender<StateChange>,
    hub: Arc<ListenerHub>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Build a stopped pipeline for every instrument. Nothing is bound until
    /// a mode is applied.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(fleet: FleetConfig, factory: Arc<dyn SinkFactory>, bind_addr: IpAddr) -> Self {
        let fleet = Arc::new(fleet);
        let hub = Arc::new(ListenerHub::new(
            bind_addr,
            fleet.routes.clone(),
            fleet.pipeline.max_packet_size,
        ));
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);

        let ctx = Arc::new(PipelineContext {
            hub: hub.clone(),
            factory,
            settings: fleet.pipeline,
            db_retry: RetryPolicy {
                retries: fleet.database.retries,
                delay: Duration::from_millis(fleet.database.retry_delay_ms),
            },
            faults: faults_tx,
            events: events.clone(),
        });

        let loggers = fleet
            .instruments
            .values()
            .map(|inst| {
                (
                    inst.id.clone(),
                    LoggerEntry {
                        pipeline: LoggerPipeline::new(inst.clone(), ctx.clone()),
                        mode: None,
                        overridden: false,
                    },
                )
            })
            .collect();

        let shared = Arc::new(Shared {
            fleet,
            table: RwLock::new(FleetTable {
                global_mode: None,
                loggers,
                shut_down: false,
            }),
            events,
            hub,
            supervisor: std::sync::Mutex::new(None),
        });

        let task = tokio::spawn(supervise(Arc::downgrade(&shared), faults_rx));
        *shared.supervisor.lock().unwrap() = Some(task);

        Orchestrator { shared }
    }

    pub fn fleet(&self) -> Arc<FleetConfig> {
        self.shared.fleet.clone()
    }

    pub fn hub(&self) -> Arc<ListenerHub> {
        self.shared.hub.clone()
    }

    /// Every pipeline state change, fleet-wide.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.shared.events.subscribe()
    }

    pub async fn global_mode(&self) -> Option<ModeName> {
        self.shared.table.read().await.global_mode.clone()
    }

    /// Switch every logger to `mode`.
    ///
    /// Unknown modes are rejected before anything changes. Otherwise every
    /// pipeline is reconfigured concurrently; one pipeline failing leaves it
    /// Failed and does not affect the others. Per-logger overrides are
    /// cleared: the global switch wins.
    pub async fn apply_global_mode(&self, mode: &str) -> Result<FleetOutcome, OrchestratorError> {
        let mode = self.shared.fleet.modes.lookup(mode)?;
        let fleet = self.shared.fleet.clone();
        let mut table = self.shared.table.write().await;
        if table.shut_down {
            return Err(OrchestratorError::ShuttingDown);
        }

        info!("Switching all loggers to mode '{}'", mode);
        table.global_mode = Some(mode.clone());
        let results = join_all(table.loggers.iter_mut().map(|(id, entry)| {
            let fleet = &fleet;
            let mode = &mode;
            async move {
                entry.overridden = false;
                (id.clone(), entry.apply(fleet, mode).await)
            }
        }))
        .await;

        let outcome: FleetOutcome = results.into_iter().collect();
        for (id, error) in failures(&outcome) {
            warn!("{}: mode '{}' not applied: {}", id, mode, error);
        }
        Ok(outcome)
    }

    /// Switch one logger to `mode`, leaving the others alone.
    pub async fn set_logger_mode(&self, instrument: &str, mode: &str) -> Result<(), OrchestratorError> {
        let mode = self.shared.fleet.modes.lookup(mode)?;
        let fleet = self.shared.fleet.clone();
        let mut table = self.shared.table.write().await;
        if table.shut_down {
            return Err(OrchestratorError::ShuttingDown);
        }
        let global = table.global_mode.clone();
        let entry = lookup(&mut table, instrument)?;

        let result = entry.apply(&fleet, &mode).await;
        // A logger that failed to switch runs no mode at all
        entry.overridden = result.is_ok() && global.as_ref() != Some(&mode);
        result.map_err(|e| OrchestratorError::Pipeline(entry.pipeline.id().clone(), e))
    }

    /// Stop one logger. A later global switch starts it again.
    pub async fn stop_logger(&self, instrument: &str) -> Result<(), OrchestratorError> {
        let mut table = self.shared.table.write().await;
        if table.shut_down {
            return Err(OrchestratorError::ShuttingDown);
        }
        let entry = lookup(&mut table, instrument)?;

        entry.mode = None;
        entry.overridden = true;
        entry
            .pipeline
            .stop()
            .await
            .map_err(|e| OrchestratorError::Pipeline(entry.pipeline.id().clone(), e))
    }

    /// (Re)start one logger in the current global mode, or the configured
    /// default mode if none was applied yet.
    pub async fn start_logger(&self, instrument: &str) -> Result<(), OrchestratorError> {
        let fleet = self.shared.fleet.clone();
        let mut table = self.shared.table.write().await;
        if table.shut_down {
            return Err(OrchestratorError::ShuttingDown);
        }
        let mode = table
            .global_mode
            .clone()
            .unwrap_or_else(|| fleet.default_mode.clone());
        let entry = lookup(&mut table, instrument)?;

        entry.overridden = false;
        entry
            .apply(&fleet, &mode)
            .await
            .map_err(|e| OrchestratorError::Pipeline(entry.pipeline.id().clone(), e))
    }

    /// Consistent snapshot of every logger.
    pub async fn status(&self) -> FleetStatus {
        let table = self.shared.table.read().await;
        FleetStatus {
            loggers: table
                .loggers
                .iter()
                .map(|(id, entry)| (id.clone(), entry.status()))
                .collect(),
        }
    }

    pub async fn logger_status(&self, instrument: &str) -> Option<LoggerStatus> {
        let table = self.shared.table.read().await;
        table
            .loggers
            .get(&InstrumentId::from(instrument))
            .map(LoggerEntry::status)
    }

    /// Stop every pipeline and release every socket. Safe to call more than
    /// once; later calls return immediately.
    pub async fn shutdown(&self) -> FleetOutcome {
        let mut table = self.shared.table.write().await;
        if table.shut_down {
            return FleetOutcome::new();
        }
        table.shut_down = true;
        table.global_mode = None;
        info!("Stopping all loggers");

        let results = join_all(table.loggers.iter_mut().map(|(id, entry)| async move {
            entry.mode = None;
            entry.overridden = false;
            (id.clone(), entry.pipeline.stop().await)
        }))
        .await;

        if let Some(task) = self.shared.supervisor.lock().unwrap().take() {
            task.abort();
        }
        results.into_iter().collect()
    }

    pub async fn is_shut_down(&self) -> bool {
        self.shared.table.read().await.shut_down
    }
}

fn lookup<'a>(table: &'a mut FleetTable, instrument: &str) -> Result<&'a mut LoggerEntry, OrchestratorError> {
    table
        .loggers
        .get_mut(&InstrumentId::from(instrument))
        .ok_or_else(|| OrchestratorError::UnknownInstrument(instrument.to_string()))
}

/// Applies listener faults to the table. Ends when the orchestrator is gone.
async fn supervise(shared: Weak<Shared>, mut faults: mpsc::UnboundedReceiver<ListenerFault>) {
    while let Some(fault) = faults.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut table = shared.table.write().await;
        if let Some(entry) = table.loggers.get_mut(&fault.instrument) {
            if entry.pipeline.fail(fault.generation, fault.error).await {
                entry.mode = None;
            }
        }
    }
    debug!("Fault supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{DefaultSinkFactory, MemoryStore};
    use cruiselog_core::PipelineState;
    use std::net::Ipv4Addr;

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn orchestrator(json: &str) -> (Orchestrator, Arc<MemoryStore>) {
        let fleet = FleetConfig::from_json_str(json).unwrap();
        let store = Arc::new(MemoryStore::new());
        let orch = Orchestrator::new(
            fleet,
            Arc::new(DefaultSinkFactory::new(store.clone())),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        (orch, store)
    }

    struct Fleet {
        orch: Orchestrator,
        gyr_port: u16,
        _dir: tempfile::TempDir,
    }

    fn two_loggers() -> Fleet {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (free_port(), free_port());
        let (orch, _store) = orchestrator(&format!(
            r#"{{ "fileRoot": {root:?}, "modes": {{ "underway": ["db"] }},
                  "instruments": {{ "gyr1": {{ "port": {a} }}, "mwx1": {{ "port": {b} }} }} }}"#,
            root = dir.path().display().to_string()
        ));
        Fleet {
            orch,
            gyr_port: a,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_global_mode_reaches_every_logger() {
        let fleet = two_loggers();
        let orch = &fleet.orch;
        let outcome = orch.apply_global_mode("underway").await.unwrap();
        assert!(outcome.values().all(Result::is_ok));

        let status = orch.status().await;
        for logger in status.iter() {
            assert_eq!(logger.state, PipelineState::Running);
            assert_eq!(logger.mode, Some(ModeName::from("underway")));
            assert_eq!(logger.active_sink_count(), 1);
        }
        assert_eq!(orch.global_mode().await, Some(ModeName::from("underway")));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_mode_changes_nothing() {
        let fleet = two_loggers();
        let orch = &fleet.orch;
        orch.apply_global_mode("off").await.unwrap();
        let before = orch.status().await;

        assert_eq!(
            orch.apply_global_mode("bogus").await.unwrap_err(),
            OrchestratorError::UnknownMode(UnknownModeError("bogus".to_string()))
        );
        assert!(orch.set_logger_mode("gyr1", "bogus").await.is_err());
        assert_eq!(orch.status().await, before);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_global_switch_clears_override() {
        let fleet = two_loggers();
        let orch = &fleet.orch;
        orch.apply_global_mode("off").await.unwrap();
        orch.set_logger_mode("gyr1", "db").await.unwrap();

        let gyr = orch.logger_status("gyr1").await.unwrap();
        assert!(gyr.overridden);
        assert_eq!(gyr.mode, Some(ModeName::from("db")));
        assert!(!orch.logger_status("mwx1").await.unwrap().overridden);

        orch.apply_global_mode("file").await.unwrap();
        let gyr = orch.logger_status("gyr1").await.unwrap();
        assert!(!gyr.overridden);
        assert_eq!(gyr.mode, Some(ModeName::from("file")));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_switch_is_not_an_override() {
        let holder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let busy = holder.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let (orch, _store) = orchestrator(&format!(
            r#"{{ "fileRoot": {root:?}, "instruments": {{ "gyr1": {{ "port": {busy} }} }} }}"#,
            root = dir.path().display().to_string()
        ));

        assert!(matches!(
            orch.set_logger_mode("gyr1", "db").await,
            Err(OrchestratorError::Pipeline(..))
        ));
        let gyr = orch.logger_status("gyr1").await.unwrap();
        assert_eq!(gyr.state, PipelineState::Failed);
        assert_eq!(gyr.mode, None);
        assert!(!gyr.overridden);

        drop(holder);
        orch.set_logger_mode("gyr1", "db").await.unwrap();
        let gyr = orch.logger_status("gyr1").await.unwrap();
        assert_eq!(gyr.mode, Some(ModeName::from("db")));
        assert!(gyr.overridden);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_and_start_logger() {
        let fleet = two_loggers();
        let orch = &fleet.orch;
        orch.apply_global_mode("db").await.unwrap();

        orch.stop_logger("gyr1").await.unwrap();
        let gyr = orch.logger_status("gyr1").await.unwrap();
        assert_eq!(gyr.state, PipelineState::Stopped);
        assert_eq!(gyr.mode, None);
        assert_eq!(
            orch.logger_status("mwx1").await.unwrap().state,
            PipelineState::Running
        );

        orch.start_logger("gyr1").await.unwrap();
        let gyr = orch.logger_status("gyr1").await.unwrap();
        assert_eq!(gyr.state, PipelineState::Running);
        assert_eq!(gyr.mode, Some(ModeName::from("db")));

        assert_eq!(
            orch.stop_logger("nope").await.unwrap_err(),
            OrchestratorError::UnknownInstrument("nope".to_string())
        );
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_listener_fault_is_isolated() {
        let fleet = two_loggers();
        let (orch, gyr_port) = (&fleet.orch, fleet.gyr_port);
        orch.apply_global_mode("file").await.unwrap();
        assert!(orch.hub().fail_port(gyr_port, "cable cut"));

        let mut failed = false;
        for _ in 0..200 {
            if orch.logger_status("gyr1").await.unwrap().state == PipelineState::Failed {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(failed);
        let gyr = orch.logger_status("gyr1").await.unwrap();
        assert!(gyr.last_error.unwrap().contains("cable cut"));
        assert_eq!(
            orch.logger_status("mwx1").await.unwrap().state,
            PipelineState::Running
        );

        // Operator recovery
        orch.start_logger("gyr1").await.unwrap();
        assert_eq!(
            orch.logger_status("gyr1").await.unwrap().state,
            PipelineState::Running
        );
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let fleet = two_loggers();
        let orch = &fleet.orch;
        orch.apply_global_mode("file_and_db").await.unwrap();

        let outcome = orch.shutdown().await;
        assert_eq!(outcome.len(), 2);
        assert!(orch.shutdown().await.is_empty());
        assert!(orch.is_shut_down().await);
        assert!(orch.hub().open_ports().is_empty());
        for logger in orch.status().await.iter() {
            assert_eq!(logger.state, PipelineState::Stopped);
        }
        assert_eq!(
            orch.apply_global_mode("file").await.unwrap_err(),
            OrchestratorError::ShuttingDown
        );
    }
}
