//! One logger pipeline: an instrument's listener subscription bound to the
//! sinks of its current plan.
//!
//! ```text
//!  socket ──▶ ingress queue ──▶ pump ──▶ front sink ──▶ sink queues ──▶ workers
//!  (hub)      (drop oldest)     task    (null or fan-out) (drop oldest)  (file, db)
//! ```
//!
//! The pump takes the active-sink lock for every packet. Reconfiguring takes
//! the same lock, so the pump is paused while the old sinks drain and the new
//! ones are swapped in: a record is delivered to the old set or to the new
//! set, never to both.

use chrono::{DateTime, Utc};
use cruiselog_core::{
    InstrumentConfig, InstrumentId, LoggerStatus, ModeName, Packet, PipelineSettings,
    PipelineState, Record, SinkKind, SinkPlan, UnknownModeError,
};
use futures::future::join_all;
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::listener::{ListenerError, ListenerHub, Subscription};
use crate::queue::DropOldestQueue;
use crate::sink::{
    spawn_queued, CompositeSink, Drained, NullSink, RetryPolicy, Sink, SinkError, SinkFactory,
    SinkProbe, SinkWorker,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    UnknownMode(#[from] UnknownModeError),
    #[error("Cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: PipelineState,
    },
}

/// A pipeline changed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub instrument: InstrumentId,
    pub from: PipelineState,
    pub to: PipelineState,
    pub at: DateTime<Utc>,
}

/// A listener socket died under a running pipeline.
#[derive(Debug, Clone)]
pub struct ListenerFault {
    pub instrument: InstrumentId,
    /// Which run of the pipeline the fault belongs to
    pub generation: u64,
    pub error: ListenerError,
}

/// Shared by every pipeline of a fleet.
pub struct PipelineContext {
    pub hub: Arc<ListenerHub>,
    pub factory: Arc<dyn SinkFactory>,
    pub settings: PipelineSettings,
    pub db_retry: RetryPolicy,
    pub faults: mpsc::UnboundedSender<ListenerFault>,
    pub events: broadcast::Sender<StateChange>,
}

impl PipelineContext {
    fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.drain_timeout_ms)
    }

    fn retry_for(&self, kind: SinkKind) -> RetryPolicy {
        match kind {
            SinkKind::Db => self.db_retry,
            SinkKind::File => RetryPolicy::NONE,
        }
    }
}

#[derive(Default)]
struct PipelineCounters {
    packets_received: AtomicU64,
    last_packet: std::sync::Mutex<Option<DateTime<Utc>>>,
    degraded: AtomicBool,
}

impl PipelineCounters {
    fn packet(&self, at: DateTime<Utc>) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        *self.last_packet.lock().unwrap() = Some(at);
    }
}

/// The sink set currently receiving records.
struct ActiveSinks {
    front: Box<dyn Sink>,
    workers: Vec<SinkWorker>,
    probes: Vec<SinkProbe>,
}

impl ActiveSinks {
    fn off() -> Self {
        ActiveSinks {
            front: Box::new(NullSink),
            workers: Vec::new(),
            probes: Vec::new(),
        }
    }

    fn all_unhealthy(&self) -> bool {
        !self.probes.is_empty() && self.probes.iter().all(|p| !p.is_healthy())
    }
}

struct Running {
    subscription: Subscription,
    ingress: Arc<DropOldestQueue<Packet>>,
    active: Arc<Mutex<ActiveSinks>>,
    pump: JoinHandle<()>,
}

pub struct LoggerPipeline {
    config: InstrumentConfig,
    ctx: Arc<PipelineContext>,
    state: PipelineState,
    plan: Option<SinkPlan>,
    last_error: Option<String>,
    generation: u64,
    counters: Arc<PipelineCounters>,
    ingress_dropped: u64,
    probes: Vec<SinkProbe>,
    run: Option<Running>,
}

impl LoggerPipeline {
    pub fn new(config: InstrumentConfig, ctx: Arc<PipelineContext>) -> Self {
        LoggerPipeline {
            config,
            ctx,
            state: PipelineState::Stopped,
            plan: None,
            last_error: None,
            generation: 0,
            counters: Arc::new(PipelineCounters::default()),
            ingress_dropped: 0,
            probes: Vec::new(),
            run: None,
        }
    }

    pub fn id(&self) -> &InstrumentId {
        &self.config.id
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Sinks the pipeline is running, `None` unless running.
    pub fn plan(&self) -> Option<&SinkPlan> {
        self.plan.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Attach the listener and activate the sinks of `plan`.
    ///
    /// Starting a running pipeline with its current plan does nothing; with
    /// another plan it reconfigures. A failed pipeline is started afresh.
    pub async fn start(&mut self, plan: SinkPlan) -> Result<(), PipelineError> {
        match self.state {
            PipelineState::Running => {
                if self.plan.as_ref() == Some(&plan) {
                    debug!("{}: already running this plan", self.config.id);
                    return Ok(());
                }
                return self.reconfigure(plan).await;
            }
            PipelineState::Stopped | PipelineState::Failed => {}
            state => {
                return Err(PipelineError::InvalidState {
                    action: "start",
                    state,
                })
            }
        }

        // Leftovers of a failed run
        self.teardown().await;

        self.transition(PipelineState::Starting);
        self.generation += 1;

        let subscription = match self
            .ctx
            .hub
            .attach(&self.config, self.ctx.settings.ingress_capacity)
        {
            Ok(subscription) => subscription,
            Err(e) => return Err(self.fail_with(e.into())),
        };
        let active = match self.build_active(&plan) {
            Ok(active) => active,
            Err(e) => {
                subscription.detach().await;
                return Err(self.fail_with(e.into()));
            }
        };

        self.probes = active.probes.clone();
        self.counters.degraded.store(false, Ordering::Relaxed);
        let ingress = subscription.ingress();
        let active = Arc::new(Mutex::new(active));
        let pump = tokio::spawn(pump(
            self.config.id.clone(),
            self.config.data_id.clone(),
            ingress.clone(),
            active.clone(),
            self.counters.clone(),
            subscription.fault(),
            self.generation,
            self.ctx.faults.clone(),
        ));
        self.run = Some(Running {
            subscription,
            ingress,
            active,
            pump,
        });

        info!(
            "{}: logging to {} sink(s) on UDP port {}",
            self.config.id,
            plan.len(),
            self.config.port
        );
        self.plan = Some(plan);
        self.last_error = None;
        self.transition(PipelineState::Running);
        Ok(())
    }

    /// Swap the sink set of a running pipeline.
    ///
    /// The pump is held while the old sinks drain (bounded by the drain
    /// timeout) and the new ones take over. If the new sinks cannot be built
    /// the pipeline fails rather than keep running a plan nobody asked for.
    pub async fn reconfigure(&mut self, plan: SinkPlan) -> Result<(), PipelineError> {
        if !self.state.is_running() {
            return Err(PipelineError::InvalidState {
                action: "reconfigure",
                state: self.state,
            });
        }
        if self.plan.as_ref() == Some(&plan) {
            return Ok(());
        }

        let new_active = match self.build_active(&plan) {
            Ok(active) => active,
            Err(e) => {
                self.teardown().await;
                return Err(self.fail_with(e.into()));
            }
        };
        let Some(active) = self.run.as_ref().map(|r| r.active.clone()) else {
            return Err(PipelineError::InvalidState {
                action: "reconfigure",
                state: self.state,
            });
        };

        let mut guard = active.lock().await;
        self.probes = new_active.probes.clone();
        let old = std::mem::replace(&mut *guard, new_active);
        drain_sinks(&self.config.id, old, self.ctx.drain_timeout()).await;
        self.counters.degraded.store(false, Ordering::Relaxed);
        drop(guard);

        info!(
            "{}: reconfigured to {} sink(s)",
            self.config.id,
            plan.len()
        );
        self.plan = Some(plan);
        Ok(())
    }

    /// Close the listener, drain and close the sinks.
    pub async fn stop(&mut self) -> Result<(), PipelineError> {
        match self.state {
            PipelineState::Stopped => Ok(()),
            PipelineState::Running => {
                self.transition(PipelineState::Stopping);
                self.teardown().await;
                self.plan = None;
                self.transition(PipelineState::Stopped);
                Ok(())
            }
            PipelineState::Failed => {
                self.teardown().await;
                self.plan = None;
                self.transition(PipelineState::Stopped);
                Ok(())
            }
            state => Err(PipelineError::InvalidState {
                action: "stop",
                state,
            }),
        }
    }

    /// Handle a listener fault reported by the pump. Faults of an earlier
    /// run are ignored.
    pub async fn fail(&mut self, generation: u64, error: ListenerError) -> bool {
        if generation != self.generation || !self.state.is_running() {
            debug!("{}: ignoring stale fault: {}", self.config.id, error);
            return false;
        }
        self.teardown().await;
        self.fail_with(error.into());
        true
    }

    pub fn status(&self, mode: Option<ModeName>, overridden: bool) -> LoggerStatus {
        let current_dropped = self
            .run
            .as_ref()
            .map_or(0, |r| r.ingress.dropped());
        LoggerStatus {
            instrument: self.config.id.clone(),
            port: self.config.port,
            data_id: self.config.data_id.clone(),
            state: self.state,
            mode,
            overridden,
            sinks: self.probes.iter().map(SinkProbe::status).collect(),
            degraded: !self.probes.is_empty() && self.probes.iter().all(|p| !p.is_healthy()),
            last_error: self.last_error.clone(),
            last_packet: *self.counters.last_packet.lock().unwrap(),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            ingress_dropped: self.ingress_dropped + current_dropped,
        }
    }

    fn build_active(&self, plan: &SinkPlan) -> Result<ActiveSinks, SinkError> {
        if plan.is_empty() {
            return Ok(ActiveSinks::off());
        }

        // Create every sink before spawning any worker
        let sinks = plan
            .iter()
            .map(|spec| Ok((spec.clone(), self.ctx.factory.create(&self.config.id, spec)?)))
            .collect::<Result<Vec<_>, SinkError>>()?;

        let mut queues: Vec<Box<dyn Sink>> = Vec::with_capacity(sinks.len());
        let mut workers = Vec::with_capacity(sinks.len());
        for (spec, sink) in sinks {
            let retry = self.ctx.retry_for(spec.kind());
            let (queue, worker) = spawn_queued(
                self.config.id.to_string(),
                spec,
                sink,
                self.ctx.settings.queue_capacity,
                retry,
            );
            queues.push(Box::new(queue));
            workers.push(worker);
        }
        let probes = workers.iter().map(SinkProbe::of).collect();

        Ok(ActiveSinks {
            front: Box::new(CompositeSink::new(queues)),
            workers,
            probes,
        })
    }

    /// Release the listener and sinks of the current run, if any.
    async fn teardown(&mut self) {
        let Some(Running {
            subscription,
            ingress,
            active,
            mut pump,
        }) = self.run.take()
        else {
            return;
        };
        let timeout = self.ctx.drain_timeout();

        // Detaching closes the ingress queue; the pump delivers what is left
        subscription.detach().await;
        if tokio::time::timeout(timeout, &mut pump).await.is_err() {
            pump.abort();
            warn!(
                "{}: abandoned {} queued packet(s) on stop",
                self.config.id,
                ingress.len()
            );
        }
        self.ingress_dropped += ingress.dropped();

        let old = std::mem::replace(&mut *active.lock().await, ActiveSinks::off());
        drain_sinks(&self.config.id, old, timeout).await;
        self.probes.clear();
    }

    fn fail_with(&mut self, e: PipelineError) -> PipelineError {
        error!("{}: {}", self.config.id, e);
        self.last_error = Some(e.to_string());
        self.plan = None;
        self.probes.clear();
        self.transition(PipelineState::Failed);
        e
    }

    fn transition(&mut self, to: PipelineState) {
        let from = self.state;
        if !from.can_transition_to(to) {
            warn!("{}: unexpected transition {} -> {}", self.config.id, from, to);
        }
        info!("{}: {} -> {}", self.config.id, from, to);
        self.state = to;
        let _ = self.ctx.events.send(StateChange {
            instrument: self.config.id.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }
}

async fn drain_sinks(instrument: &InstrumentId, sinks: ActiveSinks, timeout: Duration) {
    let ActiveSinks { front, workers, .. } = sinks;
    drop(front);
    let specs: Vec<String> = workers.iter().map(|w| w.spec().to_string()).collect();
    let results = join_all(workers.into_iter().map(|w| w.drain(timeout))).await;
    for (spec, drained) in specs.iter().zip(results) {
        match drained {
            Drained::Complete => trace!("{}: {} drained", instrument, spec),
            Drained::Abandoned { pending } => warn!(
                "{}: abandoned write to {} after {:?}, {} record(s) not written",
                instrument, spec, timeout, pending
            ),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump(
    instrument: InstrumentId,
    data_id: String,
    ingress: Arc<DropOldestQueue<Packet>>,
    active: Arc<Mutex<ActiveSinks>>,
    counters: Arc<PipelineCounters>,
    fault: Arc<std::sync::Mutex<Option<ListenerError>>>,
    generation: u64,
    faults: mpsc::UnboundedSender<ListenerFault>,
) {
    while let Some(packet) = ingress.pop().await {
        counters.packet(packet.received_at);
        let record = Record::from_packet(instrument.clone(), &data_id, packet);

        let mut active = active.lock().await;
        if let Err(e) = active.front.accept(&record).await {
            trace!("{}: {}", instrument, e);
        }
        let degraded = active.all_unhealthy();
        drop(active);

        if counters.degraded.swap(degraded, Ordering::Relaxed) != degraded {
            if degraded {
                warn!("{}: every sink is failing, running degraded", instrument);
            } else {
                info!("{}: sinks recovered", instrument);
            }
        }
    }

    let error = fault.lock().unwrap().clone();
    if let Some(error) = error {
        let _ = faults.send(ListenerFault {
            instrument,
            generation,
            error,
        });
    }
}
