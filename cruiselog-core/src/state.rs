//! Logger pipeline state machine and status snapshots.
//!
//! ```text
//!            start              attached            stop
//!  Stopped ────────▶ Starting ──────────▶ Running ──────────▶ Stopping ──▶ Stopped
//!     ▲                 │                    │                                ▲
//!     │                 │ listener error     │ listener error                 │
//!     │                 ▼                    ▼                                │
//!     │              Failed ◀────────────────┘                                │
//!     │                 │  operator start: Starting                           │
//!     └─────────────────┴──── operator stop ──────────────────────────────────┘
//! ```
//!
//! `Failed` is absorbing for everything except explicit operator commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::InstrumentId;
use crate::mode::{ModeName, SinkSpec};

/// Lifecycle of one logger pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl PipelineState {
    /// Whether the transition `self -> next` is part of the state machine.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Failed, Starting)
                | (Failed, Stopped)
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Stopped => write!(f, "stopped"),
            PipelineState::Starting => write!(f, "starting"),
            PipelineState::Running => write!(f, "running"),
            PipelineState::Stopping => write!(f, "stopping"),
            PipelineState::Failed => write!(f, "failed"),
        }
    }
}

/// Counters for one active sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkStatus {
    pub sink: SinkSpec,
    pub written: u64,
    pub failed: u64,
    /// Records discarded because the sink queue overflowed
    pub dropped: u64,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Snapshot of one logger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggerStatus {
    pub instrument: InstrumentId,
    pub port: u16,
    pub data_id: String,
    pub state: PipelineState,
    /// Mode currently applied, `None` while stopped
    pub mode: Option<ModeName>,
    /// Mode was set for this logger alone, not by a global switch
    pub overridden: bool,
    pub sinks: Vec<SinkStatus>,
    /// Every sink in the plan is failing but ingestion continues
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_packet: Option<DateTime<Utc>>,
    pub packets_received: u64,
    /// Packets discarded between listener and pipeline
    pub ingress_dropped: u64,
}

impl LoggerStatus {
    pub fn active_sink_count(&self) -> usize {
        self.sinks.len()
    }
}

/// Snapshot of the whole fleet, keyed by instrument.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FleetStatus {
    pub loggers: BTreeMap<InstrumentId, LoggerStatus>,
}

impl FleetStatus {
    pub fn get(&self, id: &str) -> Option<&LoggerStatus> {
        self.loggers.get(&InstrumentId::from(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoggerStatus> {
        self.loggers.values()
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::PipelineState::*;
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn test_failure_transitions() {
        assert!(Starting.can_transition_to(Failed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Stopped.can_transition_to(Failed));
        assert!(!Stopping.can_transition_to(Failed));
        // Only operator commands leave Failed
        assert!(Failed.can_transition_to(Starting));
        assert!(Failed.can_transition_to(Stopped));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn test_no_shortcuts() {
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn test_state_serde() {
        assert_eq!(serde_json::to_string(&Running).unwrap(), "\"running\"");
        assert_eq!(Failed.to_string(), "failed");
        assert_eq!(PipelineState::default(), Stopped);
    }
}
