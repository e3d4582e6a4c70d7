//! # Cruiselog Core
//!
//! Platform-independent model of a shipboard data-logging fleet.
//!
//! This crate has **no I/O and no async dependencies**. It holds everything
//! about the fleet that can be decided without touching a socket:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  cruiselog-core (pure, no tokio, no sockets)                │
//! │  ├── config   (fleet document, validation)                  │
//! │  ├── mode     (mode vocabulary, resolver -> SinkPlan)       │
//! │  ├── demux    (shared-port routing by data-id prefix)       │
//! │  ├── state    (pipeline state machine, status snapshots)    │
//! │  ├── command  (control surface grammar)                     │
//! │  └── record   (Packet, Record)                              │
//! └─────────────────────────────────────────────────────────────┘
//!                             ▲
//!              ┌──────────────┴──────────────┐
//!              │  cruiselog-server           │
//!              │  (listeners, sinks, tokio)  │
//!              └─────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use cruiselog_core::{Command, FleetConfig};
//!
//! let fleet = FleetConfig::from_json_str(
//!     r#"{ "instruments": { "A": { "port": 6221 }, "B": { "port": 6221 } } }"#,
//! ).unwrap();
//!
//! let plan = fleet.modes.resolve("file", fleet.instrument("A").unwrap()).unwrap();
//! assert_eq!(plan.len(), 1);
//!
//! let route = fleet.routes.get(6221).unwrap();
//! assert_eq!(route.route(b"A,1,2,3").map(|id| id.as_str()), Some("A"));
//!
//! assert!(Command::parse("bogus", &fleet).is_err());
//! ```

pub mod command;
pub mod config;
pub mod demux;
pub mod error;
pub mod mode;
pub mod record;
pub mod state;

pub use command::Command;
pub use config::{FleetConfig, InstrumentConfig, InstrumentId, PipelineSettings};
pub use demux::{PortRoute, PortRoutes};
pub use error::{CommandError, ConfigError, UnknownModeError};
pub use mode::{ModeName, SinkKind, SinkPlan, SinkSpec};
pub use record::{Packet, Record};
pub use state::{FleetStatus, LoggerStatus, PipelineState, SinkStatus};
