//! # Cruiselog Server
//!
//! Runs one logging pipeline per shipboard instrument and switches the
//! whole fleet between logging modes on operator command.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      cruiselog-server                        │
//! │  ┌──────────────┐   ┌──────────────┐                         │
//! │  │ console      │   │ REST API     │                         │
//! │  │ (stdin)      │   │ (axum)       │                         │
//! │  └──────┬───────┘   └──────┬───────┘                         │
//! │         └────────┬─────────┘                                 │
//! │                  ▼                                           │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ ControlSurface: one command at a time                  │  │
//! │  └───────────────────────┬────────────────────────────────┘  │
//! │                          ▼                                   │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Orchestrator (Arc<RwLock<FleetTable>>)                 │  │
//! │  │  - global mode, per-logger overrides                   │  │
//! │  │  - one LoggerPipeline per instrument                   │  │
//! │  └───────────────────────┬────────────────────────────────┘  │
//! │                          ▼                                   │
//! │  ListenerHub ──▶ ingress queue ──▶ pump ──▶ sink queues      │
//! │  (UDP, shared ports demultiplexed by data id)  │             │
//! │                                     file sink ◀┴▶ db sink    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## REST API
//!
//! | Endpoint | Description |
//! |----------|-------------|
//! | `GET /api/v1/loggers` | Status of every logger |
//! | `GET /api/v1/loggers/{id}` | Status of one logger |
//! | `PUT /api/v1/loggers/{id}` | `{"mode": ..}` or `{"action": "start" \| "stop"}` |
//! | `GET /api/v1/mode` | Current global mode |
//! | `PUT /api/v1/mode` | `{"mode": ..}` switch every logger |
//! | `GET /api/v1/modes` | Known modes |
//!
//! ## Example: Starting the Server
//!
//! ```rust,no_run
//! use clap::Parser;
//! use cruiselog_server::{load_fleet, orchestrator::Orchestrator, sink, Cli};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let args = Cli::parse_from(["cruiselog", "--config", "fleet.json"]);
//!     let fleet = load_fleet(&args.config_path()).unwrap();
//!     let store = Arc::new(sink::JsonlStore::new(fleet.database.dir.clone()));
//!     let orchestrator = Orchestrator::new(
//!         fleet,
//!         Arc::new(sink::DefaultSinkFactory::new(store)),
//!         args.bind,
//!     );
//!     orchestrator.apply_global_mode("file").await.unwrap();
//! }
//! ```
//!
//! ## Command-Line Interface
//!
//! See [`Cli`] for all available options. Key options:
//!
//! - `-c, --config` - Fleet document (default: in the user data directory)
//! - `-m, --mode` - Mode to apply at startup (default: the fleet's `defaultMode`)
//! - `-p, --port` - HTTP server port (default: 6520)
//! - `-v` - Increase verbosity (use multiple times)

use clap::Parser;
use cruiselog_core::{ConfigError, FleetConfig};
use std::{
    io,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
};
use thiserror::Error;

pub mod control;
pub mod listener;
pub mod network;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod sink;
pub mod web;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const CONFIG_FILE: &str = "fleet.json";

#[derive(Parser, Clone, Debug)]
#[command(version, about = "Shipboard instrument data logger")]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Fleet document (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Mode to apply at startup, instead of the fleet's default mode
    #[arg(short, long)]
    pub mode: Option<String>,

    /// Port for webserver
    #[arg(short, long, default_value_t = 6520)]
    pub port: u16,

    /// Address the instrument listeners bind to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Do not start the REST API
    #[arg(long, default_value_t = false)]
    pub no_http: bool,

    /// Do not read commands from stdin
    #[arg(long, default_value_t = false)]
    pub no_stdin: bool,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }
}

/// `fleet.json` in the per-user data directory, or the working directory
/// when the platform has none.
pub fn default_config_path() -> PathBuf {
    match directories::ProjectDirs::from("org", "cruiselog", "cruiselog") {
        Some(dirs) => dirs.data_dir().join(CONFIG_FILE),
        None => PathBuf::from(CONFIG_FILE),
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid fleet document {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
}

pub fn load_fleet(path: &Path) -> Result<FleetConfig, LoadError> {
    let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_owned(),
        source,
    })?;
    FleetConfig::from_json_slice(&bytes).map_err(|source| LoadError::Config {
        path: path.to_owned(),
        source,
    })
}
