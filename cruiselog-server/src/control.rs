//! Control surface.
//!
//! Operator commands from every front end (the interactive console, the
//! REST API) travel over one channel to a single [`ControlSurface`] task,
//! so exactly one command executes against the orchestrator at a time.

use cruiselog_core::command::USAGE;
use cruiselog_core::{Command, CommandError, FleetConfig, FleetStatus, InstrumentId, LoggerStatus, ModeName};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io::{self, BufRead};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_graceful_shutdown::SubsystemHandle;

use crate::orchestrator::{failures, Orchestrator, OrchestratorError};

const CHANNEL_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Control surface is not running")]
    Closed,
    #[error("Cannot read console: {0}")]
    Io(#[from] std::io::Error),
}

/// The answer to one command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum ControlReply {
    #[serde(rename_all = "camelCase")]
    ModeApplied {
        mode: ModeName,
        /// Instruments the mode could not be applied to, with the reason
        failed: BTreeMap<InstrumentId, String>,
    },
    Logger { status: LoggerStatus },
    #[serde(rename_all = "camelCase")]
    Status {
        global_mode: Option<ModeName>,
        loggers: FleetStatus,
    },
    Help {
        usage: String,
        modes: Vec<ModeName>,
        instruments: Vec<InstrumentId>,
    },
    /// The command was refused; nothing changed
    Rejected { error: String },
    /// The command was accepted but the logger could not follow
    Failed { error: String },
    Quit,
}

impl ControlReply {
    pub fn is_ok(&self) -> bool {
        match self {
            ControlReply::Rejected { .. } | ControlReply::Failed { .. } => false,
            ControlReply::ModeApplied { failed, .. } => failed.is_empty(),
            _ => true,
        }
    }

    fn rejected(e: impl ToString) -> Self {
        ControlReply::Rejected {
            error: e.to_string(),
        }
    }
}

impl fmt::Display for ControlReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlReply::ModeApplied { mode, failed } => {
                write!(f, "mode {}", mode)?;
                if failed.is_empty() {
                    write!(f, " applied to all loggers")
                } else {
                    write!(f, " applied, {} logger(s) failed:", failed.len())?;
                    for (id, error) in failed {
                        write!(f, "\n  {}: {}", id, error)?;
                    }
                    Ok(())
                }
            }
            ControlReply::Logger { status } => write_logger(f, status),
            ControlReply::Status {
                global_mode,
                loggers,
            } => {
                match global_mode {
                    Some(mode) => write!(f, "global mode: {}", mode)?,
                    None => write!(f, "global mode: none")?,
                }
                for status in loggers.iter() {
                    writeln!(f)?;
                    write_logger(f, status)?;
                }
                Ok(())
            }
            ControlReply::Help {
                usage,
                modes,
                instruments,
            } => {
                writeln!(f, "usage: {}", usage)?;
                writeln!(f, "modes: {}", join(modes))?;
                write!(f, "instruments: {}", join(instruments))
            }
            ControlReply::Rejected { error } => write!(f, "error: {}", error),
            ControlReply::Failed { error } => write!(f, "failed: {}", error),
            ControlReply::Quit => write!(f, "bye"),
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_logger(f: &mut fmt::Formatter<'_>, s: &LoggerStatus) -> fmt::Result {
    write!(
        f,
        "{:<10} port {:<5} {:<9} mode {:<12} sinks {}",
        s.instrument.as_str(),
        s.port,
        s.state.to_string(),
        s.mode.as_ref().map_or("-", ModeName::as_str),
        s.active_sink_count()
    )?;
    if s.overridden {
        write!(f, " (override)")?;
    }
    if s.degraded {
        write!(f, " DEGRADED")?;
    }
    write!(f, " packets {}", s.packets_received)?;
    if let Some(at) = s.last_packet {
        write!(f, " last {}", at.format("%Y-%m-%dT%H:%M:%SZ"))?;
    }
    let dropped: u64 = s.ingress_dropped + s.sinks.iter().map(|k| k.dropped).sum::<u64>();
    if dropped > 0 {
        write!(f, " dropped {}", dropped)?;
    }
    if let Some(error) = &s.last_error {
        write!(f, " error: {}", error)?;
    }
    Ok(())
}

pub struct ControlRequest {
    pub command: Command,
    pub reply: oneshot::Sender<ControlReply>,
}

/// Sends commands to the control surface. Cheap to clone.
#[derive(Clone)]
pub struct ControlHandle {
    fleet: Arc<FleetConfig>,
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    pub fn fleet(&self) -> &FleetConfig {
        &self.fleet
    }

    pub async fn send(&self, command: Command) -> Result<ControlReply, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlRequest { command, reply })
            .await
            .map_err(|_| ControlError::Closed)?;
        rx.await.map_err(|_| ControlError::Closed)
    }

    /// Parse and execute one line of operator input. Input that does not
    /// parse is rejected without reaching the orchestrator.
    pub async fn send_line(&self, line: &str) -> Result<ControlReply, ControlError> {
        match Command::parse(line, &self.fleet) {
            Ok(command) => self.send(command).await,
            Err(e) => Ok(ControlReply::rejected(e)),
        }
    }

    /// Build and execute a command from tokens, as the REST API does.
    pub async fn send_tokens(&self, tokens: &[&str]) -> Result<Result<ControlReply, CommandError>, ControlError> {
        match Command::from_tokens(tokens, &self.fleet) {
            Ok(command) => self.send(command).await.map(Ok),
            Err(e) => Ok(Err(e)),
        }
    }
}

pub struct ControlSurface {
    orchestrator: Orchestrator,
    rx: mpsc::Receiver<ControlRequest>,
}

impl ControlSurface {
    pub fn new(orchestrator: Orchestrator) -> (ControlSurface, ControlHandle) {
        let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
        let handle = ControlHandle {
            fleet: orchestrator.fleet(),
            tx,
        };
        (ControlSurface { orchestrator, rx }, handle)
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), ControlError> {
        if self.serve(subsys.on_shutdown_requested()).await {
            info!("Quit requested");
            subsys.request_shutdown();
        }
        Ok(())
    }

    /// Execute commands until `shutdown` resolves, every handle is gone, or
    /// a `quit` command was executed. Returns true on `quit`.
    pub async fn serve(mut self, shutdown: impl Future<Output = ()>) -> bool {
        tokio::pin!(shutdown);
        loop {
            tokio::select! { biased;
                _ = &mut shutdown => {
                    debug!("Control surface stopping");
                    return false;
                }
                request = self.rx.recv() => {
                    let Some(ControlRequest { command, reply }) = request else {
                        return false;
                    };
                    let quit = command == Command::Quit;
                    let answer = execute(&self.orchestrator, command).await;
                    let _ = reply.send(answer);
                    if quit {
                        return true;
                    }
                }
            }
        }
    }
}

/// Run one command against the orchestrator.
pub async fn execute(orchestrator: &Orchestrator, command: Command) -> ControlReply {
    debug!("Executing {:?}", command);
    match command {
        Command::SetGlobalMode { mode } => match orchestrator.apply_global_mode(mode.as_str()).await {
            Ok(outcome) => ControlReply::ModeApplied {
                mode,
                failed: failures(&outcome),
            },
            Err(e) => ControlReply::rejected(e),
        },
        Command::SetLoggerMode { instrument, mode } => {
            let result = orchestrator
                .set_logger_mode(instrument.as_str(), mode.as_str())
                .await;
            logger_reply(orchestrator, &instrument, result).await
        }
        Command::StopLogger { instrument } => {
            let result = orchestrator.stop_logger(instrument.as_str()).await;
            logger_reply(orchestrator, &instrument, result).await
        }
        Command::StartLogger { instrument } => {
            let result = orchestrator.start_logger(instrument.as_str()).await;
            logger_reply(orchestrator, &instrument, result).await
        }
        Command::Status => ControlReply::Status {
            global_mode: orchestrator.global_mode().await,
            loggers: orchestrator.status().await,
        },
        Command::Help => {
            let fleet = orchestrator.fleet();
            ControlReply::Help {
                usage: USAGE.to_string(),
                modes: fleet.modes.names(),
                instruments: fleet.instrument_ids().cloned().collect(),
            }
        }
        Command::Quit => {
            let outcome = orchestrator.shutdown().await;
            for (id, error) in failures(&outcome) {
                warn!("{}: did not stop cleanly: {}", id, error);
            }
            ControlReply::Quit
        }
    }
}

async fn logger_reply(
    orchestrator: &Orchestrator,
    instrument: &InstrumentId,
    result: Result<(), OrchestratorError>,
) -> ControlReply {
    match result {
        Ok(()) => match orchestrator.logger_status(instrument.as_str()).await {
            Some(status) => ControlReply::Logger { status },
            None => ControlReply::rejected(OrchestratorError::UnknownInstrument(instrument.to_string())),
        },
        Err(e @ OrchestratorError::Pipeline(..)) => ControlReply::Failed {
            error: e.to_string(),
        },
        Err(e) => ControlReply::rejected(e),
    }
}

/// Feed console lines to the control surface and print the replies.
///
/// Stdin is read on a plain thread: a blocked read must not hold up runtime
/// shutdown. End of input does not stop the logger.
pub async fn run_console(handle: ControlHandle, subsys: SubsystemHandle) -> Result<(), ControlError> {
    let (tx, mut lines) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    println!("{}", handle.send(Command::Help).await?);

    loop {
        tokio::select! { biased;
            _ = subsys.on_shutdown_requested() => {
                break;
            }
            line = lines.recv() => {
                let Some(line) = line else {
                    debug!("Console closed");
                    break;
                };
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let reply = handle.send_line(&line).await?;
                println!("{}", reply);
                if reply == ControlReply::Quit {
                    break;
                }
            }
        }
    }
    Ok(())
}
