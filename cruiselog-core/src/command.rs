//! Control surface grammar.
//!
//! ```text
//! <mode>                 switch every logger to <mode>
//! <instrument> <mode>    switch one logger to <mode>
//! <instrument> stop      stop one logger
//! <instrument> start     (re)start one logger in the current global mode
//! status                 print the fleet status
//! help                   print this text
//! quit                   stop every logger and exit
//! ```

use serde::{Deserialize, Serialize};

use crate::config::{FleetConfig, InstrumentId};
use crate::error::CommandError;
use crate::mode::ModeName;

pub const USAGE: &str = "<mode> | <instrument> <mode> | <instrument> stop | <instrument> start | status | help | quit";

/// One operator intent, already validated against the fleet vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    SetGlobalMode { mode: ModeName },
    SetLoggerMode { instrument: InstrumentId, mode: ModeName },
    StopLogger { instrument: InstrumentId },
    StartLogger { instrument: InstrumentId },
    Status,
    Help,
    Quit,
}

impl Command {
    /// Parse one line of operator input.
    pub fn parse(line: &str, fleet: &FleetConfig) -> Result<Command, CommandError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        Self::from_tokens(&tokens, fleet)
    }

    /// Build a command from already tokenized input.
    pub fn from_tokens(tokens: &[&str], fleet: &FleetConfig) -> Result<Command, CommandError> {
        match tokens {
            [] => Err(CommandError::Usage(USAGE.to_string())),
            ["quit"] => Ok(Command::Quit),
            ["status"] => Ok(Command::Status),
            ["help"] => Ok(Command::Help),
            [word] => {
                if fleet.modes.contains(word) {
                    Ok(Command::SetGlobalMode {
                        mode: ModeName::from(*word),
                    })
                } else {
                    Err(CommandError::Usage(format!(
                        "'{}' is not a mode or command; {}",
                        word, USAGE
                    )))
                }
            }
            [instrument, action] => {
                let instrument = fleet
                    .instrument(instrument)
                    .map(|i| i.id.clone())
                    .ok_or_else(|| CommandError::UnknownInstrument(instrument.to_string()))?;
                match *action {
                    "stop" => Ok(Command::StopLogger { instrument }),
                    "start" => Ok(Command::StartLogger { instrument }),
                    mode => Ok(Command::SetLoggerMode {
                        instrument,
                        mode: fleet.modes.lookup(mode)?,
                    }),
                }
            }
            _ => Err(CommandError::Usage(USAGE.to_string())),
        }
    }
}
