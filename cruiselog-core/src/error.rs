//! Error types for fleet configuration, mode resolution and commands

use thiserror::Error;

/// Errors raised while loading a fleet configuration.
///
/// Any of these aborts startup: a partially valid fleet is never started.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The document is not valid JSON or does not match the schema
    #[error("Cannot parse configuration: {0}")]
    Parse(String),

    /// The configuration declares no instruments at all
    #[error("Configuration declares no instruments")]
    NoInstruments,

    /// Instrument id is empty or contains whitespace
    #[error("Invalid instrument id '{0}'")]
    InvalidInstrumentId(String),

    /// Instrument id or mode name collides with a control keyword
    #[error("'{0}' is a reserved control keyword")]
    Reserved(String),

    /// UDP port 0 is not a fixed port
    #[error("Instrument '{0}': invalid port number")]
    InvalidPort(String),

    /// Data-id prefix must not be empty
    #[error("Instrument '{0}': empty data id")]
    EmptyDataId(String),

    /// Two instruments on the same port cannot be told apart
    #[error("Port {port}: instruments '{first}' and '{second}' share data id '{data_id}'")]
    DuplicatePrefix {
        port: u16,
        first: String,
        second: String,
        data_id: String,
    },

    /// A custom mode redefines one of the built-in modes
    #[error("Mode '{0}' is built in and cannot be redefined")]
    BuiltinRedefined(String),

    /// Mode name is empty or contains whitespace
    #[error("Invalid mode name '{0}'")]
    InvalidModeName(String),

    /// A reference to a mode that is neither built in nor declared
    #[error("Instrument '{instrument}': unknown mode '{mode}'")]
    UnknownMode { instrument: String, mode: String },

    /// The configured default mode does not exist
    #[error("Default mode '{0}' is not declared")]
    UnknownDefaultMode(String),

    /// A numeric tunable is out of range
    #[error("Pipeline setting '{0}' must be greater than zero")]
    InvalidSetting(&'static str),
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// A mode name that is not in the configured enumeration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown mode '{0}'")]
pub struct UnknownModeError(pub String);

/// Errors raised when turning operator input into a [`crate::Command`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0}")]
    UnknownMode(#[from] UnknownModeError),

    #[error("Unknown instrument '{0}'")]
    UnknownInstrument(String),

    #[error("Usage: {0}")]
    Usage(String),
}
