//! Fleet configuration.
//!
//! The document is deserialized into loosely typed `Raw*` structs and then
//! validated as a whole into an immutable [`FleetConfig`]. A single bad entry
//! fails the load; there is no partially valid fleet.
//!
//! ```json
//! {
//!   "defaultMode": "off",
//!   "fileRoot": "/data/cruise/raw",
//!   "database": { "dir": "/data/cruise/db", "retries": 2 },
//!   "pipeline": { "queueCapacity": 1024, "drainTimeoutMs": 2000 },
//!   "modes": { "underway": ["file", "db"] },
//!   "instruments": {
//!     "gyr1": { "port": 6224, "dataId": "gyr1", "file": { "rotation": "daily" } },
//!     "mwx1": { "port": 6224, "dataId": "mwx1", "table": "met" }
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::demux::PortRoutes;
use crate::error::ConfigError;
use crate::mode::{BuiltinMode, FileRotation, ModeName, ModeTable, SinkSelection, RESERVED_WORDS};

const DEFAULT_FILE_ROOT: &str = "logs";

/// Identifier of one instrument, the key of the `instruments` table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(String);

impl InstrumentId {
    pub fn new(id: impl Into<String>) -> Self {
        InstrumentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstrumentId {
    fn from(s: &str) -> Self {
        InstrumentId(s.to_string())
    }
}

/// Where a file sink for one instrument appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTarget {
    pub path: PathBuf,
    pub rotation: FileRotation,
}

/// One validated instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentConfig {
    pub id: InstrumentId,
    /// Human readable name, defaults to the id
    pub name: String,
    /// Leading bytes of every record this instrument emits
    pub data_id: String,
    pub port: u16,
    pub file: FileTarget,
    pub table: String,
    /// Per-instrument meaning of modes, overriding the fleet-wide table
    pub modes: BTreeMap<ModeName, SinkSelection>,
}

/// Settings for the record store behind database sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub dir: PathBuf,
    /// Extra attempts after a failed insert
    pub retries: u32,
    pub retry_delay_ms: u64,
}

/// Runtime tunables shared by every pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PipelineSettings {
    /// Records buffered per sink before the oldest is dropped
    pub queue_capacity: usize,
    /// Packets buffered between listener and pipeline
    pub ingress_capacity: usize,
    /// Bounded wait for sinks to drain on reconfigure and stop
    pub drain_timeout_ms: u64,
    /// Receive buffer size for one datagram
    pub max_packet_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            queue_capacity: 1024,
            ingress_capacity: 4096,
            drain_timeout_ms: 2000,
            max_packet_size: 65535,
        }
    }
}

/// The complete, validated fleet.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetConfig {
    pub default_mode: ModeName,
    pub modes: ModeTable,
    pub instruments: BTreeMap<InstrumentId, InstrumentConfig>,
    pub database: DatabaseSettings,
    pub pipeline: PipelineSettings,
    pub routes: PortRoutes,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawFleetConfig {
    #[serde(default)]
    default_mode: Option<String>,
    #[serde(default)]
    file_root: Option<PathBuf>,
    #[serde(default)]
    database: RawDatabase,
    #[serde(default)]
    pipeline: PipelineSettings,
    #[serde(default)]
    modes: BTreeMap<String, SinkSelection>,
    #[serde(default)]
    instruments: BTreeMap<String, RawInstrument>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawDatabase {
    #[serde(default)]
    dir: Option<PathBuf>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    retry_delay_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawInstrument {
    #[serde(default)]
    name: Option<String>,
    port: u16,
    #[serde(default)]
    data_id: Option<String>,
    #[serde(default)]
    file: Option<RawFileTarget>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    modes: BTreeMap<String, SinkSelection>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawFileTarget {
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    rotation: FileRotation,
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(char::is_whitespace)
}

fn check_not_reserved(s: &str) -> Result<(), ConfigError> {
    if RESERVED_WORDS.contains(&s) {
        return Err(ConfigError::Reserved(s.to_string()));
    }
    Ok(())
}

impl FleetConfig {
    /// Parse and validate a JSON fleet document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: RawFleetConfig = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    /// Parse and validate a JSON fleet document from bytes.
    pub fn from_json_slice(json: &[u8]) -> Result<Self, ConfigError> {
        let raw: RawFleetConfig = serde_json::from_slice(json)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawFleetConfig) -> Result<Self, ConfigError> {
        let mut custom = BTreeMap::new();
        for (name, selection) in raw.modes {
            if !is_word(&name) {
                return Err(ConfigError::InvalidModeName(name));
            }
            check_not_reserved(&name)?;
            if BuiltinMode::from_name(&name).is_some() {
                return Err(ConfigError::BuiltinRedefined(name));
            }
            custom.insert(ModeName::new(name), selection);
        }
        let modes = ModeTable::new(custom);

        let default_mode = raw
            .default_mode
            .unwrap_or_else(|| BuiltinMode::Off.as_str().to_string());
        if !modes.contains(&default_mode) {
            return Err(ConfigError::UnknownDefaultMode(default_mode));
        }

        let pipeline = raw.pipeline;
        if pipeline.queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting("queueCapacity"));
        }
        if pipeline.ingress_capacity == 0 {
            return Err(ConfigError::InvalidSetting("ingressCapacity"));
        }
        if pipeline.max_packet_size == 0 {
            return Err(ConfigError::InvalidSetting("maxPacketSize"));
        }
        if pipeline.drain_timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting("drainTimeoutMs"));
        }

        let file_root = raw
            .file_root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE_ROOT));
        let database = DatabaseSettings {
            dir: raw.database.dir.unwrap_or_else(|| file_root.join("db")),
            retries: raw.database.retries.unwrap_or(2),
            retry_delay_ms: raw.database.retry_delay_ms.unwrap_or(50),
        };

        if raw.instruments.is_empty() {
            return Err(ConfigError::NoInstruments);
        }

        let mut instruments = BTreeMap::new();
        for (id, inst) in raw.instruments {
            let config = Self::instrument_from_raw(&modes, &file_root, id, inst)?;
            instruments.insert(config.id.clone(), config);
        }

        let routes = PortRoutes::build(instruments.values())?;

        Ok(FleetConfig {
            default_mode: ModeName::new(default_mode),
            modes,
            instruments,
            database,
            pipeline,
            routes,
        })
    }

    fn instrument_from_raw(
        modes: &ModeTable,
        file_root: &PathBuf,
        id: String,
        raw: RawInstrument,
    ) -> Result<InstrumentConfig, ConfigError> {
        if !is_word(&id) {
            return Err(ConfigError::InvalidInstrumentId(id));
        }
        check_not_reserved(&id)?;
        if raw.port == 0 {
            return Err(ConfigError::InvalidPort(id));
        }

        let data_id = raw.data_id.unwrap_or_else(|| id.clone());
        if data_id.is_empty() {
            return Err(ConfigError::EmptyDataId(id));
        }

        let mut overrides = BTreeMap::new();
        for (mode, selection) in raw.modes {
            if !modes.contains(&mode) {
                return Err(ConfigError::UnknownMode {
                    instrument: id,
                    mode,
                });
            }
            overrides.insert(ModeName::new(mode), selection);
        }

        let raw_file = raw.file.unwrap_or_default();
        let file = FileTarget {
            path: raw_file.path.unwrap_or_else(|| file_root.join(&id)),
            rotation: raw_file.rotation,
        };

        Ok(InstrumentConfig {
            name: raw.name.unwrap_or_else(|| id.clone()),
            table: raw.table.unwrap_or_else(|| id.clone()),
            id: InstrumentId::new(id),
            data_id,
            port: raw.port,
            file,
            modes: overrides,
        })
    }

    pub fn instrument(&self, id: &str) -> Option<&InstrumentConfig> {
        self.instruments.get(&InstrumentId::from(id))
    }

    pub fn instrument_ids(&self) -> impl Iterator<Item = &InstrumentId> {
        self.instruments.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let fleet = FleetConfig::from_json_str(r#"{ "instruments": { "gyr1": { "port": 6224 } } }"#)
            .unwrap();
        assert_eq!(fleet.default_mode, ModeName::off());
        let gyr = fleet.instrument("gyr1").unwrap();
        assert_eq!(gyr.name, "gyr1");
        assert_eq!(gyr.data_id, "gyr1");
        assert_eq!(gyr.table, "gyr1");
        assert_eq!(gyr.file.path, PathBuf::from("logs/gyr1"));
        assert_eq!(fleet.database.dir, PathBuf::from("logs/db"));
        assert_eq!(fleet.database.retries, 2);
        assert_eq!(fleet.pipeline, PipelineSettings::default());
    }

    #[test]
    fn test_full_config() {
        let fleet = FleetConfig::from_json_str(
            r#"{
                "defaultMode": "underway",
                "fileRoot": "/data/raw",
                "database": { "dir": "/data/db", "retries": 0, "retryDelayMs": 5 },
                "pipeline": { "queueCapacity": 8, "drainTimeoutMs": 100 },
                "modes": { "underway": ["file", "db"] },
                "instruments": {
                    "s330": { "name": "Seapath 330", "port": 6221, "dataId": "$GPGGA",
                              "file": { "path": "/data/raw/nav/s330", "rotation": "daily" } }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(fleet.default_mode, ModeName::new("underway"));
        let s330 = fleet.instrument("s330").unwrap();
        assert_eq!(s330.name, "Seapath 330");
        assert_eq!(s330.data_id, "$GPGGA");
        assert_eq!(s330.file.rotation, FileRotation::Daily);
        assert_eq!(s330.file.path, PathBuf::from("/data/raw/nav/s330"));
        assert_eq!(fleet.database.retry_delay_ms, 5);
        assert_eq!(fleet.pipeline.queue_capacity, 8);
        assert_eq!(fleet.pipeline.ingress_capacity, 4096);
    }

    #[test]
    fn test_malformed_entry_fails_whole_load() {
        let err = FleetConfig::from_json_str(
            r#"{ "instruments": { "gyr1": { "port": 6224 }, "bad": { "port": 0 } } }"#,
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::InvalidPort("bad".to_string()));

        let err = FleetConfig::from_json_str(r#"{ "instruments": { "gyr1": { "prt": 6224 } } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = FleetConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejected_configs() {
        let cases = [
            (r#"{ "instruments": {} }"#, ConfigError::NoInstruments),
            (
                r#"{ "instruments": { "quit": { "port": 1 } } }"#,
                ConfigError::Reserved("quit".to_string()),
            ),
            (
                r#"{ "instruments": { "a b": { "port": 1 } } }"#,
                ConfigError::InvalidInstrumentId("a b".to_string()),
            ),
            (
                r#"{ "instruments": { "a": { "port": 1, "dataId": "" } } }"#,
                ConfigError::EmptyDataId("a".to_string()),
            ),
            (
                r#"{ "modes": { "file": [] }, "instruments": { "a": { "port": 1 } } }"#,
                ConfigError::BuiltinRedefined("file".to_string()),
            ),
            (
                r#"{ "modes": { "status": [] }, "instruments": { "a": { "port": 1 } } }"#,
                ConfigError::Reserved("status".to_string()),
            ),
            (
                r#"{ "defaultMode": "cruise", "instruments": { "a": { "port": 1 } } }"#,
                ConfigError::UnknownDefaultMode("cruise".to_string()),
            ),
            (
                r#"{ "instruments": { "a": { "port": 1, "modes": { "cruise": ["db"] } } } }"#,
                ConfigError::UnknownMode {
                    instrument: "a".to_string(),
                    mode: "cruise".to_string(),
                },
            ),
            (
                r#"{ "pipeline": { "queueCapacity": 0 }, "instruments": { "a": { "port": 1 } } }"#,
                ConfigError::InvalidSetting("queueCapacity"),
            ),
            (
                r#"{ "pipeline": { "drainTimeoutMs": 0 }, "instruments": { "a": { "port": 1 } } }"#,
                ConfigError::InvalidSetting("drainTimeoutMs"),
            ),
        ];

        for (json, expected) in cases {
            assert_eq!(FleetConfig::from_json_str(json).unwrap_err(), expected, "{}", json);
        }
    }

    #[test]
    fn test_shared_port_duplicate_prefix() {
        let err = FleetConfig::from_json_str(
            r#"{ "instruments": {
                "a": { "port": 6221, "dataId": "X" },
                "b": { "port": 6221, "dataId": "X" }
            } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePrefix { port: 6221, .. }));
    }
}
