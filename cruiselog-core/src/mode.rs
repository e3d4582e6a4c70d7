//! Mode vocabulary and the mode resolver.
//!
//! A mode is a named combination of enabled sink kinds. Four modes are built
//! in; a fleet configuration may declare more, and each instrument may
//! redefine what a mode means for itself. [`ModeTable::resolve`] turns a mode
//! name plus an instrument into the concrete [`SinkPlan`] that instrument's
//! pipeline must run. It is pure: the pipelines never look at mode names.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use crate::config::InstrumentConfig;
use crate::error::UnknownModeError;

/// Words the control surface owns; neither modes nor instruments may use them.
pub const RESERVED_WORDS: &[&str] = &["quit", "status", "stop", "start", "help"];

/// Name of a mode, built in or declared by configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModeName(String);

impl ModeName {
    pub fn new(name: impl Into<String>) -> Self {
        ModeName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn off() -> Self {
        BuiltinMode::Off.name()
    }

    pub fn is_off(&self) -> bool {
        self.0 == BuiltinMode::Off.as_str()
    }
}

impl fmt::Display for ModeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModeName {
    fn from(s: &str) -> Self {
        ModeName(s.to_string())
    }
}

/// The closed set of modes every fleet understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinMode {
    Off,
    File,
    Db,
    FileAndDb,
}

impl BuiltinMode {
    pub const ALL: [BuiltinMode; 4] = [
        BuiltinMode::Off,
        BuiltinMode::File,
        BuiltinMode::Db,
        BuiltinMode::FileAndDb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinMode::Off => "off",
            BuiltinMode::File => "file",
            BuiltinMode::Db => "db",
            BuiltinMode::FileAndDb => "file_and_db",
        }
    }

    pub fn name(&self) -> ModeName {
        ModeName::new(self.as_str())
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }

    pub fn selection(&self) -> SinkSelection {
        match self {
            BuiltinMode::Off => SinkSelection::NONE,
            BuiltinMode::File => SinkSelection {
                file: true,
                database: false,
            },
            BuiltinMode::Db => SinkSelection {
                file: false,
                database: true,
            },
            BuiltinMode::FileAndDb => SinkSelection {
                file: true,
                database: true,
            },
        }
    }
}

impl fmt::Display for BuiltinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of sink a mode can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    File,
    #[serde(alias = "database")]
    Db,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::File => write!(f, "file"),
            SinkKind::Db => write!(f, "db"),
        }
    }
}

/// Which sink kinds a mode enables.
///
/// In configuration this is written as a list, e.g. `["file", "db"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<SinkKind>", into = "Vec<SinkKind>")]
pub struct SinkSelection {
    pub file: bool,
    pub database: bool,
}

impl SinkSelection {
    pub const NONE: SinkSelection = SinkSelection {
        file: false,
        database: false,
    };

    pub fn is_empty(&self) -> bool {
        !self.file && !self.database
    }

    pub fn kinds(&self) -> Vec<SinkKind> {
        let mut kinds = Vec::new();
        if self.file {
            kinds.push(SinkKind::File);
        }
        if self.database {
            kinds.push(SinkKind::Db);
        }
        kinds
    }
}

impl From<Vec<SinkKind>> for SinkSelection {
    fn from(kinds: Vec<SinkKind>) -> Self {
        SinkSelection {
            file: kinds.contains(&SinkKind::File),
            database: kinds.contains(&SinkKind::Db),
        }
    }
}

impl From<SinkSelection> for Vec<SinkKind> {
    fn from(selection: SinkSelection) -> Self {
        selection.kinds()
    }
}

/// How a file sink names the file it appends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRotation {
    /// Always append to the configured path
    #[default]
    None,
    /// Append `-YYYY-MM-DD` of the record's arrival date to the path
    Daily,
}

/// One concrete sink a pipeline must run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkSpec {
    File { path: PathBuf, rotation: FileRotation },
    Db { table: String },
}

impl SinkSpec {
    pub fn kind(&self) -> SinkKind {
        match self {
            SinkSpec::File { .. } => SinkKind::File,
            SinkSpec::Db { .. } => SinkKind::Db,
        }
    }
}

impl fmt::Display for SinkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkSpec::File { path, .. } => write!(f, "file:{}", path.display()),
            SinkSpec::Db { table } => write!(f, "db:{}", table),
        }
    }
}

/// The set of sinks that should be active for one instrument.
///
/// An empty plan is the "off" plan: the pipeline runs a null sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SinkPlan {
    sinks: BTreeSet<SinkSpec>,
}

impl SinkPlan {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SinkSpec> {
        self.sinks.iter()
    }

    pub fn contains(&self, spec: &SinkSpec) -> bool {
        self.sinks.contains(spec)
    }

    pub fn kinds(&self) -> Vec<SinkKind> {
        self.sinks.iter().map(SinkSpec::kind).collect()
    }
}

impl FromIterator<SinkSpec> for SinkPlan {
    fn from_iter<T: IntoIterator<Item = SinkSpec>>(iter: T) -> Self {
        SinkPlan {
            sinks: iter.into_iter().collect(),
        }
    }
}

/// Built-in modes plus the modes declared by configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModeTable {
    custom: BTreeMap<ModeName, SinkSelection>,
}

impl ModeTable {
    pub fn new(custom: BTreeMap<ModeName, SinkSelection>) -> Self {
        ModeTable { custom }
    }

    pub fn contains(&self, name: &str) -> bool {
        BuiltinMode::from_name(name).is_some() || self.custom.contains_key(&ModeName::from(name))
    }

    /// The fleet-wide meaning of a mode.
    pub fn selection(&self, name: &str) -> Option<SinkSelection> {
        match BuiltinMode::from_name(name) {
            Some(builtin) => Some(builtin.selection()),
            None => self.custom.get(&ModeName::from(name)).copied(),
        }
    }

    /// All mode names, built-ins first.
    pub fn names(&self) -> Vec<ModeName> {
        BuiltinMode::ALL
            .iter()
            .map(BuiltinMode::name)
            .chain(self.custom.keys().cloned())
            .collect()
    }

    /// Check a mode name against the vocabulary.
    pub fn lookup(&self, name: &str) -> Result<ModeName, UnknownModeError> {
        if self.contains(name) {
            Ok(ModeName::from(name))
        } else {
            Err(UnknownModeError(name.to_string()))
        }
    }

    /// Resolve a mode for one instrument.
    ///
    /// The instrument's own mapping for the mode wins over the fleet-wide
    /// one. The mode must exist in the fleet vocabulary either way.
    pub fn resolve(
        &self,
        mode: &str,
        instrument: &InstrumentConfig,
    ) -> Result<SinkPlan, UnknownModeError> {
        let fleet_selection = self
            .selection(mode)
            .ok_or_else(|| UnknownModeError(mode.to_string()))?;
        let selection = instrument
            .modes
            .get(&ModeName::from(mode))
            .copied()
            .unwrap_or(fleet_selection);

        Ok(plan_for(selection, instrument))
    }
}

/// Free-function form of [`ModeTable::resolve`].
pub fn resolve(
    modes: &ModeTable,
    mode: &str,
    instrument: &InstrumentConfig,
) -> Result<SinkPlan, UnknownModeError> {
    modes.resolve(mode, instrument)
}

fn plan_for(selection: SinkSelection, instrument: &InstrumentConfig) -> SinkPlan {
    let mut sinks = BTreeSet::new();
    if selection.file {
        sinks.insert(SinkSpec::File {
            path: instrument.file.path.clone(),
            rotation: instrument.file.rotation,
        });
    }
    if selection.database {
        sinks.insert(SinkSpec::Db {
            table: instrument.table.clone(),
        });
    }
    SinkPlan { sinks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;

    fn fleet() -> FleetConfig {
        FleetConfig::from_json_str(
            r#"{
                "fileRoot": "/data/raw",
                "modes": { "underway": ["file"], "port": [] },
                "instruments": {
                    "gyr1": { "port": 6224, "modes": { "underway": ["file", "db"] } },
                    "mwx1": { "port": 6225, "table": "met" }
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_builtin_modes() {
        let fleet = fleet();
        let mwx = fleet.instrument("mwx1").unwrap();

        let plan = fleet.modes.resolve("off", mwx).unwrap();
        assert!(plan.is_empty());

        let plan = fleet.modes.resolve("file", mwx).unwrap();
        assert_eq!(plan.kinds(), vec![SinkKind::File]);
        assert!(plan.contains(&SinkSpec::File {
            path: PathBuf::from("/data/raw/mwx1"),
            rotation: FileRotation::None,
        }));

        let plan = fleet.modes.resolve("db", mwx).unwrap();
        assert_eq!(plan.kinds(), vec![SinkKind::Db]);
        assert!(plan.contains(&SinkSpec::Db {
            table: "met".to_string()
        }));

        let plan = fleet.modes.resolve("file_and_db", mwx).unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_custom_mode_and_instrument_override() {
        let fleet = fleet();
        let gyr = fleet.instrument("gyr1").unwrap();
        let mwx = fleet.instrument("mwx1").unwrap();

        assert_eq!(
            fleet.modes.resolve("underway", mwx).unwrap().kinds(),
            vec![SinkKind::File]
        );
        assert_eq!(
            fleet.modes.resolve("underway", gyr).unwrap().kinds(),
            vec![SinkKind::File, SinkKind::Db]
        );
        assert!(fleet.modes.resolve("port", gyr).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_mode() {
        let fleet = fleet();
        let gyr = fleet.instrument("gyr1").unwrap();
        assert_eq!(
            fleet.modes.resolve("bogus", gyr),
            Err(UnknownModeError("bogus".to_string()))
        );
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let fleet = fleet();
        let gyr = fleet.instrument("gyr1").unwrap();
        for mode in fleet.modes.names() {
            let a = resolve(&fleet.modes, mode.as_str(), gyr).unwrap();
            let b = resolve(&fleet.modes, mode.as_str(), gyr).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_selection_serde() {
        let selection: SinkSelection = serde_json::from_str(r#"["db", "file"]"#).unwrap();
        assert!(selection.file && selection.database);
        let json = serde_json::to_string(&selection).unwrap();
        assert_eq!(json, r#"["file","db"]"#);
        let selection: SinkSelection = serde_json::from_str(r#"["database"]"#).unwrap();
        assert_eq!(selection.kinds(), vec![SinkKind::Db]);
    }

    #[test]
    fn test_mode_names_order() {
        let fleet = fleet();
        let names: Vec<String> = fleet
            .modes
            .names()
            .into_iter()
            .map(|m| m.to_string())
            .collect();
        assert_eq!(
            names,
            vec!["off", "file", "db", "file_and_db", "port", "underway"]
        );
    }
}
