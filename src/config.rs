//! Agent configuration.
//!
//! Two layers: [`AgentSettings`] is the static JSON file that tells the agent
//! where its store lives and how to log before anything else is known.
//! [`EffectiveConfig`] is the runtime configuration reconciled on every start
//! from the persisted record and the operator's overrides.

pub mod codec;
pub mod defaults;
mod overrides;
mod reconcile;
mod record;
mod runtime;
mod validate;

pub use defaults::{backend_names, HostPaths};
pub use overrides::CliOverrides;
pub use reconcile::{reconcile_fields, Origin, Reconciled, Reconciler};
pub use record::{PersistedRecord, CURRENT_SCHEMA_VERSION};
pub use runtime::{EffectiveConfig, OptionFlags, Tracked, TrackingOption};
pub use validate::{
    parse_logging_modes, parse_process_list, parse_report_channels, validate_config_file,
    HashAlgorithm, HashSelection, LoggingMode, ReportChannel, Verbosity,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::storage::BlobKey;

/// Environment variable naming the settings file.
pub const SETTINGS_PATH_ENV: &str = "TRACEKEEP_SETTINGS_PATH";
pub const DEFAULT_SETTINGS_PATH: &str = "tracekeep.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Encrypted blob store (SQLite). The machine secret sits next to it.
    pub store_path: PathBuf,
    /// Where the runtime configuration record is kept inside the store
    pub blob_key: BlobKey,
    /// Mixed into the store's encryption key
    pub entropy: String,
    /// Bootstrap-phase logging, before verbosity is reconciled
    pub log: LogSettings,
    /// Parent for the secure working directory; platform data dir if unset
    pub secure_base: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(".tracekeep").join("store.db"),
            blob_key: BlobKey::new(defaults::BLOB_LOCATION, defaults::BLOB_VALUE_NAME),
            entropy: "tracekeep-runtime-config".to_string(),
            log: LogSettings::default(),
            secure_base: None,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl AgentSettings {
    /// Load from JSON file if present; otherwise return default
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            if let Ok(data) = std::fs::read_to_string(path) {
                if let Ok(s) = serde_json::from_str::<AgentSettings>(&data) {
                    return s;
                }
            }
        }
        Self::default()
    }

    /// Settings path from the environment, falling back to the default name.
    pub fn path_from_env() -> PathBuf {
        std::env::var_os(SETTINGS_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH))
    }

    pub fn host_paths(&self) -> HostPaths {
        let host = HostPaths::detect();
        match &self.secure_base {
            Some(base) => host.with_secure_base(base.clone()),
            None => host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_broken_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = AgentSettings::load(&dir.path().join("absent.json"));
        assert_eq!(missing.blob_key.value_name, defaults::BLOB_VALUE_NAME);

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        assert!(AgentSettings::load(&broken).log.json);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"entropy": "abc", "log": {"level": "debug"}}"#).unwrap();
        let s = AgentSettings::load(&path);
        assert_eq!(s.entropy, "abc");
        assert_eq!(s.log.level, "debug");
        assert!(s.log.json);
        assert_eq!(s.blob_key.location, defaults::BLOB_LOCATION);
    }

    #[test]
    fn secure_base_overrides_detected_one() {
        let s = AgentSettings {
            secure_base: Some(PathBuf::from("/tmp/tk-base")),
            ..Default::default()
        };
        assert_eq!(s.host_paths().secure_base, Some(PathBuf::from("/tmp/tk-base")));
    }
}
