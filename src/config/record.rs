//! Durable counterpart of [`EffectiveConfig`]: plain strings, codes and
//! bitmasks, stamped with a schema version.

use std::path::PathBuf;
use tracing::warn;

use super::runtime::{EffectiveConfig, OptionFlags, Tracked};
use super::validate::{HashSelection, LoggingMode, ReportChannel, Verbosity};

/// Schema version written on every save.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedRecord {
    pub version: u32,
    pub option_flags: Tracked<u32>,
    pub worker_threads: Tracked<u32>,
    pub verbosity: Tracked<u32>,
    pub revocation_check: Tracked<u32>,
    pub backend_name: Tracked<String>,
    pub backend32_service: Tracked<String>,
    pub backend64_service: Tracked<String>,
    pub collection_service: Tracked<String>,
    pub working_directory: Tracked<String>,
    pub config_file: Tracked<String>,
    pub collection_logfile: Tracked<String>,
    pub hash_algorithms: Tracked<String>,
    pub logging_channels: Tracked<Vec<u32>>,
    pub report_channels: Tracked<Vec<u32>>,
    pub module_load_processes: Tracked<Vec<String>>,
    pub network_processes: Tracked<Vec<String>>,
}

fn path_string(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

impl From<&EffectiveConfig> for PersistedRecord {
    fn from(config: &EffectiveConfig) -> Self {
        let c = config.clone();
        Self {
            version: CURRENT_SCHEMA_VERSION,
            option_flags: c.options.map(OptionFlags::bits),
            worker_threads: c.worker_threads,
            verbosity: c.verbosity.map(Verbosity::code),
            revocation_check: c.revocation_check.map(u32::from),
            backend_name: c.backend_name,
            backend32_service: c.backend32_service,
            backend64_service: c.backend64_service,
            collection_service: c.collection_service,
            working_directory: c.working_directory.map(path_string),
            config_file: c.config_file.map(path_string),
            collection_logfile: c.collection_logfile.map(path_string),
            hash_algorithms: c.hash_algorithms.map(|h| h.to_string()),
            logging_channels: c
                .logging_channels
                .map(|l| l.into_iter().map(LoggingMode::code).collect()),
            report_channels: c
                .report_channels
                .map(|l| l.into_iter().map(ReportChannel::code).collect()),
            module_load_processes: c.module_load_processes,
            network_processes: c.network_processes,
        }
    }
}

impl PersistedRecord {
    /// The configuration this record describes when nothing is overridden.
    /// Values that fail validation degrade to defaults; unknown channel codes
    /// are dropped.
    pub fn to_effective(&self) -> EffectiveConfig {
        let r = self.clone();
        EffectiveConfig {
            backend_name: r.backend_name,
            backend32_service: r.backend32_service,
            backend64_service: r.backend64_service,
            collection_service: r.collection_service,
            working_directory: r.working_directory.map(PathBuf::from),
            config_file: r.config_file.map(PathBuf::from),
            collection_logfile: r.collection_logfile.map(PathBuf::from),
            hash_algorithms: r.hash_algorithms.map(|h| HashSelection::parse_or_default(&h)),
            revocation_check: r.revocation_check.map(|v| v != 0),
            options: r.option_flags.map(OptionFlags::from_bits),
            worker_threads: r.worker_threads,
            verbosity: r.verbosity.map(|code| {
                Verbosity::from_code(code).unwrap_or_else(|| {
                    warn!(code, "persisted verbosity out of range, using trace");
                    Verbosity::Trace
                })
            }),
            logging_channels: r
                .logging_channels
                .map(|codes| codes.into_iter().filter_map(LoggingMode::from_code).collect()),
            report_channels: r
                .report_channels
                .map(|codes| codes.into_iter().filter_map(ReportChannel::from_code).collect()),
            module_load_processes: r.module_load_processes,
            network_processes: r.network_processes,
        }
    }
}
