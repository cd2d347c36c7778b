//! Operator overrides for one run. `Some` means the operator asked for the
//! field this run, `None` means inherit. The presence of the value is the
//! request marker; an empty list that was asked for still overrides.

use std::path::{Path, PathBuf};

use crate::error::ValidationError;

use super::runtime::TrackingOption;
use super::validate::{self, HashSelection, LoggingMode, ReportChannel, Verbosity};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    /// Running as the collection service rather than interactively.
    pub service_mode: bool,
    pub backend_name: Option<String>,
    pub collection_service: Option<String>,
    pub working_directory: Option<PathBuf>,
    /// Set only through [`CliOverrides::with_config_file`], which validates
    /// the path first.
    pub(super) new_config_file: Option<PathBuf>,
    pub collection_logfile: Option<PathBuf>,
    pub hash_algorithms: Option<HashSelection>,
    pub revocation_check: Option<bool>,
    pub image_load_tracking: Option<bool>,
    pub network_tracking: Option<bool>,
    pub worker_threads: Option<u32>,
    pub verbosity: Option<Verbosity>,
    pub logging_channels: Option<Vec<LoggingMode>>,
    pub report_channels: Option<Vec<ReportChannel>>,
    pub module_load_processes: Option<Vec<String>>,
    pub network_processes: Option<Vec<String>>,
}

impl CliOverrides {
    pub fn service() -> Self {
        Self {
            service_mode: true,
            ..Self::default()
        }
    }

    /// Supply a new configuration file. It must exist; the stored value is
    /// its canonical path.
    pub fn with_config_file(mut self, path: &Path) -> Result<Self, ValidationError> {
        self.new_config_file = Some(validate::validate_config_file(path)?);
        Ok(self)
    }

    pub fn new_config_file(&self) -> Option<&Path> {
        self.new_config_file.as_deref()
    }

    pub fn tracking_request(&self, option: TrackingOption) -> Option<bool> {
        match option {
            TrackingOption::ImageLoad => self.image_load_tracking,
            TrackingOption::Network => self.network_tracking,
        }
    }
}
