//! Effective runtime configuration: one per process, read-only once
//! reconciliation finishes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::defaults::{self, DEFAULT_BACKEND_CONFIG_FILE_NAME};
use super::validate::{HashSelection, LoggingMode, ReportChannel, Verbosity};

/// A value together with the value that was in effect before this run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracked<T> {
    pub current: T,
    pub previous: T,
}

impl<T: Clone> Tracked<T> {
    /// First-run value: nothing came before it.
    pub fn fresh(value: T) -> Self {
        Self {
            current: value.clone(),
            previous: value,
        }
    }

    /// Adopt `value`; the old current value becomes the previous one.
    pub fn replaced(self, value: T) -> Self {
        Self {
            current: value,
            previous: self.current,
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Tracked<U> {
        Tracked {
            current: f(self.current),
            previous: f(self.previous),
        }
    }
}

impl<T: PartialEq> Tracked<T> {
    pub fn changed(&self) -> bool {
        self.current != self.previous
    }
}

/// Tracking capabilities that are latched across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingOption {
    ImageLoad,
    Network,
}

impl TrackingOption {
    pub const ALL: [TrackingOption; 2] = [TrackingOption::ImageLoad, TrackingOption::Network];

    fn bit(self) -> u32 {
        match self {
            TrackingOption::ImageLoad => 0x1,
            TrackingOption::Network => 0x2,
        }
    }
}

/// Set of enabled tracking options, stored as a bitmask at rest.
///
/// Latch rule: an explicit request sets or clears one option; no request
/// leaves the persisted state alone. Absence of a request never clears a bit,
/// and bits that this build does not know about survive untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionFlags(u32);

impl OptionFlags {
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, option: TrackingOption) -> bool {
        self.0 & option.bit() != 0
    }

    pub fn with(self, option: TrackingOption, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | option.bit())
        } else {
            Self(self.0 & !option.bit())
        }
    }

    /// Apply one run's request (`None` = not requested) on top of persisted
    /// state.
    pub fn latch(self, option: TrackingOption, request: Option<bool>) -> Self {
        match request {
            Some(enabled) => self.with(option, enabled),
            None => self,
        }
    }

    pub fn enabled(self) -> Vec<TrackingOption> {
        TrackingOption::ALL
            .into_iter()
            .filter(|o| self.contains(*o))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub backend_name: Tracked<String>,
    pub backend32_service: Tracked<String>,
    pub backend64_service: Tracked<String>,
    pub collection_service: Tracked<String>,
    pub working_directory: Tracked<PathBuf>,
    pub config_file: Tracked<PathBuf>,
    pub collection_logfile: Tracked<PathBuf>,
    pub hash_algorithms: Tracked<HashSelection>,
    pub revocation_check: Tracked<bool>,
    pub options: Tracked<OptionFlags>,
    pub worker_threads: Tracked<u32>,
    pub verbosity: Tracked<Verbosity>,
    pub logging_channels: Tracked<Vec<LoggingMode>>,
    pub report_channels: Tracked<Vec<ReportChannel>>,
    pub module_load_processes: Tracked<Vec<String>>,
    pub network_processes: Tracked<Vec<String>>,
}

impl EffectiveConfig {
    pub fn image_load_tracking(&self) -> bool {
        self.options.current.contains(TrackingOption::ImageLoad)
    }

    pub fn network_tracking(&self) -> bool {
        self.options.current.contains(TrackingOption::Network)
    }

    pub fn is_new_collection_service(&self) -> bool {
        self.collection_service.changed()
    }

    pub fn is_new_backend32(&self) -> bool {
        self.backend32_service.changed()
    }

    pub fn is_new_backend64(&self) -> bool {
        self.backend64_service.changed()
    }

    pub fn is_new_working_directory(&self) -> bool {
        self.working_directory.changed()
    }

    /// Full paths of the 32- and 64-bit backend images.
    pub fn backend_files(&self) -> Option<(PathBuf, PathBuf)> {
        let dir = self.working_dir()?;
        if self.backend32_service.current.is_empty() || self.backend64_service.current.is_empty() {
            return None;
        }
        Some((
            dir.join(&self.backend32_service.current),
            dir.join(&self.backend64_service.current),
        ))
    }

    pub fn collection_service_binary(&self) -> Option<PathBuf> {
        let dir = self.working_dir()?;
        if self.collection_service.current.is_empty() {
            return None;
        }
        Some(dir.join(format!("{}.exe", self.collection_service.current)))
    }

    pub fn backend_config_file(&self) -> Option<PathBuf> {
        self.working_dir()
            .map(|dir| dir.join(DEFAULT_BACKEND_CONFIG_FILE_NAME))
    }

    /// Write the backend's configuration file into the working directory.
    pub fn generate_backend_config(&self) -> std::io::Result<PathBuf> {
        let dir = self.working_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "working directory not set")
        })?;
        defaults::generate_backend_config(
            dir,
            &self.hash_algorithms.current,
            self.revocation_check.current,
        )
    }

    fn working_dir(&self) -> Option<&Path> {
        let dir = self.working_directory.current.as_path();
        (!dir.as_os_str().is_empty()).then_some(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaced_archives_current() {
        let t = Tracked::fresh("old".to_string()).replaced("new".to_string());
        assert_eq!(t.current, "new");
        assert_eq!(t.previous, "old");
        assert!(t.changed());
    }

    #[test]
    fn latch_only_moves_on_request() {
        let flags = OptionFlags::default().latch(TrackingOption::Network, Some(true));
        assert!(flags.contains(TrackingOption::Network));

        let flags = flags.latch(TrackingOption::Network, None);
        assert!(flags.contains(TrackingOption::Network));

        let flags = flags.latch(TrackingOption::ImageLoad, Some(false));
        assert!(flags.contains(TrackingOption::Network));
        assert!(!flags.contains(TrackingOption::ImageLoad));

        let flags = flags.latch(TrackingOption::Network, Some(false));
        assert_eq!(flags.bits(), 0);
    }

    fn config_in(dir: &Path) -> EffectiveConfig {
        EffectiveConfig {
            backend_name: Tracked::fresh("tkbackend".into()),
            backend32_service: Tracked::fresh("tkbackend32.exe".into()),
            backend64_service: Tracked::fresh("tkbackend64.exe".into()),
            collection_service: Tracked::fresh("tkcollect".into()),
            working_directory: Tracked::fresh(dir.to_path_buf()),
            config_file: Tracked::fresh(dir.join("tracekeep_config.xml")),
            collection_logfile: Tracked::fresh(dir.join("tracekeep.log")),
            hash_algorithms: Tracked::fresh(HashSelection::default()),
            revocation_check: Tracked::fresh(true),
            options: Tracked::fresh(OptionFlags::default()),
            worker_threads: Tracked::fresh(4),
            verbosity: Tracked::fresh(Verbosity::Info),
            logging_channels: Tracked::fresh(Vec::new()),
            report_channels: Tracked::fresh(Vec::new()),
            module_load_processes: Tracked::fresh(Vec::new()),
            network_processes: Tracked::fresh(Vec::new()),
        }
    }

    #[test]
    fn derived_paths_join_the_working_directory() {
        let c = config_in(Path::new("/opt/tk"));
        assert_eq!(
            c.backend_files(),
            Some((
                PathBuf::from("/opt/tk/tkbackend32.exe"),
                PathBuf::from("/opt/tk/tkbackend64.exe")
            ))
        );
        assert_eq!(
            c.collection_service_binary(),
            Some(PathBuf::from("/opt/tk/tkcollect.exe"))
        );
        assert_eq!(
            c.backend_config_file(),
            Some(Path::new("/opt/tk").join(DEFAULT_BACKEND_CONFIG_FILE_NAME))
        );
    }

    #[test]
    fn derived_paths_need_a_working_directory() {
        let c = config_in(Path::new(""));
        assert_eq!(c.backend_files(), None);
        assert_eq!(c.collection_service_binary(), None);
        assert_eq!(c.backend_config_file(), None);
        let err = c.generate_backend_config().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);

        let mut unnamed = config_in(Path::new("/opt/tk"));
        unnamed.collection_service = Tracked::fresh(String::new());
        unnamed.backend64_service = Tracked::fresh(String::new());
        assert_eq!(unnamed.collection_service_binary(), None);
        assert_eq!(unnamed.backend_files(), None);
    }

    #[test]
    fn backend_config_is_written_where_it_is_derived() {
        let dir = tempfile::tempdir().unwrap();
        let c = config_in(dir.path());
        let written = c.generate_backend_config().unwrap();
        assert_eq!(Some(written.clone()), c.backend_config_file());
        assert!(written.is_file());
    }

    #[test]
    fn unknown_bits_survive() {
        let flags = OptionFlags::from_bits(0x80).latch(TrackingOption::ImageLoad, Some(true));
        assert_eq!(flags.bits(), 0x81);
        assert_eq!(flags.enabled(), vec![TrackingOption::ImageLoad]);
    }
}
