//! Runtime configuration reconciliation.
//!
//! A readable persisted record selects the reconcile path: each field takes
//! the operator's value when one was requested this run (archiving the
//! persisted value as previous) and inherits the persisted pair otherwise.
//! No readable record selects bootstrap, which fills every unrequested field
//! with its default. Either way the result is re-encoded at the current
//! schema version and saved.

use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::error::ConfigError;
use crate::logging::LogHandle;
use crate::storage::{BlobKey, BlobStore};

use super::codec;
use super::defaults::{self, HostPaths};
use super::overrides::CliOverrides;
use super::record::{PersistedRecord, CURRENT_SCHEMA_VERSION};
use super::runtime::{EffectiveConfig, OptionFlags, Tracked, TrackingOption};
use super::validate::HashSelection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// No readable record existed; defaults were generated.
    Bootstrapped,
    /// Merged with a persisted record.
    Reconciled,
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub config: EffectiveConfig,
    pub record: PersistedRecord,
    pub origin: Origin,
}

pub struct Reconciler<'a> {
    store: &'a dyn BlobStore,
    key: BlobKey,
    host: HostPaths,
    log: LogHandle,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn BlobStore, key: BlobKey, host: HostPaths, log: LogHandle) -> Self {
        Self {
            store,
            key,
            host,
            log,
        }
    }

    pub fn reconcile(&self, overrides: &CliOverrides) -> Result<Reconciled, ConfigError> {
        self.log.scope(|| self.run(overrides))
    }

    fn run(&self, overrides: &CliOverrides) -> Result<Reconciled, ConfigError> {
        let (config, origin) = match self.load_persisted() {
            Some(record) => (
                reconcile_fields(record.to_effective(), overrides),
                Origin::Reconciled,
            ),
            None => (self.bootstrap(overrides)?, Origin::Bootstrapped),
        };

        let record = PersistedRecord::from(&config);
        debug_assert_eq!(record.version, CURRENT_SCHEMA_VERSION);
        let bytes = codec::encode(&record);
        let reconciled = Reconciled {
            config,
            record,
            origin,
        };

        if let Err(source) = self.store.save(&self.key, &bytes) {
            error!(key = %self.key, error = %source, "runtime configuration not persisted");
            let partial = (!overrides.service_mode).then(|| Box::new(reconciled));
            return Err(ConfigError::PersistFailed { source, partial });
        }

        info!(
            origin = ?reconciled.origin,
            version = CURRENT_SCHEMA_VERSION,
            bytes = bytes.len(),
            "runtime configuration persisted"
        );
        Ok(reconciled)
    }

    fn load_persisted(&self) -> Option<PersistedRecord> {
        let Some(bytes) = self.store.load(&self.key) else {
            debug!(key = %self.key, "no persisted configuration");
            return None;
        };
        match codec::decode(&bytes) {
            Ok(record) => {
                if record.version != CURRENT_SCHEMA_VERSION {
                    warn!(
                        persisted = record.version,
                        current = CURRENT_SCHEMA_VERSION,
                        "persisted configuration from another schema version; reading known fields only"
                    );
                }
                Some(record)
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "persisted configuration undecodable");
                None
            }
        }
    }

    fn bootstrap(&self, o: &CliOverrides) -> Result<EffectiveConfig, ConfigError> {
        info!("no usable persisted configuration, bootstrapping defaults");

        let backend_name = o
            .backend_name
            .clone()
            .unwrap_or_else(|| defaults::DEFAULT_BACKEND_NAME.to_string());
        let (backend32, backend64) = defaults::backend_names(&backend_name);
        let working_directory = self.bootstrap_working_directory(o)?;
        let hash_algorithms = o.hash_algorithms.clone().unwrap_or_default();
        let revocation_check = o.revocation_check.unwrap_or(false);

        let config_file = match o.new_config_file() {
            Some(path) => path.to_path_buf(),
            None => defaults::generate_collection_config(
                &working_directory,
                &hash_algorithms,
                revocation_check,
            )
            .map_err(|source| ConfigError::ConfigFileUnavailable {
                dir: working_directory.clone(),
                source,
            })?,
        };

        let collection_logfile = o
            .collection_logfile
            .clone()
            .unwrap_or_else(|| working_directory.join(defaults::DEFAULT_LOG_FILE_NAME));

        let options = TrackingOption::ALL
            .into_iter()
            .fold(OptionFlags::default(), |flags, option| {
                flags.latch(option, o.tracking_request(option))
            });

        let report_channels = o
            .report_channels
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| defaults::DEFAULT_REPORT_CHANNELS.to_vec());

        Ok(EffectiveConfig {
            backend_name: Tracked::fresh(backend_name),
            backend32_service: Tracked::fresh(backend32),
            backend64_service: Tracked::fresh(backend64),
            collection_service: Tracked::fresh(
                o.collection_service
                    .clone()
                    .unwrap_or_else(|| defaults::DEFAULT_COLLECTION_SERVICE.to_string()),
            ),
            working_directory: Tracked::fresh(working_directory),
            config_file: Tracked::fresh(config_file),
            collection_logfile: Tracked::fresh(collection_logfile),
            hash_algorithms: Tracked::fresh(hash_algorithms),
            revocation_check: Tracked::fresh(revocation_check),
            options: Tracked::fresh(options),
            worker_threads: Tracked::fresh(
                o.worker_threads.unwrap_or(defaults::DEFAULT_WORKER_THREADS),
            ),
            verbosity: Tracked::fresh(o.verbosity.unwrap_or(defaults::DEFAULT_VERBOSITY)),
            logging_channels: Tracked::fresh(o.logging_channels.clone().unwrap_or_default()),
            report_channels: Tracked::fresh(report_channels),
            module_load_processes: Tracked::fresh(
                o.module_load_processes.clone().unwrap_or_default(),
            ),
            network_processes: Tracked::fresh(o.network_processes.clone().unwrap_or_default()),
        })
    }

    /// Requested directory if usable, else a fresh secure directory, else
    /// the system root.
    fn bootstrap_working_directory(&self, o: &CliOverrides) -> Result<PathBuf, ConfigError> {
        let mut tried = Vec::new();

        if let Some(dir) = &o.working_directory {
            if dir.is_dir() {
                return Ok(dir.clone());
            }
            warn!(dir = %dir.display(), "requested working directory is not a directory");
            tried.push(dir.clone());
        }

        if let Some(dir) = self.host.create_secure_dir() {
            return Ok(dir);
        }
        if let Some(base) = &self.host.secure_base {
            tried.push(base.clone());
        }

        let root = &self.host.system_root;
        if root.is_dir() {
            warn!(dir = %root.display(), "falling back to system root as working directory");
            return Ok(root.clone());
        }
        tried.push(root.clone());
        Err(ConfigError::NoWorkingDirectory { tried })
    }
}

fn adopt<T: Clone>(field: Tracked<T>, request: Option<&T>) -> Tracked<T> {
    match request {
        Some(value) => field.replaced(value.clone()),
        None => field,
    }
}

fn rebase(file: Tracked<PathBuf>, dir: &Tracked<PathBuf>) -> Tracked<PathBuf> {
    match file.current.strip_prefix(&dir.previous) {
        Ok(rest) => {
            let moved = dir.current.join(rest);
            debug!(from = %file.current.display(), to = %moved.display(), "log file follows working directory");
            file.replaced(moved)
        }
        Err(_) => file,
    }
}

/// Merge this run's overrides into the persisted configuration. A requested
/// working directory that is not a directory is ignored.
pub fn reconcile_fields(persisted: EffectiveConfig, o: &CliOverrides) -> EffectiveConfig {
    let p = persisted;

    let (backend_name, backend32_service, backend64_service) = match &o.backend_name {
        Some(name) => {
            let (b32, b64) = defaults::backend_names(name);
            (
                p.backend_name.replaced(name.clone()),
                p.backend32_service.replaced(b32),
                p.backend64_service.replaced(b64),
            )
        }
        None => (p.backend_name, p.backend32_service, p.backend64_service),
    };

    let requested: Vec<(TrackingOption, bool)> = TrackingOption::ALL
        .into_iter()
        .filter_map(|option| o.tracking_request(option).map(|on| (option, on)))
        .collect();
    let options = if requested.is_empty() {
        p.options
    } else {
        let latched = requested
            .iter()
            .fold(p.options.current, |flags, (option, on)| {
                flags.latch(*option, Some(*on))
            });
        p.options.replaced(latched)
    };

    let config_file = match o.new_config_file() {
        Some(path) => p.config_file.replaced(path.to_path_buf()),
        None => p.config_file,
    };

    let requested_dir = o.working_directory.as_ref().filter(|dir| {
        let usable = dir.is_dir();
        if !usable {
            warn!(dir = %dir.display(), "requested working directory is not a directory, keeping the persisted one");
        }
        usable
    });
    let moved = requested_dir.is_some_and(|dir| *dir != p.working_directory.current);
    let working_directory = adopt(p.working_directory, requested_dir);

    // An unrequested log file that lived in the old working directory follows
    // it to the new one.
    let collection_logfile = match &o.collection_logfile {
        Some(path) => p.collection_logfile.replaced(path.clone()),
        None if moved => rebase(p.collection_logfile, &working_directory),
        None => p.collection_logfile,
    };

    EffectiveConfig {
        backend_name,
        backend32_service,
        backend64_service,
        collection_service: adopt(p.collection_service, o.collection_service.as_ref()),
        working_directory,
        config_file,
        collection_logfile,
        hash_algorithms: adopt::<HashSelection>(p.hash_algorithms, o.hash_algorithms.as_ref()),
        revocation_check: adopt(p.revocation_check, o.revocation_check.as_ref()),
        options,
        worker_threads: adopt(p.worker_threads, o.worker_threads.as_ref()),
        verbosity: adopt(p.verbosity, o.verbosity.as_ref()),
        logging_channels: adopt(p.logging_channels, o.logging_channels.as_ref()),
        report_channels: adopt(p.report_channels, o.report_channels.as_ref()),
        module_load_processes: adopt(p.module_load_processes, o.module_load_processes.as_ref()),
        network_processes: adopt(p.network_processes, o.network_processes.as_ref()),
    }
}
