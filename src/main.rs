//! TraceKeep agent entrypoint: reconcile the runtime configuration, then
//! capture and normalize provider events until stopped.
//! Events come from a replay file (`--replay`) or, in service mode, from
//! whatever feeds the trace session until Ctrl+C.

use clap::Parser;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracekeep_agent::{
    collectors::{
        ChannelProcessor, EventCollector, EventProcessor, Normalizer, RawRecord, RecordFeeder,
        TraceSession,
    },
    config::{
        parse_logging_modes, parse_process_list, parse_report_channels, AgentSettings,
        CliOverrides, HashSelection, Reconciled, Reconciler, Verbosity,
    },
    error::ConfigError,
    logging::{LogOptions, StructuredLogger},
    storage::SqliteBlobStore,
};
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run as the collection service
    #[arg(long)]
    service: bool,
    /// Trace backend name; the 32/64-bit image names derive from it
    #[arg(long)]
    backend_name: Option<String>,
    /// Collection service name
    #[arg(long)]
    service_name: Option<String>,
    #[arg(long)]
    working_dir: Option<PathBuf>,
    /// Configuration file to use instead of the current one
    #[arg(long)]
    config: Option<PathBuf>,
    /// Logging channels: console|file
    #[arg(long)]
    log_channels: Option<String>,
    /// Collection service log file
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// critical|error|warning|info|debug|trace|off
    #[arg(long)]
    verbosity: Option<String>,
    /// Report channels: eventlog|debugevents|etw|file
    #[arg(long)]
    report: Option<String>,
    #[arg(long)]
    workers: Option<String>,
    /// Hash algorithms: imphash|md5|sha1|sha256 or *
    #[arg(long)]
    hash: Option<String>,
    /// Enable image-load tracking, optionally for a comma-separated process list
    #[arg(long, num_args = 0..=1, value_name = "PROCS", conflicts_with = "no_track_image_loads")]
    track_image_loads: Option<Option<String>>,
    #[arg(long)]
    no_track_image_loads: bool,
    /// Enable network tracking, optionally for a comma-separated process list
    #[arg(long, num_args = 0..=1, value_name = "PROCS", conflicts_with = "no_track_network")]
    track_network: Option<Option<String>>,
    #[arg(long)]
    no_track_network: bool,
    #[arg(long, conflicts_with = "no_check_revocation")]
    check_revocation: bool,
    #[arg(long)]
    no_check_revocation: bool,
    /// Print the reconciled configuration and exit
    #[arg(long)]
    print_config: bool,
    /// Newline-delimited JSON raw records to feed the trace session
    #[arg(long, value_name = "NDJSON")]
    replay: Option<PathBuf>,
}

fn flag(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

/// Requested-but-invalid values are logged and left unrequested; only an
/// unusable `--config` is an error. The service reconciles with what is
/// persisted and takes no field overrides.
fn build_overrides(args: &Args) -> Result<CliOverrides, BoxError> {
    if args.service {
        return Ok(CliOverrides::service());
    }
    let mut o = CliOverrides::default();

    o.backend_name = args.backend_name.clone().filter(|s| !s.is_empty());
    o.collection_service = args.service_name.clone().filter(|s| !s.is_empty());
    o.working_directory = args.working_dir.clone();
    o.collection_logfile = args.log_file.clone();
    o.verbosity = args.verbosity.as_deref().map(Verbosity::parse);

    if let Some(raw) = &args.hash {
        match HashSelection::parse(raw) {
            Ok(h) => o.hash_algorithms = Some(h),
            Err(e) => warn!(value = %raw, error = %e, "ignoring --hash"),
        }
    }
    if let Some(raw) = &args.workers {
        match raw.trim().parse::<u32>() {
            Ok(n) if n > 0 => o.worker_threads = Some(n),
            _ => warn!(value = %raw, "ignoring --workers"),
        }
    }
    if let Some(raw) = &args.report {
        let channels = parse_report_channels(raw);
        if channels.is_empty() {
            warn!(value = %raw, "ignoring --report, no known channel");
        } else {
            o.report_channels = Some(channels);
        }
    }
    if let Some(raw) = &args.log_channels {
        let modes = parse_logging_modes(raw);
        if modes.is_empty() {
            warn!(value = %raw, "ignoring --log-channels, no known channel");
        } else {
            o.logging_channels = Some(modes);
        }
    }

    o.revocation_check = flag(args.check_revocation, args.no_check_revocation);
    o.image_load_tracking = flag(args.track_image_loads.is_some(), args.no_track_image_loads);
    o.network_tracking = flag(args.track_network.is_some(), args.no_track_network);
    if let Some(Some(procs)) = &args.track_image_loads {
        o.module_load_processes = Some(parse_process_list(procs));
    }
    if let Some(Some(procs)) = &args.track_network {
        o.network_processes = Some(parse_process_list(procs));
    }

    if let Some(path) = &args.config {
        o = o.with_config_file(path)?;
    }
    Ok(o)
}

fn reconcile(
    settings: &AgentSettings,
    overrides: &CliOverrides,
    log: &tracekeep_agent::logging::LogHandle,
) -> Result<Reconciled, BoxError> {
    let store = SqliteBlobStore::open(&settings.store_path, settings.entropy.as_bytes())?;
    let reconciler = Reconciler::new(
        &store,
        settings.blob_key.clone(),
        settings.host_paths(),
        log.clone(),
    );
    match reconciler.reconcile(overrides) {
        Ok(r) => Ok(r),
        Err(ConfigError::PersistFailed {
            source,
            partial: Some(r),
        }) => {
            warn!(error = %source, "continuing with an unsaved configuration");
            Ok(*r)
        }
        Err(e) => Err(e.into()),
    }
}

fn replay(path: &Path, feeder: &RecordFeeder) -> Result<u64, BoxError> {
    let file = std::fs::File::open(path)?;
    let mut fed = 0u64;
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawRecord>(&line) {
            Ok(record) => {
                feeder.push(record)?;
                fed += 1;
            }
            Err(e) => warn!(line = n + 1, error = %e, "skipping malformed record"),
        }
    }
    Ok(fed)
}

fn wait_for_ctrlc() {
    static STOP: AtomicBool = AtomicBool::new(false);
    if let Err(e) = ctrlc::set_handler(|| STOP.store(true, Ordering::Relaxed)) {
        warn!(error = %e, "no Ctrl+C handler; stopping immediately");
        return;
    }
    info!("capturing (Ctrl+C to stop)");
    while !STOP.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(250));
    }
}

fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    let settings = AgentSettings::load(&AgentSettings::path_from_env());

    let boot_log = StructuredLogger::build(&LogOptions::console(&settings.log.level, settings.log.json));
    let boot_guard = boot_log.enter();
    info!(store = %settings.store_path.display(), "TraceKeep agent starting");

    let overrides = build_overrides(&args)?;
    let reconciled = reconcile(&settings, &overrides, &boot_log)?;
    let config = reconciled.config;

    if args.print_config {
        let report = serde_json::json!({
            "origin": reconciled.origin,
            "schema_version": reconciled.record.version,
            "config": config,
            "derived": {
                "backend_files": config.backend_files(),
                "collection_service_binary": config.collection_service_binary(),
                "backend_config_file": config.backend_config_file(),
            },
        });
        StructuredLogger::emit_json(&report, &mut std::io::stdout().lock());
        return Ok(());
    }

    let runtime_log = StructuredLogger::build(&LogOptions::from_config(&config, settings.log.json));
    drop(boot_guard);
    let _guard = runtime_log.enter();
    info!(
        service = %config.collection_service.current,
        working_dir = %config.working_directory.current.display(),
        image_loads = config.image_load_tracking(),
        network = config.network_tracking(),
        "runtime configuration in effect"
    );
    match config.generate_backend_config() {
        Ok(path) => info!(path = %path.display(), "backend configuration written"),
        Err(e) => warn!(error = %e, "backend configuration not written"),
    }

    let normalizer = Arc::new(Normalizer::for_config(&config));
    let (processor, mut events) = ChannelProcessor::channel();
    let processor: Arc<dyn EventProcessor> = Arc::new(processor);

    let printer = std::thread::Builder::new()
        .name("event-printer".into())
        .spawn(move || {
            let stdout = std::io::stdout();
            while let Some(event) = events.blocking_recv() {
                StructuredLogger::emit_json(&event, &mut stdout.lock());
            }
        })?;

    let mut session = TraceSession::start(&config.collection_service.current, runtime_log.clone())?;
    let mut collectors = Vec::new();
    for provider in normalizer.table().providers() {
        let mut collector = EventCollector::new(
            provider,
            Arc::clone(&normalizer),
            Arc::clone(&processor),
            runtime_log.clone(),
        );
        collector.start(&mut session)?;
        collectors.push(collector);
    }
    drop(processor);

    if let Some(path) = &args.replay {
        match replay(path, &session.feeder()) {
            Ok(fed) => info!(records = fed, "replay finished"),
            Err(e) => error!(path = %path.display(), error = %e, "replay failed"),
        }
    } else if overrides.service_mode {
        wait_for_ctrlc();
    } else {
        info!("no replay input and not in service mode; nothing to capture");
    }

    for collector in &mut collectors {
        collector.stop(&session);
    }
    session.stop();
    for collector in &collectors {
        info!(provider = collector.provider(), stats = ?collector.stats(), "collector finished");
    }
    drop(collectors);
    if printer.join().is_err() {
        error!("event printer panicked");
    }

    info!("TraceKeep agent stopping");
    Ok(())
}
