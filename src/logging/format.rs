//! Subscriber construction: JSON lines or plain text, to stdout and/or a log
//! file. The subscriber is handed out as a [`LogHandle`] instead of being
//! installed process-wide.

use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::dispatcher::{self, DefaultGuard};
use tracing::Dispatch;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{EffectiveConfig, LoggingMode, Verbosity};

/// Handle to one constructed subscriber. Cheap to clone; components keep one
/// and run their work inside [`LogHandle::scope`].
#[derive(Clone)]
pub struct LogHandle {
    dispatch: Dispatch,
}

impl LogHandle {
    /// Handle that drops everything.
    pub fn disabled() -> Self {
        Self {
            dispatch: Dispatch::none(),
        }
    }

    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        dispatcher::with_default(&self.dispatch, f)
    }

    /// Make this handle the current thread's default until the guard drops.
    pub fn enter(&self) -> DefaultGuard {
        dispatcher::set_default(&self.dispatch)
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }
}

impl std::fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle").finish_non_exhaustive()
    }
}

/// What a subscriber should look like.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    pub console: bool,
    pub file: Option<PathBuf>,
}

impl LogOptions {
    pub fn console(level: &str, json: bool) -> Self {
        Self {
            level: level.to_string(),
            json,
            console: true,
            file: None,
        }
    }

    /// Options for the runtime phase, from the reconciled verbosity and
    /// logging channels. No channel selected means console.
    pub fn from_config(config: &EffectiveConfig, json: bool) -> Self {
        let channels = &config.logging_channels.current;
        let file = channels
            .contains(&LoggingMode::File)
            .then(|| config.collection_logfile.current.clone())
            .filter(|p| !p.as_os_str().is_empty());
        Self {
            level: verbosity_directive(config.verbosity.current).to_string(),
            json,
            console: channels.is_empty() || channels.contains(&LoggingMode::Console),
            file,
        }
    }
}

pub fn verbosity_directive(verbosity: Verbosity) -> &'static str {
    match verbosity {
        Verbosity::Trace => "trace",
        Verbosity::Debug => "debug",
        Verbosity::Info => "info",
        Verbosity::Warn => "warn",
        Verbosity::Error | Verbosity::Critical => "error",
        Verbosity::Off => "off",
    }
}

pub struct StructuredLogger;

impl StructuredLogger {
    /// Build a subscriber: level from RUST_LOG or `options.level`. A log file
    /// that cannot be opened is reported on stderr and skipped.
    pub fn build(options: &LogOptions) -> LogHandle {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&options.level));

        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
        if options.console {
            layers.push(fmt_layer(options.json, std::io::stdout, true));
        }
        if let Some(path) = &options.file {
            match open_log_file(path) {
                Ok(file) => layers.push(fmt_layer(options.json, Mutex::new(file), false)),
                Err(e) => eprintln!("log file {} unavailable: {}", path.display(), e),
            }
        }

        let subscriber = tracing_subscriber::registry().with(layers).with(filter);
        LogHandle {
            dispatch: Dispatch::new(subscriber),
        }
    }

    /// Emit a single JSON line without going through tracing.
    pub fn emit_json(event: &impl Serialize, w: &mut impl Write) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(w, "{}", line);
        }
    }
}

fn fmt_layer<W>(json: bool, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NONE)
        .with_ansi(ansi)
        .with_writer(writer);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_channel_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("agent.log");
        let handle = StructuredLogger::build(&LogOptions {
            level: "info".into(),
            json: true,
            console: false,
            file: Some(path.clone()),
        });
        handle.scope(|| tracing::info!(marker = "abc123", "hello"));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("abc123"));
    }

    #[test]
    fn emit_json_is_one_line() {
        let mut out = Vec::new();
        StructuredLogger::emit_json(&serde_json::json!({"a": 1}), &mut out);
        assert_eq!(out, b"{\"a\":1}\n");
    }

    #[test]
    fn verbosity_maps_to_directives() {
        assert_eq!(verbosity_directive(Verbosity::Critical), "error");
        assert_eq!(verbosity_directive(Verbosity::Off), "off");
    }
}
