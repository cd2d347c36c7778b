//! Operator-input validation: hash algorithms, report channels, logging modes,
//! verbosity and process-filter lists.
//!
//! Hash-algorithm lists are all-or-nothing: one unknown token rejects the
//! whole list. Channel and logging-mode lists drop unknown tokens and keep the
//! rest. The two policies are intentionally kept apart.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Imphash,
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Imphash => "imphash",
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        [
            HashAlgorithm::Imphash,
            HashAlgorithm::Md5,
            HashAlgorithm::Sha1,
            HashAlgorithm::Sha256,
        ]
        .into_iter()
        .find(|a| a.as_str().eq_ignore_ascii_case(token))
    }
}

/// Selected hash algorithms. `All` is the `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashSelection {
    All,
    Set(Vec<HashAlgorithm>),
}

impl Default for HashSelection {
    fn default() -> Self {
        HashSelection::Set(vec![HashAlgorithm::Sha1])
    }
}

impl HashSelection {
    /// Parse a `|`-delimited list, case-insensitively. `*` anywhere selects
    /// every algorithm and the remaining tokens are ignored, but they still
    /// have to be valid.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut wildcard = false;
        let mut algorithms = Vec::new();
        for token in input.split('|').map(str::trim) {
            if token == "*" {
                wildcard = true;
                continue;
            }
            let algorithm = HashAlgorithm::from_token(token)
                .ok_or_else(|| ValidationError::UnknownHashAlgorithm(token.to_string()))?;
            if !algorithms.contains(&algorithm) {
                algorithms.push(algorithm);
            }
        }

        if wildcard {
            Ok(HashSelection::All)
        } else {
            Ok(HashSelection::Set(algorithms))
        }
    }

    /// Parse, falling back to the default (`sha1`) when the input is empty or
    /// invalid.
    pub fn parse_or_default(input: &str) -> Self {
        match Self::parse(input) {
            Ok(selection) => selection,
            Err(e) => {
                warn!(input, error = %e, "invalid hash algorithm selection, defaulting to sha1");
                Self::default()
            }
        }
    }

    pub fn contains(&self, algorithm: HashAlgorithm) -> bool {
        match self {
            HashSelection::All => true,
            HashSelection::Set(set) => set.contains(&algorithm),
        }
    }
}

impl fmt::Display for HashSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashSelection::All => f.write_str("*"),
            HashSelection::Set(set) => {
                let joined: Vec<&str> = set.iter().map(|a| a.as_str()).collect();
                f.write_str(&joined.join("|"))
            }
        }
    }
}

/// Where collected security events are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportChannel {
    EventLog,
    DebugEvents,
    Etw,
    File,
}

impl ReportChannel {
    pub fn code(self) -> u32 {
        match self {
            ReportChannel::EventLog => 1,
            ReportChannel::DebugEvents => 2,
            ReportChannel::Etw => 3,
            ReportChannel::File => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ReportChannel::EventLog),
            2 => Some(ReportChannel::DebugEvents),
            3 => Some(ReportChannel::Etw),
            4 => Some(ReportChannel::File),
            _ => None,
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "debugevents" => Some(ReportChannel::DebugEvents),
            "etw" => Some(ReportChannel::Etw),
            "eventlog" => Some(ReportChannel::EventLog),
            "file" => Some(ReportChannel::File),
            _ => None,
        }
    }
}

/// Where the agent's own log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMode {
    Console,
    File,
}

impl LoggingMode {
    pub fn code(self) -> u32 {
        match self {
            LoggingMode::Console => 1,
            LoggingMode::File => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(LoggingMode::Console),
            2 => Some(LoggingMode::File),
            _ => None,
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "console" => Some(LoggingMode::Console),
            "file" => Some(LoggingMode::File),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Off,
}

impl Verbosity {
    pub fn code(self) -> u32 {
        match self {
            Verbosity::Trace => 0,
            Verbosity::Debug => 1,
            Verbosity::Info => 2,
            Verbosity::Warn => 3,
            Verbosity::Error => 4,
            Verbosity::Critical => 5,
            Verbosity::Off => 6,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Verbosity::Trace),
            1 => Some(Verbosity::Debug),
            2 => Some(Verbosity::Info),
            3 => Some(Verbosity::Warn),
            4 => Some(Verbosity::Error),
            5 => Some(Verbosity::Critical),
            6 => Some(Verbosity::Off),
            _ => None,
        }
    }

    /// Empty input means `trace`; an unknown word falls back to `info`.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.is_empty() {
            return Verbosity::Trace;
        }
        match input.to_ascii_lowercase().as_str() {
            "critical" => Verbosity::Critical,
            "debug" => Verbosity::Debug,
            "error" | "err" => Verbosity::Error,
            "info" => Verbosity::Info,
            "off" => Verbosity::Off,
            "trace" => Verbosity::Trace,
            "warning" | "warn" => Verbosity::Warn,
            other => {
                warn!(verbosity = other, "unknown verbosity, defaulting to info");
                Verbosity::Info
            }
        }
    }
}

/// Comma-separated report channels; unknown tokens are dropped.
pub fn parse_report_channels(input: &str) -> Vec<ReportChannel> {
    parse_dropping_unknown(input, "report channel", ReportChannel::from_token)
}

/// Comma-separated logging modes; unknown tokens are dropped.
pub fn parse_logging_modes(input: &str) -> Vec<LoggingMode> {
    parse_dropping_unknown(input, "logging mode", LoggingMode::from_token)
}

fn parse_dropping_unknown<T: PartialEq>(
    input: &str,
    kind: &'static str,
    from_token: impl Fn(&str) -> Option<T>,
) -> Vec<T> {
    let mut out = Vec::new();
    for token in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match from_token(token) {
            Some(value) if !out.contains(&value) => out.push(value),
            Some(_) => {}
            None => warn!(kind, token, "unsupported value dropped"),
        }
    }
    out
}

/// Comma-separated process names, trimmed, empties dropped.
pub fn parse_process_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// A supplied configuration file must be an existing regular file. Returns
/// its canonical path.
pub fn validate_config_file(path: &Path) -> Result<PathBuf, ValidationError> {
    if path.as_os_str().is_empty() {
        return Err(ValidationError::Empty);
    }
    match std::fs::canonicalize(path) {
        Ok(full) if full.is_file() => Ok(full),
        _ => Err(ValidationError::ConfigFileMissing(path.to_path_buf())),
    }
}
