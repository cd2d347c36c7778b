//! Error kinds for the agent. Helper-level failures are absorbed before they
//! reach these types; what is left is what a caller has to act on.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::Reconciled;

/// Fatal reconciliation outcomes. Missing or undecodable persisted state is
/// not an error (it selects the bootstrap path) and never shows up here.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no usable working directory (tried {tried:?})")]
    NoWorkingDirectory { tried: Vec<PathBuf> },

    #[error("could not generate configuration file in {dir}: {source}")]
    ConfigFileUnavailable {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The reconciled record could not be written back. `partial` holds the
    /// in-memory result for interactive invocations only.
    #[error("could not persist runtime configuration: {source}")]
    PersistFailed {
        #[source]
        source: StoreError,
        partial: Option<Box<Reconciled>>,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("record declares {declared} {section} entries, schema needs {required}")]
    MissingFields {
        section: &'static str,
        declared: u32,
        required: u32,
    },

    #[error("slot {slot} points outside the buffer ({offset}+{len} > {size})")]
    OutOfBounds {
        slot: &'static str,
        offset: u32,
        len: u32,
        size: usize,
    },

    #[error("slot {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("slot {slot} has malformed length {len}")]
    BadLength { slot: &'static str, len: u32 },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encryption failed")]
    Encryption,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failure to read one named property out of a raw record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("property {0} is not part of the event schema")]
    UnknownProperty(String),

    #[error("property {name} has type {actual}, requested {requested}")]
    TypeMismatch {
        name: String,
        actual: &'static str,
        requested: &'static str,
    },

    #[error("property {name} runs past the end of user data")]
    Truncated { name: String },

    #[error("property {name} is not a valid {encoding} string")]
    BadString {
        name: String,
        encoding: &'static str,
    },
}

/// Record-level failures raised inside the capture callback. These are logged
/// at the callback boundary and never leave the consumer thread.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no schema registered for {provider} event {event_id}")]
    NoSchema { provider: String, event_id: u16 },

    #[error("provider {0} is already subscribed")]
    AlreadySubscribed(String),

    #[error("trace session {0} is closed")]
    SessionClosed(String),

    #[error("record handling panicked: {0}")]
    Panicked(String),

    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty value")]
    Empty,

    #[error("unrecognized hash algorithm {0:?}")]
    UnknownHashAlgorithm(String),

    #[error("configuration file {0} does not exist or is not a regular file")]
    ConfigFileMissing(PathBuf),
}
