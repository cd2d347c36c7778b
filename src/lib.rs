//! TraceKeep agent: host security telemetry with a persistent, encrypted
//! runtime configuration.
//!
//! Modular structure:
//! - [`config`]: Agent settings, runtime configuration reconciliation, record codec
//! - [`collectors`]: Trace sessions, schema parsing, event normalization
//! - [`storage`]: Encrypted blob storage
//! - [`logging`]: Structured logging handles
//! - [`error`]: Error kinds

pub mod config;
pub mod collectors;
pub mod error;
pub mod storage;
pub mod logging;

pub use config::{AgentSettings, CliOverrides, EffectiveConfig, Reconciler};
pub use collectors::{EventCollector, Normalizer, SecurityEvent, TraceSession};
pub use storage::{BlobStore, SqliteBlobStore};
pub use logging::StructuredLogger;
