//! Structured logging: JSON or text lines, scoped per component.

mod format;

pub use format::{verbosity_directive, LogHandle, LogOptions, StructuredLogger};
