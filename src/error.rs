//! Error types and handling for the index engine
//!
//! This module provides structured error handling across the engine with
//! proper error chaining, context, and categorization.

use std::any::Any;

use thiserror::Error;

/// The main Result type used throughout the engine
pub type Result<T> = std::result::Result<T, Error>;

/// ErrorKind with the specific error categories
#[derive(Error, Debug, Clone)]
pub enum ErrorKind {
    /// User-defined function errors (projection or reduction code)
    #[error("User Defined error: {0}")]
    UserDefinedError(String),

    /// Internal engine errors
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),
}

/// Error enum categorized by the stage or surface that raised it
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Registration-time index definition failures. Fatal to that index
    /// definition, it never starts building.
    #[error("Definition - {0}")]
    DefinitionError(ErrorKind),

    /// Per-document map stage failures. Contained, never surfaced to the
    /// caller of a change-event batch.
    #[error("Map - {0}")]
    MapError(ErrorKind),

    /// Per-key reduce stage failures. Contained, the previous reduced
    /// tuple is retained.
    #[error("Reduce - {0}")]
    ReduceError(ErrorKind),

    /// Caller-facing timeout on bounded staleness waits.
    #[error("Timeout - {0}")]
    TimeoutError(ErrorKind),

    /// Connection string / configuration failures.
    #[error("Config - {0}")]
    ConfigError(ErrorKind),

    /// Engine orchestration failures (unknown index, closed channels).
    #[error("Engine - {0}")]
    EngineError(ErrorKind),
}

/// Extract a readable message from a caught panic payload. Mirrors what
/// a panic hook sees: `&str` and `String` payloads, anything else is
/// opaque.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
