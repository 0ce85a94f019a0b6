//! Error types for versiondb
//!
//! Every crate in the workspace surfaces this one error type so that engine
//! errors bubble through the MVCC engine, the WAL, the receipt stores and the
//! composite router unchanged. Absence of data is never an error: lookups
//! return `Ok(None)`.

use std::io;
use thiserror::Error;

/// Result type alias for versiondb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the versioned storage engine
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from file operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error reported by the embedded LSM library
    #[error("engine error: {0}")]
    Engine(String),

    /// Serialization/deserialization error (msgpack, toml)
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Malformed key, value, record or file
    #[error("data corruption: {0}")]
    Corruption(String),

    /// Invalid configuration, detected at construction time
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Iterator bound was an empty key
    #[error("key must not be empty")]
    KeyEmpty,

    /// Iterator start bound sorts after its end bound
    #[error("start key must be less than or equal to end key")]
    StartAfterEnd,

    /// Negative version supplied
    #[error("invalid version: {0}")]
    InvalidVersion(i64),

    /// Block range query with `from > to`
    #[error("invalid block range: from {from} > to {to}")]
    InvalidBlockRange {
        /// First block requested
        from: u64,
        /// Last block requested
        to: u64,
    },

    /// Operation on a closed store or log
    #[error("{0} is closed")]
    Closed(&'static str),

    /// An earlier asynchronous WAL write failed; the failure is sticky
    #[error("WAL write failed: {0}")]
    WalWrite(String),

    /// Unrecoverable failure in a background pipeline; the process must stop
    #[error("fatal error in {component}: {message}")]
    Fatal {
        /// Background component that failed
        component: &'static str,
        /// Rendered cause
        message: String,
    },

    /// A test fault hook fired
    #[error("injected fault at {0}")]
    FaultInjected(&'static str),

    /// Backend name missing from the registry
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
}

impl Error {
    /// Build a fatal error for a background component.
    pub fn fatal(component: &'static str, cause: impl std::fmt::Display) -> Self {
        Error::Fatal {
            component,
            message: cause.to_string(),
        }
    }

    /// Whether this error means the process must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
