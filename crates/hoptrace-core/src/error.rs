//! Error types for probing runs.

use thiserror::Error;

/// Main error type for probing operations.
#[derive(Error, Debug)]
pub enum TraceError {
    // Configuration errors
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Probe tool not found: {0}")]
    BinaryNotFound(String),

    #[error("Invalid run options: {0}")]
    InvalidOptions(String),

    // Process errors
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Probe process for TTL {ttl} did not finish in time")]
    ProcessTimeout { ttl: u8 },

    #[error("Probe tool exited ({status}) without reporting any hop: {message}")]
    ToolExited { status: String, message: String },

    #[error("Read timeout exceeded")]
    ReadTimeout,

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    // DNS errors
    #[error("Failed to resolve hostname {hostname}: {source}")]
    DnsResolutionFailed {
        hostname: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TraceError {
    /// Returns true for errors that prevent a run from starting at all.
    ///
    /// These are surfaced before any probe is issued; everything else happens
    /// mid-run and is either degraded into a timed-out hop or reported with the
    /// hops discovered so far.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedPlatform(_) | Self::BinaryNotFound(_) | Self::InvalidOptions(_)
        )
    }
}

impl From<std::io::Error> for TraceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TraceError::ReadTimeout,
            std::io::ErrorKind::WouldBlock => TraceError::ReadTimeout,
            _ => TraceError::Io(err),
        }
    }
}

impl From<regex::Error> for TraceError {
    fn from(err: regex::Error) -> Self {
        TraceError::Internal(format!("invalid output pattern: {}", err))
    }
}

/// Result type alias for probing operations.
pub type TraceResult<T> = Result<T, TraceError>;
