//! Error types for the audio pipeline.
//!
//! Only [`PipelineError::Invariant`] is escalated to the session owner. The
//! other kinds are handled where they happen and the pipeline keeps running,
//! substituting silence where data is missing.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Unsupported format pair or bad stage setup. Disables one direction.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Device or file could not be opened. Recoverable by falling back to the
    /// default device.
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// A deadline elapsed. Callers treat this as "no data yet".
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A programming defect, e.g. endless resampler reinitialization or a
    /// reader-id collision.
    #[error("Runtime invariant violated: {0}")]
    Invariant(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether this error must tear down the stream it happened in.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Invariant(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
