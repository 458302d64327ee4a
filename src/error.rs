use thiserror::Error;

use crate::types::SignalKind;

pub type Result<T> = std::result::Result<T, SignalError>;

#[derive(Debug, Error)]
pub enum SignalError {
    /// A telemetry session could not be loaded. Batch extraction skips it.
    #[error("session {year} {track} unavailable: {reason}")]
    SourceUnavailable {
        year: i32,
        track: String,
        reason: String,
    },

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("similarity index unavailable: {0}")]
    IndexUnavailable(String),

    /// Vector length does not match the signal's declared dimensionality.
    #[error("{kind} vector has {got} components, expected {expected}")]
    SchemaMismatch {
        kind: SignalKind,
        got: usize,
        expected: usize,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("advisory generation failed: {0}")]
    Advisory(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SignalError {
    /// True for failures of the external index, which the stream reports in-band.
    pub fn is_index_failure(&self) -> bool {
        matches!(self, SignalError::IndexUnavailable(_))
    }
}
