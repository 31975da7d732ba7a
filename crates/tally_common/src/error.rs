//! Error taxonomy for the accounting engine.
//!
//! Every category except `Configuration` is recovered locally by the caller:
//! a missing source yields an empty read, a malformed row is skipped, a failed
//! write is retried on the next scheduled tick. Configuration problems corrupt
//! every later day-boundary decision, so they are surfaced to the operator.

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, TallyError>;

/// Accounting errors
#[derive(Debug, thiserror::Error)]
pub enum TallyError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TallyError {
    /// True when the error must reach the operator instead of being absorbed
    pub fn is_fatal(&self) -> bool {
        matches!(self, TallyError::Configuration(_))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        TallyError::Configuration(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        TallyError::Parse(msg.into())
    }
}
