// crates/lore-server/src/error.rs
// Standardized error types for Lore

use thiserror::Error;

/// Main error type for the Lore engine.
///
/// Error-kind conventions:
/// - not-found is *not* an error: single-row getters return `Option`, list
///   getters return an empty `Vec`
/// - unique-constraint hits on idempotent paths are swallowed by the store
///   functions themselves and never reach callers
/// - transient pool/IO failures surface unchanged; there is no silent retry
///   outside the explicit contention-retry wrappers in `db::pool`
#[derive(Error, Debug)]
pub enum LoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema failures at open are fatal: the engine refuses to serve.
    #[error("schema error: {0}")]
    Schema(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using LoreError
pub type Result<T> = std::result::Result<T, LoreError>;

impl From<String> for LoreError {
    fn from(s: String) -> Self {
        LoreError::Other(s)
    }
}

impl From<tokio::task::JoinError> for LoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            LoreError::Cancelled
        } else {
            LoreError::Other(err.to_string())
        }
    }
}

impl From<LoreError> for String {
    fn from(err: LoreError) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_mismatch_message() {
        let err = LoreError::DimensionMismatch {
            expected: 384,
            actual: 2000,
        };
        assert_eq!(
            err.to_string(),
            "vector dimension mismatch: expected 384, got 2000"
        );
    }

    #[test]
    fn string_conversion_roundtrip() {
        let err: LoreError = "something failed".to_string().into();
        let s: String = err.into();
        assert_eq!(s, "unknown error: something failed");
    }
}
