//! Engine-wide error types.
//!
//! Errors are recovered at the per-build boundary whenever possible: only
//! catalog-load and database-connectivity failures abort a whole batch.

use thiserror::Error;

/// Errors produced by the scan engine.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Transport failure, timeout, or non-2xx response from the CI provider.
    /// Transient: the affected build is skipped and retried next batch.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-2xx status, kept separate from transport errors so the status
    /// code and URL survive into the log record.
    #[error("HTTP {status} from {url}")]
    Http {
        status: reqwest::StatusCode,
        url: String,
    },

    /// Malformed upstream JSON. Transient: skip the build, log loudly.
    #[error("failed to decode upstream payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// The build had no scannable failure (timeout or no failed step) and no
    /// download URL could be derived. Terminal for that build.
    #[error("no log available for build {build_num}")]
    NoLogAvailable { build_num: i64 },

    /// Database failure. Connectivity loss aborts the batch; constraint
    /// conflicts indicate a concurrent writer and the work item is retried
    /// idempotently.
    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// A pattern expression failed to compile; the pattern is excluded from
    /// the batch.
    #[error("pattern {pattern_id} failed to compile: {source}")]
    PatternCompile {
        pattern_id: i64,
        source: regex::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias using the engine's [`ScanError`].
pub type Result<T> = std::result::Result<T, ScanError>;

impl ScanError {
    /// Whether the error should skip just the current build rather than
    /// abort the batch.
    pub fn is_per_build(&self) -> bool {
        matches!(
            self,
            ScanError::Network(_)
                | ScanError::Http { .. }
                | ScanError::Decode(_)
                | ScanError::NoLogAvailable { .. }
        )
    }
}
