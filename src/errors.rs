//! Error kinds for search, caching and elaboration
//!
//! Only `QuerySyntax`, `BudgetExceeded` and the elaboration variants are ever
//! surfaced as an operation's own failure. Store-class errors are caught by the
//! coordinator and downgraded to a cache miss or a skipped write; per-file scan
//! errors are logged and the file is skipped.

use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pattern is empty or does not compile. Raised before any file or cache access.
    #[error("Invalid search pattern \"{pattern}\": {reason}")]
    QuerySyntax {
        pattern: String,
        reason: String,
    },

    /// A single file could not be read. The scan continues without it.
    #[error("Failed to read {}: {source}", path.display())]
    ScanIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The cache directory or database cannot be used.
    #[error("Cache store unavailable at {}: {reason}", path.display())]
    StoreUnavailable {
        path: PathBuf,
        reason: String,
    },

    /// Another process held the store's write lock for longer than the configured wait.
    #[error("Timed out after {}ms waiting for the cache lock", waited.as_millis())]
    LockTimeout {
        waited: Duration,
    },

    /// The scan ran past its match-time budget.
    #[error("Search exceeded its time budget ({elapsed_ms}ms > {budget_ms}ms). Narrow the paths or raise search.budget_secs.")]
    BudgetExceeded {
        elapsed_ms: u64,
        budget_ms: u64,
    },

    /// The elaboration collaborator failed (provider, auth or network error, or an empty reply).
    #[error("Elaboration failed for {target}: {source}")]
    Elaboration {
        target: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Elaboration for {target} timed out after {}s", after.as_secs())]
    ElaborationTimeout {
        target: String,
        after: Duration,
    },

    #[error("Cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Cache payload encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn query_syntax(pattern: &str, reason: impl Into<String>) -> Self {
        Error::QuerySyntax {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_query_syntax(&self) -> bool {
        matches!(self, Error::QuerySyntax { .. })
    }

    /// True for failures of the cache itself, which callers degrade on instead of reporting.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable { .. }
                | Error::LockTimeout { .. }
                | Error::Sqlite(_)
                | Error::Codec(_)
                | Error::Io(_)
        )
    }

    pub fn is_elaboration_failure(&self) -> bool {
        matches!(self, Error::Elaboration { .. } | Error::ElaborationTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_syntax_classification() {
        let err = Error::query_syntax("(", "unclosed group");
        assert!(err.is_query_syntax());
        assert!(!err.is_store_failure());
        assert!(err.to_string().contains("unclosed group"));
    }

    #[test]
    fn test_store_failures_degrade() {
        let err = Error::LockTimeout { waited: Duration::from_millis(250) };
        assert!(err.is_store_failure());
        assert!(err.to_string().contains("250ms"));

        let err = Error::StoreUnavailable {
            path: PathBuf::from("/nope"),
            reason: "read-only file system".into(),
        };
        assert!(err.is_store_failure());
    }

    #[test]
    fn test_elaboration_failure_keeps_source() {
        let source: Box<dyn std::error::Error + Send + Sync> = "401 Unauthorized".into();
        let err = Error::Elaboration { target: "src/lib.rs:12".into(), source };
        assert!(err.is_elaboration_failure());
        assert!(!err.is_store_failure());
        assert!(std::error::Error::source(&err).is_some());
    }
}
