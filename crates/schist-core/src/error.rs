use thiserror::Error;

/// Listing locks are not tied to a single key; errors about them use this
/// marker in place of a key name.
pub const LISTING_LOCK_KEY: &str = "<listing>";

#[derive(Debug, Error)]
pub enum SchistError {
    /// Lock acquisition failed due to contention. Negotiation is
    /// fail-fast: the attempt is never queued or retried here.
    #[error("lock denied for key '{key}'")]
    LockDenied { key: String },

    /// An operation was issued against a committed or aborted transaction.
    #[error("transaction has already been committed or aborted")]
    TransactionExpired,

    /// The master index blob exists but cannot be used.
    #[error("master index '{key}' is corrupt: {reason}")]
    MasterCorrupt { key: String, reason: String },

    /// A packed-store operation needed the master index before it was
    /// loaded. Auto-loading makes this unreachable in normal use.
    #[error("packed store master index is not loaded")]
    NotLoaded,

    /// A direct URL was requested for a logical key that shares a
    /// physical container with other entries.
    #[error("no direct url for packed key '{key}'")]
    UrlUnavailable { key: String },

    /// Encoding a persisted structure (master index, container body)
    /// failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Passthrough from the underlying backend.
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SchistError>;

impl SchistError {
    /// Lock denial for a named key.
    pub fn denied(key: impl Into<String>) -> Self {
        SchistError::LockDenied { key: key.into() }
    }

    /// Lock denial for the listing locks.
    pub fn listing_denied() -> Self {
        SchistError::LockDenied {
            key: LISTING_LOCK_KEY.to_string(),
        }
    }

    /// True for contention failures, which callers may choose to retry
    /// by re-running the whole transaction.
    pub fn is_contention(&self) -> bool {
        matches!(self, SchistError::LockDenied { .. })
    }
}
