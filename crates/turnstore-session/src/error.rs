//! Errors raised by session and artifact stores.

use chrono::{DateTime, Utc};
use thiserror::Error;

use turnstore_core::SessionKey;

/// Errors that can occur during session, artifact, rewind and compaction operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionKey),

    #[error("Invocation '{invocation_id}' not found in session {key}")]
    InvocationNotFound {
        key: SessionKey,
        invocation_id: String,
    },

    #[error(
        "Stale session {key}: snapshot from {snapshot} is older than stored {stored}; refetch and retry"
    )]
    StaleSession {
        key: SessionKey,
        snapshot: DateTime<Utc>,
        stored: DateTime<Utc>,
    },

    #[error("Session already exists: {0}")]
    AlreadyExists(SessionKey),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage path error: {0}")]
    PathError(String),

    #[error("Rewind of {key} failed and was rolled back: {reason}")]
    RewindFailed { key: SessionKey, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the caller can recover by refetching the session and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::StaleSession { .. })
    }

    /// Missing session or missing rewind target.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::SessionNotFound(_) | StoreError::InvocationNotFound { .. }
        )
    }
}

impl From<turnstore_core::Error> for StoreError {
    fn from(err: turnstore_core::Error) -> Self {
        match err {
            turnstore_core::Error::Validation(msg) => StoreError::Validation(msg),
            turnstore_core::Error::Io(e) => StoreError::Io(e),
            turnstore_core::Error::Json(e) => StoreError::Serialization(e),
            other => StoreError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Reject a write whose snapshot is older than the stored session.
pub(crate) fn check_staleness(
    key: &SessionKey,
    snapshot: DateTime<Utc>,
    stored: DateTime<Utc>,
) -> Result<()> {
    if stored > snapshot {
        tracing::warn!(session = %key, %snapshot, %stored, "Rejecting stale append");
        return Err(StoreError::StaleSession {
            key: key.clone(),
            snapshot,
            stored,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use turnstore_core::clock;

    #[test]
    fn test_staleness_rejects_older_snapshot() {
        let key = SessionKey::new("app", "u", "s");
        let stored = clock::now();
        let err = check_staleness(&key, stored - Duration::seconds(1), stored).unwrap_err();
        assert!(err.is_retryable());
        assert!(check_staleness(&key, stored, stored).is_ok());
    }

    #[test]
    fn test_not_found_classification() {
        let key = SessionKey::new("app", "u", "s");
        assert!(StoreError::SessionNotFound(key.clone()).is_not_found());
        assert!(StoreError::InvocationNotFound {
            key,
            invocation_id: "x".into()
        }
        .is_not_found());
        assert!(!StoreError::Validation("x".into()).is_not_found());
    }

    #[test]
    fn test_core_validation_maps_to_validation() {
        let err: StoreError = turnstore_core::Error::validation("bad").into();
        assert!(matches!(err, StoreError::Validation(_)));
    }
}
