//! Versioned artifact storage.
//!
//! Each filename has an append-only chain of versions numbered from 0. A save
//! never overwrites; it adds the next version. Filenames prefixed `user:` live
//! at user scope and are shared by all sessions of that user.

mod memory;
mod sqlite;

pub use memory::InMemoryArtifactStore;
pub use sqlite::SqliteArtifactStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use turnstore_core::state::USER_PREFIX;
use turnstore_core::SessionKey;

use crate::error::{Result, StoreError};

/// Where an artifact lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactScope {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl ArtifactScope {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn from_key(key: &SessionKey) -> Self {
        Self::new(&key.app_name, &key.user_id, &key.session_id)
    }

    /// Session component used to store `filename`: empty for user-scoped files.
    pub(crate) fn session_for(&self, filename: &str) -> &str {
        if is_user_scoped(filename) {
            ""
        } else {
            &self.session_id
        }
    }
}

/// Whether `filename` is stored at user scope rather than session scope.
pub fn is_user_scoped(filename: &str) -> bool {
    filename.starts_with(USER_PREFIX)
}

/// One stored artifact version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Artifact {
    pub fn new(mime_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// A `text/plain` artifact.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new("text/plain", text.into().into_bytes())
    }

    /// The data as UTF-8, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Artifact storage trait for abstraction over storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Append a new version of `filename` and return its number.
    async fn save_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        artifact: Artifact,
    ) -> Result<u32>;

    /// Load a specific version, or the latest when `version` is `None`.
    async fn load_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        version: Option<u32>,
    ) -> Result<Option<Artifact>>;

    /// Filenames visible to a session, user-scoped ones included, sorted.
    async fn list_artifact_keys(&self, scope: &ArtifactScope) -> Result<Vec<String>>;

    /// Stored versions of `filename` in ascending order.
    async fn list_versions(&self, scope: &ArtifactScope, filename: &str) -> Result<Vec<u32>>;

    /// Delete every version of `filename`.
    async fn delete_artifact(&self, scope: &ArtifactScope, filename: &str) -> Result<()>;

    /// Delete versions greater than `keep_up_to`, or all versions when `None`.
    ///
    /// Returns the removed versions in ascending order so that a caller can
    /// restore them by saving them again.
    async fn truncate_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        keep_up_to: Option<u32>,
    ) -> Result<Vec<(u32, Artifact)>>;

    /// Delete all session-scoped artifacts of a session. User-scoped files stay.
    async fn delete_session_artifacts(&self, scope: &ArtifactScope) -> Result<()>;
}

pub(crate) fn validate_filename(filename: &str) -> Result<()> {
    if filename.trim().is_empty() {
        return Err(StoreError::Validation("artifact filename is empty".into()));
    }
    if is_user_scoped(filename) && filename.len() == USER_PREFIX.len() {
        return Err(StoreError::Validation(format!(
            "artifact filename has nothing after prefix '{}'",
            USER_PREFIX
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_scoped_files_drop_session() {
        let scope = ArtifactScope::new("app", "u", "s1");
        assert_eq!(scope.session_for("notes.md"), "s1");
        assert_eq!(scope.session_for("user:profile.json"), "");
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("report.txt").is_ok());
        assert!(validate_filename("  ").is_err());
        assert!(validate_filename("user:").is_err());
    }

    #[test]
    fn test_text_artifact() {
        let artifact = Artifact::text("hello");
        assert_eq!(artifact.mime_type, "text/plain");
        assert_eq!(artifact.as_text(), Some("hello"));
        assert_eq!(Artifact::new("application/octet-stream", vec![0xff]).as_text(), None);
    }
}
