//! SQLite-backed artifact storage.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

use turnstore_core::clock;

use super::{validate_filename, Artifact, ArtifactScope, ArtifactStore};
use crate::db::Database;
use crate::error::Result;

/// Artifact store over the `artifacts` table of a [`Database`].
#[derive(Clone)]
pub struct SqliteArtifactStore {
    db: Database,
}

impl SqliteArtifactStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ArtifactStore for SqliteArtifactStore {
    async fn save_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        artifact: Artifact,
    ) -> Result<u32> {
        validate_filename(filename)?;
        let session_id = scope.session_for(filename);

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let version: u32 = tx.query_row(
            r#"
            SELECT COALESCE(MAX(version) + 1, 0) FROM artifacts
            WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 AND filename = ?4
            "#,
            params![scope.app_name, scope.user_id, session_id, filename],
            |row| row.get(0),
        )?;

        tx.execute(
            r#"
            INSERT INTO artifacts (app_name, user_id, session_id, filename, version, mime_type, data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                scope.app_name,
                scope.user_id,
                session_id,
                filename,
                version,
                artifact.mime_type,
                artifact.data,
                clock::now().timestamp_micros(),
            ],
        )?;
        tx.commit()?;

        tracing::debug!(filename, version, session = %scope.session_id, "Saved artifact");
        Ok(version)
    }

    async fn load_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        version: Option<u32>,
    ) -> Result<Option<Artifact>> {
        let conn = self.db.lock();
        let session_id = scope.session_for(filename);
        let read = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Artifact> {
            Ok(Artifact {
                mime_type: row.get(0)?,
                data: row.get(1)?,
            })
        };

        let artifact = match version {
            Some(v) => conn
                .query_row(
                    r#"
                    SELECT mime_type, data FROM artifacts
                    WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 AND filename = ?4 AND version = ?5
                    "#,
                    params![scope.app_name, scope.user_id, session_id, filename, v],
                    read,
                )
                .optional()?,
            None => conn
                .query_row(
                    r#"
                    SELECT mime_type, data FROM artifacts
                    WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 AND filename = ?4
                    ORDER BY version DESC LIMIT 1
                    "#,
                    params![scope.app_name, scope.user_id, session_id, filename],
                    read,
                )
                .optional()?,
        };
        Ok(artifact)
    }

    async fn list_artifact_keys(&self, scope: &ArtifactScope) -> Result<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT filename FROM artifacts
            WHERE app_name = ?1 AND user_id = ?2 AND (session_id = ?3 OR session_id = '')
            ORDER BY filename
            "#,
        )?;
        let keys = stmt
            .query_map(params![scope.app_name, scope.user_id, scope.session_id], |row| {
                row.get(0)
            })?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    async fn list_versions(&self, scope: &ArtifactScope, filename: &str) -> Result<Vec<u32>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT version FROM artifacts
            WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 AND filename = ?4
            ORDER BY version
            "#,
        )?;
        let versions = stmt
            .query_map(
                params![scope.app_name, scope.user_id, scope.session_for(filename), filename],
                |row| row.get(0),
            )?
            .collect::<std::result::Result<Vec<u32>, _>>()?;
        Ok(versions)
    }

    async fn delete_artifact(&self, scope: &ArtifactScope, filename: &str) -> Result<()> {
        self.truncate_artifact(scope, filename, None).await.map(|_| ())
    }

    async fn truncate_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        keep_up_to: Option<u32>,
    ) -> Result<Vec<(u32, Artifact)>> {
        let session_id = scope.session_for(filename);
        // -1 keeps nothing
        let floor = keep_up_to.map(i64::from).unwrap_or(-1);

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let removed = {
            let mut stmt = tx.prepare(
                r#"
                SELECT version, mime_type, data FROM artifacts
                WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 AND filename = ?4 AND version > ?5
                ORDER BY version
                "#,
            )?;
            let rows = stmt.query_map(
                params![scope.app_name, scope.user_id, session_id, filename, floor],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        Artifact {
                            mime_type: row.get(1)?,
                            data: row.get(2)?,
                        },
                    ))
                },
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        tx.execute(
            r#"
            DELETE FROM artifacts
            WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3 AND filename = ?4 AND version > ?5
            "#,
            params![scope.app_name, scope.user_id, session_id, filename, floor],
        )?;
        tx.commit()?;

        if !removed.is_empty() {
            tracing::debug!(filename, removed = removed.len(), "Truncated artifact");
        }
        Ok(removed)
    }

    async fn delete_session_artifacts(&self, scope: &ArtifactScope) -> Result<()> {
        // An empty session id would match the user-scoped rows
        if scope.session_id.is_empty() {
            return Ok(());
        }
        let conn = self.db.lock();
        conn.execute(
            "DELETE FROM artifacts WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
            params![scope.app_name, scope.user_id, scope.session_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (SqliteArtifactStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path()).unwrap();
        (SqliteArtifactStore::new(db), temp_dir)
    }

    fn scope(session: &str) -> ArtifactScope {
        ArtifactScope::new("app", "u", session)
    }

    #[tokio::test]
    async fn test_save_and_load_versions() {
        let (store, _tmp) = create_test_store();

        assert_eq!(
            store.save_artifact(&scope("s"), "f", Artifact::text("a")).await.unwrap(),
            0
        );
        assert_eq!(
            store.save_artifact(&scope("s"), "f", Artifact::text("b")).await.unwrap(),
            1
        );

        let latest = store.load_artifact(&scope("s"), "f", None).await.unwrap().unwrap();
        assert_eq!(latest.as_text(), Some("b"));
        let first = store.load_artifact(&scope("s"), "f", Some(0)).await.unwrap().unwrap();
        assert_eq!(first.as_text(), Some("a"));
        assert!(store.load_artifact(&scope("s"), "missing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncate_and_list() {
        let (store, _tmp) = create_test_store();
        for i in 0..3 {
            store
                .save_artifact(&scope("s"), "f", Artifact::text(format!("v{}", i)))
                .await
                .unwrap();
        }
        store
            .save_artifact(&scope("s"), "user:shared", Artifact::text("x"))
            .await
            .unwrap();

        let removed = store.truncate_artifact(&scope("s"), "f", Some(0)).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].0, 1);
        assert_eq!(removed[1].1.as_text(), Some("v2"));
        assert_eq!(store.list_versions(&scope("s"), "f").await.unwrap(), vec![0]);

        assert_eq!(
            store.list_artifact_keys(&scope("other")).await.unwrap(),
            vec!["user:shared".to_string()]
        );
        assert_eq!(
            store.list_artifact_keys(&scope("s")).await.unwrap(),
            vec!["f".to_string(), "user:shared".to_string()]
        );
    }

    #[tokio::test]
    async fn test_binary_roundtrip() {
        let (store, _tmp) = create_test_store();
        let data = vec![0u8, 159, 146, 150];
        store
            .save_artifact(
                &scope("s"),
                "blob.bin",
                Artifact::new("application/octet-stream", data.clone()),
            )
            .await
            .unwrap();
        let loaded = store.load_artifact(&scope("s"), "blob.bin", None).await.unwrap().unwrap();
        assert_eq!(loaded.data, data);
        assert_eq!(loaded.mime_type, "application/octet-stream");
    }
}
