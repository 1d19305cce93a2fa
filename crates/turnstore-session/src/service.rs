//! The session service: the entry point used by orchestration code.
//!
//! The service owns a session store, an artifact store and an optional
//! compactor. Writes to one session (appends, rewinds, artifact saves) are
//! serialized through a per-session lock; different sessions run in parallel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use turnstore_core::{
    Config, Event, GetSessionConfig, Session, SessionKey, SessionSummary, StateMap,
};

use crate::artifact::{
    Artifact, ArtifactScope, ArtifactStore, InMemoryArtifactStore, SqliteArtifactStore,
};
use crate::compaction::{CompactionConfig, Compactor, Summarizer, TranscriptSummarizer};
use crate::db::Database;
use crate::error::{Result, StoreError};
use crate::integrity::{validate_artifacts, validate_session, ValidationResult};
use crate::rewind::RewindEngine;
use crate::store::{InMemorySessionStore, SessionStore, SqliteSessionStore};

/// One async mutex per session key.
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<SessionKey, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, key: &SessionKey) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().entry(key.clone()).or_default().clone();
        lock.lock_owned().await
    }

    fn forget(&self, key: &SessionKey) {
        self.locks.lock().remove(key);
    }
}

/// Session, event, artifact, rewind and compaction operations.
#[derive(Clone)]
pub struct SessionService {
    sessions: Arc<dyn SessionStore>,
    artifacts: Arc<dyn ArtifactStore>,
    compactor: Option<Arc<Compactor>>,
    locks: Arc<SessionLocks>,
}

impl SessionService {
    pub fn new(sessions: Arc<dyn SessionStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            sessions,
            artifacts,
            compactor: None,
            locks: Arc::new(SessionLocks::default()),
        }
    }

    /// A service that keeps everything in process memory.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryArtifactStore::new()),
        )
    }

    /// A service over `sessions.db` in `base_dir`.
    pub fn open_sqlite(base_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_database(Database::open(base_dir)?))
    }

    fn from_database(db: Database) -> Self {
        Self::new(
            Arc::new(SqliteSessionStore::from_database(db.clone())),
            Arc::new(SqliteArtifactStore::new(db)),
        )
    }

    /// Build a service from configuration.
    ///
    /// When compaction is enabled and no summarizer is given, the transcript
    /// summarizer is used.
    pub fn from_config(config: &Config, summarizer: Option<Arc<dyn Summarizer>>) -> Result<Self> {
        let service = match config.storage.backend.as_str() {
            "memory" => Self::in_memory(),
            "sqlite" => Self::from_database(Database::open_from_config(config)?),
            other => {
                return Err(StoreError::Validation(format!(
                    "unknown storage backend '{}'",
                    other
                )))
            }
        };

        if !config.compaction.enabled {
            return Ok(service);
        }
        let summarizer = summarizer.unwrap_or_else(|| {
            Arc::new(TranscriptSummarizer::new(config.summarizer.max_summary_chars))
        });
        Ok(service.with_compactor(Compactor::new(
            CompactionConfig::from(&config.compaction),
            summarizer,
        )))
    }

    /// Enable compaction after turn-complete appends.
    pub fn with_compactor(mut self, compactor: Compactor) -> Self {
        self.compactor = Some(Arc::new(compactor));
        self
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Operations bound to one application.
    pub fn app(&self, app_name: impl Into<String>) -> AppSessions<'_> {
        AppSessions {
            service: self,
            app_name: app_name.into(),
        }
    }

    pub async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<StateMap>,
        session_id: Option<String>,
    ) -> Result<Session> {
        self.sessions
            .create_session(app_name, user_id, state, session_id)
            .await
    }

    pub async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        config: &GetSessionConfig,
    ) -> Result<Option<Session>> {
        self.sessions
            .get_session(&SessionKey::new(app_name, user_id, session_id), config)
            .await
    }

    pub async fn list_sessions(
        &self,
        app_name: &str,
        user_id: &str,
    ) -> Result<Vec<SessionSummary>> {
        self.sessions.list_sessions(app_name, user_id).await
    }

    /// Delete a session with its events and session-scoped artifacts.
    pub async fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<()> {
        let key = SessionKey::new(app_name, user_id, session_id);
        {
            let _guard = self.locks.acquire(&key).await;
            self.sessions.delete_session(&key).await?;
            self.artifacts
                .delete_session_artifacts(&ArtifactScope::from_key(&key))
                .await?;
        }
        self.locks.forget(&key);
        Ok(())
    }

    /// Append an event to a session.
    ///
    /// After a turn-complete event the session is compacted if due. Compaction
    /// problems are logged and never fail the append.
    pub async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event> {
        if event.partial {
            return self.sessions.append_event(session, event).await;
        }

        let key = session.key();
        let _guard = self.locks.acquire(&key).await;
        let event = self.sessions.append_event(session, event).await?;

        if event.turn_complete {
            if let Some(compactor) = &self.compactor {
                if let Err(e) = compactor.maybe_compact(self.sessions.as_ref(), session).await {
                    tracing::warn!(session = %key, error = %e, "Compaction failed");
                }
            }
        }

        Ok(event)
    }

    /// Run compaction on a session now, regardless of the last event.
    pub async fn compact_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<Event>> {
        let Some(compactor) = &self.compactor else {
            tracing::debug!("Compaction is not configured");
            return Ok(None);
        };

        let key = SessionKey::new(app_name, user_id, session_id);
        let _guard = self.locks.acquire(&key).await;
        let mut session = self
            .sessions
            .get_session(&key, &GetSessionConfig::new().with_recent_events(0))
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(key.clone()))?;
        compactor.maybe_compact(self.sessions.as_ref(), &mut session).await
    }

    /// Revert a session to right before `before_invocation_id`.
    pub async fn rewind(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        before_invocation_id: &str,
    ) -> Result<Session> {
        let key = SessionKey::new(app_name, user_id, session_id);
        let _guard = self.locks.acquire(&key).await;
        RewindEngine::new(self.sessions.clone(), self.artifacts.clone())
            .rewind(&key, before_invocation_id)
            .await
    }

    pub async fn save_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        artifact: Artifact,
    ) -> Result<u32> {
        let key = SessionKey::new(&scope.app_name, &scope.user_id, &scope.session_id);
        let _guard = self.locks.acquire(&key).await;
        self.artifacts.save_artifact(scope, filename, artifact).await
    }

    pub async fn load_artifact(
        &self,
        scope: &ArtifactScope,
        filename: &str,
        version: Option<u32>,
    ) -> Result<Option<Artifact>> {
        self.artifacts.load_artifact(scope, filename, version).await
    }

    pub async fn list_artifact_keys(&self, scope: &ArtifactScope) -> Result<Vec<String>> {
        self.artifacts.list_artifact_keys(scope).await
    }

    pub async fn list_artifact_versions(
        &self,
        scope: &ArtifactScope,
        filename: &str,
    ) -> Result<Vec<u32>> {
        self.artifacts.list_versions(scope, filename).await
    }

    pub async fn delete_artifact(&self, scope: &ArtifactScope, filename: &str) -> Result<()> {
        let key = SessionKey::new(&scope.app_name, &scope.user_id, &scope.session_id);
        let _guard = self.locks.acquire(&key).await;
        self.artifacts.delete_artifact(scope, filename).await
    }

    /// Integrity check of a stored session and its artifacts.
    pub async fn check_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<ValidationResult> {
        let key = SessionKey::new(app_name, user_id, session_id);
        let session = self
            .sessions
            .get_session(&key, &GetSessionConfig::default())
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(key))?;

        let mut result = validate_session(&session);
        let artifacts = validate_artifacts(self.artifacts.as_ref(), &session).await?;
        result.is_valid &= artifacts.is_valid;
        result.issues.extend(artifacts.issues);
        Ok(result)
    }
}

/// Session operations for one application.
pub struct AppSessions<'a> {
    service: &'a SessionService,
    app_name: String,
}

impl AppSessions<'_> {
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub async fn create_session(
        &self,
        user_id: &str,
        state: Option<StateMap>,
        session_id: Option<String>,
    ) -> Result<Session> {
        self.service
            .create_session(&self.app_name, user_id, state, session_id)
            .await
    }

    pub async fn get_session(
        &self,
        user_id: &str,
        session_id: &str,
        config: &GetSessionConfig,
    ) -> Result<Option<Session>> {
        self.service
            .get_session(&self.app_name, user_id, session_id, config)
            .await
    }

    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>> {
        self.service.list_sessions(&self.app_name, user_id).await
    }

    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.service
            .delete_session(&self.app_name, user_id, session_id)
            .await
    }

    /// Revert a session to right before `rewind_before_invocation_id`.
    pub async fn rewind(
        &self,
        user_id: &str,
        session_id: &str,
        rewind_before_invocation_id: &str,
    ) -> Result<Session> {
        self.service
            .rewind(&self.app_name, user_id, session_id, rewind_before_invocation_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use turnstore_core::Role;

    #[tokio::test]
    async fn test_delete_cascades_to_session_artifacts() {
        let service = SessionService::in_memory();
        let session = service.create_session("app", "u", None, None).await.unwrap();
        let scope = ArtifactScope::from_key(&session.key());

        service.save_artifact(&scope, "notes", Artifact::text("n")).await.unwrap();
        service
            .save_artifact(&scope, "user:profile", Artifact::text("p"))
            .await
            .unwrap();

        service.delete_session("app", "u", &session.id).await.unwrap();
        assert!(service.load_artifact(&scope, "notes", None).await.unwrap().is_none());
        assert!(service
            .load_artifact(&scope, "user:profile", None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_partial_events_are_not_persisted() {
        let service = SessionService::in_memory();
        let mut session = service.create_session("app", "u", None, None).await.unwrap();
        let before = session.last_update_time;

        service
            .append_event(
                &mut session,
                Event::new("inv", "agent").with_state("k", 1).into_partial(),
            )
            .await
            .unwrap();

        assert_eq!(session.last_update_time, before);
        let stored = service
            .get_session("app", "u", &session.id, &GetSessionConfig::default())
            .await
            .unwrap()
            .unwrap();
        assert!(stored.events.is_empty());
        assert!(!stored.state.has("k"));
    }

    #[tokio::test]
    async fn test_turn_complete_triggers_compaction() {
        let config = CompactionConfig {
            compaction_interval: 2,
            overlap_size: 1,
            ..Default::default()
        };
        let service = SessionService::in_memory()
            .with_compactor(Compactor::new(config, Arc::new(TranscriptSummarizer::default())));
        let mut session = service.create_session("app", "u", None, None).await.unwrap();

        for i in 0..2 {
            let inv = format!("inv{}", i);
            service
                .append_event(
                    &mut session,
                    Event::new(&inv, "user").with_text(Role::User, format!("q{}", i)),
                )
                .await
                .unwrap();
            service
                .append_event(
                    &mut session,
                    Event::new(&inv, "agent")
                        .with_text(Role::Model, format!("a{}", i))
                        .finish_turn(),
                )
                .await
                .unwrap();
        }

        let last = session.events.last().unwrap();
        assert!(last.is_compaction());
        assert_eq!(session.events.len(), 5);
    }

    struct Failing;

    #[async_trait::async_trait]
    impl Summarizer for Failing {
        async fn maybe_summarize_events(&self, _events: &[Event]) -> anyhow::Result<Option<Event>> {
            anyhow::bail!("model unavailable")
        }
    }

    struct Slow;

    #[async_trait::async_trait]
    impl Summarizer for Slow {
        async fn maybe_summarize_events(&self, events: &[Event]) -> anyhow::Result<Option<Event>> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            TranscriptSummarizer::default().maybe_summarize_events(events).await
        }
    }

    #[tokio::test]
    async fn test_append_survives_summarizer_problems() {
        let summarizers: Vec<(&str, Arc<dyn Summarizer>)> =
            vec![("failing", Arc::new(Failing)), ("slow", Arc::new(Slow))];

        for (name, summarizer) in summarizers {
            let config = CompactionConfig {
                compaction_interval: 2,
                overlap_size: 1,
                summarizer_timeout: std::time::Duration::from_millis(20),
            };
            let service =
                SessionService::in_memory().with_compactor(Compactor::new(config, summarizer));
            let mut session = service.create_session("app", "u", None, None).await.unwrap();

            for i in 0..3 {
                let inv = format!("inv{}", i);
                let question = Event::new(&inv, "user").with_text(Role::User, format!("q{}", i));
                let answer = Event::new(&inv, "agent")
                    .with_text(Role::Model, format!("a{}", i))
                    .finish_turn();
                for event in [question, answer] {
                    let result = service.append_event(&mut session, event).await;
                    assert!(result.is_ok(), "{}: {:?}", name, result);
                }
            }

            assert_eq!(session.events.len(), 6, "{}", name);
            assert!(!session.events.iter().any(|e| e.is_compaction()), "{}", name);
            let stored = service
                .get_session("app", "u", &session.id, &GetSessionConfig::default())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.events.len(), 6, "{}", name);
            assert!(!stored.events.iter().any(|e| e.is_compaction()), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_app_handle_rewind() {
        let temp_dir = TempDir::new().unwrap();
        let service = SessionService::open_sqlite(temp_dir.path()).unwrap();
        let app = service.app("app");

        let mut session = app.create_session("u", None, Some("s".into())).await.unwrap();
        service
            .append_event(&mut session, Event::new("inv1", "agent").with_state("k", "v1"))
            .await
            .unwrap();
        service
            .append_event(&mut session, Event::new("inv2", "agent").with_state("k", "v2"))
            .await
            .unwrap();

        let rewound = app.rewind("u", "s", "inv2").await.unwrap();
        assert_eq!(rewound.state.get("k"), Some(&json!("v1")));
        assert_eq!(rewound.events.len(), 1);
        assert!(rewound.last_update_time > session.last_update_time);
    }

    #[tokio::test]
    async fn test_from_config_memory_backend() {
        let mut config = Config::default();
        config.storage.backend = "memory".into();
        config.compaction.enabled = true;
        let service = SessionService::from_config(&config, None).unwrap();
        assert!(service.compactor.is_some());

        config.storage.backend = "cassandra".into();
        assert!(matches!(
            SessionService::from_config(&config, None),
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_check_session() {
        let service = SessionService::in_memory();
        let mut session = service.create_session("app", "u", None, None).await.unwrap();
        service
            .append_event(&mut session, Event::new("inv", "agent").with_artifact_version("f", 0))
            .await
            .unwrap();

        let result = service.check_session("app", "u", &session.id).await.unwrap();
        assert!(!result.is_valid);
    }
}
