//! In-memory session storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use turnstore_core::{
    clock, Event, GetSessionConfig, ScopedDelta, Session, SessionKey, SessionSummary, StateMap,
};

use super::{
    apply_to_snapshot, prepare_event, sequence_after, validate_identity, SessionRewrite,
    SessionStore, StoredHistory,
};
use crate::error::{check_staleness, Result, StoreError};
use crate::state::StatePartitions;

#[derive(Debug, Clone)]
struct StoredSession {
    /// Session-scoped keys only
    state: StateMap,
    initial_state: StateMap,
    events: Vec<Event>,
    last_update_time: DateTime<Utc>,
}

/// Session store held in process memory.
///
/// Each session has its own async mutex, so writers to one session are
/// serialized while different sessions proceed independently.
pub struct InMemorySessionStore {
    partitions: Arc<StatePartitions>,
    sessions: RwLock<HashMap<SessionKey, Arc<Mutex<StoredSession>>>>,
}

impl InMemorySessionStore {
    /// Create a store with its own, unshared state partitions.
    pub fn new() -> Self {
        Self::with_partitions(Arc::new(StatePartitions::new()))
    }

    /// Create a store reading and writing the given app/user partitions.
    pub fn with_partitions(partitions: Arc<StatePartitions>) -> Self {
        Self {
            partitions,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn partitions(&self) -> &Arc<StatePartitions> {
        &self.partitions
    }

    fn entry(&self, key: &SessionKey) -> Option<Arc<Mutex<StoredSession>>> {
        self.sessions.read().get(key).cloned()
    }

    fn to_session(&self, key: &SessionKey, stored: &StoredSession, events: Vec<Event>) -> Session {
        Session {
            app_name: key.app_name.clone(),
            user_id: key.user_id.clone(),
            id: key.session_id.clone(),
            state: self
                .partitions
                .merged_view(&key.app_name, &key.user_id, &stored.state)
                .into(),
            events,
            last_update_time: stored.last_update_time,
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<StateMap>,
        session_id: Option<String>,
    ) -> Result<Session> {
        let session_id = session_id
            .map(|id| id.trim().to_string())
            .unwrap_or_else(Event::new_id);
        validate_identity(app_name, user_id, &session_id)?;
        let key = SessionKey::new(app_name, user_id, &session_id);

        let scoped = ScopedDelta::split(&state.unwrap_or_default());
        let stored = StoredSession {
            state: scoped.session.clone(),
            initial_state: scoped.session.clone(),
            events: Vec::new(),
            last_update_time: clock::now(),
        };

        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key));
            }
            sessions.insert(key.clone(), Arc::new(Mutex::new(stored.clone())));
        }
        self.partitions.apply(app_name, user_id, &scoped);

        tracing::info!(session = %key, "Created session");
        Ok(self.to_session(&key, &stored, Vec::new()))
    }

    async fn get_session(
        &self,
        key: &SessionKey,
        config: &GetSessionConfig,
    ) -> Result<Option<Session>> {
        let Some(entry) = self.entry(key) else {
            return Ok(None);
        };
        let stored = entry.lock().await;
        let events = config.apply(stored.events.clone());
        Ok(Some(self.to_session(key, &stored, events)))
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<SessionSummary>> {
        let entries: Vec<(SessionKey, Arc<Mutex<StoredSession>>)> = self
            .sessions
            .read()
            .iter()
            .filter(|(key, _)| key.app_name == app_name && key.user_id == user_id)
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();

        let mut summaries = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            let stored = entry.lock().await;
            summaries.push(SessionSummary {
                app_name: key.app_name,
                user_id: key.user_id,
                id: key.session_id,
                last_update_time: stored.last_update_time,
                event_count: stored.events.len(),
            });
        }

        summaries.sort_by(|a, b| b.last_update_time.cmp(&a.last_update_time));
        Ok(summaries)
    }

    async fn delete_session(&self, key: &SessionKey) -> Result<()> {
        if self.sessions.write().remove(key).is_none() {
            return Err(StoreError::SessionNotFound(key.clone()));
        }
        tracing::info!(session = %key, "Deleted session");
        Ok(())
    }

    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event> {
        if event.partial {
            tracing::debug!(event = %event.id, "Skipping partial event");
            return Ok(event);
        }

        let mut event = prepare_event(event)?;
        let key = session.key();
        let entry = self
            .entry(&key)
            .ok_or_else(|| StoreError::SessionNotFound(key.clone()))?;
        let mut stored = entry.lock().await;

        check_staleness(&key, session.last_update_time, stored.last_update_time)?;
        sequence_after(&mut event, stored.events.last().map(|e| e.timestamp));
        if stored.events.iter().any(|e| e.id == event.id) {
            return Err(StoreError::Validation(format!(
                "event {} already exists in {}",
                event.id, key
            )));
        }

        let scoped = ScopedDelta::split(&event.actions.state_delta);
        self.partitions.apply(&key.app_name, &key.user_id, &scoped);
        stored.state.extend(scoped.session);
        stored.events.push(event.clone());
        stored.last_update_time = clock::advance(stored.last_update_time);

        tracing::debug!(session = %key, event = %event.id, "Appended event");
        apply_to_snapshot(session, &event, stored.last_update_time);
        Ok(event)
    }

    async fn load_history(&self, key: &SessionKey) -> Result<Option<StoredHistory>> {
        let Some(entry) = self.entry(key) else {
            return Ok(None);
        };
        let stored = entry.lock().await;
        Ok(Some(StoredHistory {
            events: stored.events.clone(),
            initial_state: stored.initial_state.clone(),
            last_update_time: stored.last_update_time,
        }))
    }

    async fn rewrite_session(
        &self,
        key: &SessionKey,
        rewrite: SessionRewrite,
    ) -> Result<DateTime<Utc>> {
        let entry = self
            .entry(key)
            .ok_or_else(|| StoreError::SessionNotFound(key.clone()))?;
        let mut stored = entry.lock().await;

        if stored.last_update_time != rewrite.expected_last_update_time {
            return Err(StoreError::StaleSession {
                key: key.clone(),
                snapshot: rewrite.expected_last_update_time,
                stored: stored.last_update_time,
            });
        }
        if rewrite.keep_events > stored.events.len() {
            return Err(StoreError::Validation(format!(
                "cannot keep {} of {} events in {}",
                rewrite.keep_events,
                stored.events.len(),
                key
            )));
        }

        stored.events.truncate(rewrite.keep_events);
        stored.state = rewrite.session_state;
        stored.last_update_time = clock::advance(stored.last_update_time);
        Ok(stored.last_update_time)
    }
}
