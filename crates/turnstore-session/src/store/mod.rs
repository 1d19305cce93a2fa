//! Session storage: the event log and per-session state.
//!
//! Two backends implement [`SessionStore`]:
//! - [`InMemorySessionStore`]: per-session async locks, shared
//!   [`StatePartitions`](crate::state::StatePartitions)
//! - [`SqliteSessionStore`]: one SQLite transaction per write
//!
//! Every append follows the same steps: skip partial events, reject stale
//! snapshots, route the state delta into its partitions, persist the event,
//! and advance `last_update_time`.

mod memory;
mod sqlite;

pub use memory::InMemorySessionStore;
pub use sqlite::SqliteSessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use turnstore_core::{
    clock, state::strip_temp, Event, GetSessionConfig, Session, SessionKey, SessionSummary,
    StateMap,
};

use crate::error::{Result, StoreError};

/// Everything rewind needs to recompute a session.
#[derive(Debug, Clone)]
pub struct StoredHistory {
    /// All persisted events in log order
    pub events: Vec<Event>,
    /// Session-scoped part of the creation state
    pub initial_state: StateMap,
    pub last_update_time: DateTime<Utc>,
}

/// Wholesale replacement of a session's log and state.
#[derive(Debug, Clone)]
pub struct SessionRewrite {
    /// Keep this many events from the start of the log; drop the rest
    pub keep_events: usize,
    /// New session-scoped state
    pub session_state: StateMap,
    /// The rewrite is rejected if the stored session changed since this time
    pub expected_last_update_time: DateTime<Utc>,
}

/// Session storage trait for abstraction over storage backends.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session. `state` may hold `app:`/`user:` keys, which go to the
    /// shared partitions; `temp:` keys are dropped.
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<StateMap>,
        session_id: Option<String>,
    ) -> Result<Session>;

    /// Get a session with the merged state view, or `None` if absent.
    async fn get_session(
        &self,
        key: &SessionKey,
        config: &GetSessionConfig,
    ) -> Result<Option<Session>>;

    /// List sessions of a user, most recently updated first.
    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<SessionSummary>>;

    /// Delete a session and its events.
    async fn delete_session(&self, key: &SessionKey) -> Result<()>;

    /// Append an event, updating `session` in place on success.
    ///
    /// Partial events are returned untouched and never persisted.
    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event>;

    /// Load the full stored history of a session.
    async fn load_history(&self, key: &SessionKey) -> Result<Option<StoredHistory>>;

    /// Truncate the log and replace the session-scoped state in one step.
    /// Returns the new `last_update_time`.
    async fn rewrite_session(
        &self,
        key: &SessionKey,
        rewrite: SessionRewrite,
    ) -> Result<DateTime<Utc>>;
}

/// Validate an event for persistence and normalize it: `temp:` keys are
/// removed from its delta and its timestamp is truncated to storage precision.
pub(crate) fn prepare_event(mut event: Event) -> Result<Event> {
    event.validate()?;
    strip_temp(&mut event.actions.state_delta);
    event.timestamp = clock::truncate(event.timestamp);
    Ok(event)
}

/// Keep the log strictly ordered: an event stamped at or before the last
/// stored event moves to one microsecond after it.
pub(crate) fn sequence_after(event: &mut Event, last_timestamp: Option<DateTime<Utc>>) {
    let Some(last) = last_timestamp else {
        return;
    };
    if event.timestamp <= last {
        tracing::debug!(
            event = %event.id,
            stamped = %event.timestamp,
            last = %last,
            "Moving event after the last stored event"
        );
        event.timestamp = last + Duration::microseconds(1);
    }
}

/// Reflect a persisted event in the caller's snapshot.
pub(crate) fn apply_to_snapshot(session: &mut Session, event: &Event, update_time: DateTime<Utc>) {
    session.state.apply(&event.actions.state_delta);
    session.events.push(event.clone());
    session.last_update_time = update_time;
}

/// Validate the pieces of a session identity.
pub(crate) fn validate_identity(app_name: &str, user_id: &str, session_id: &str) -> Result<()> {
    for (field, value) in [
        ("app_name", app_name),
        ("user_id", user_id),
        ("session_id", session_id),
    ] {
        if value.trim().is_empty() {
            return Err(StoreError::Validation(format!("{} must not be empty", field)));
        }
    }
    Ok(())
}
