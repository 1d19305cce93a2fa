//! Session types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::state::State;

/// Identity of a session: `(app_name, user_id, session_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
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
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app_name, self.user_id, self.session_id)
    }
}

/// A conversation: its ordered event log plus the merged state view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub app_name: String,
    pub user_id: String,
    pub id: String,
    /// Merged view: session keys, plus `app:` and `user:` partitions
    pub state: State,
    /// Events in timestamp order (possibly filtered on read)
    pub events: Vec<Event>,
    /// Time of the last successful write; used for staleness detection
    pub last_update_time: DateTime<Utc>,
}

impl Session {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.app_name, &self.user_id, &self.id)
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Distinct invocation IDs in order of first appearance.
    pub fn invocation_ids(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for event in &self.events {
            if !seen.contains(&event.invocation_id.as_str()) {
                seen.push(event.invocation_id.as_str());
            }
        }
        seen
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            id: self.id.clone(),
            last_update_time: self.last_update_time,
            event_count: self.events.len(),
        }
    }
}

/// Session listing entry, without event bodies or state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub app_name: String,
    pub user_id: String,
    pub id: String,
    pub last_update_time: DateTime<Utc>,
    pub event_count: usize,
}

/// Filters applied to the events of a fetched session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetSessionConfig {
    /// Keep only the most recent N events
    pub num_recent_events: Option<usize>,
    /// Keep only events strictly after this time
    pub after_timestamp: Option<DateTime<Utc>>,
}

impl GetSessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recent_events(mut self, n: usize) -> Self {
        self.num_recent_events = Some(n);
        self
    }

    pub fn after(mut self, timestamp: DateTime<Utc>) -> Self {
        self.after_timestamp = Some(timestamp);
        self
    }

    /// Apply the timestamp filter, then the recency limit.
    pub fn apply(&self, mut events: Vec<Event>) -> Vec<Event> {
        if let Some(after) = self.after_timestamp {
            events.retain(|e| e.timestamp > after);
        }
        if let Some(n) = self.num_recent_events {
            let skip = events.len().saturating_sub(n);
            events.drain(..skip);
        }
        events
    }
}
