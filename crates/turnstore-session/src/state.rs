//! Shared application and user state partitions.
//!
//! App and user partitions outlive sessions and are read through by every
//! session of that app/user. They are owned here, separately from any session,
//! and handed to the in-memory session store as an explicit dependency so that
//! the sharing is visible (two stores built on the same partitions see each
//! other's `app:`/`user:` writes).

use std::collections::HashMap;

use parking_lot::RwLock;

use turnstore_core::state::{merge_view, ScopedDelta, StateMap};

/// App partitions keyed by app name, user partitions keyed by `(app, user)`.
#[derive(Debug, Default)]
pub struct StatePartitions {
    app: RwLock<HashMap<String, StateMap>>,
    user: RwLock<HashMap<(String, String), StateMap>>,
}

impl StatePartitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of an app partition (bare keys).
    pub fn app_state(&self, app_name: &str) -> StateMap {
        self.app.read().get(app_name).cloned().unwrap_or_default()
    }

    /// Snapshot of a user partition (bare keys).
    pub fn user_state(&self, app_name: &str, user_id: &str) -> StateMap {
        self.user
            .read()
            .get(&(app_name.to_string(), user_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Write the app and user parts of a routed delta. The session part is
    /// owned by the session store and ignored here.
    pub fn apply(&self, app_name: &str, user_id: &str, delta: &ScopedDelta) {
        if !delta.app.is_empty() {
            let mut app = self.app.write();
            let partition = app.entry(app_name.to_string()).or_default();
            for (key, value) in &delta.app {
                partition.insert(key.clone(), value.clone());
            }
        }

        if !delta.user.is_empty() {
            let mut user = self.user.write();
            let partition = user
                .entry((app_name.to_string(), user_id.to_string()))
                .or_default();
            for (key, value) in &delta.user {
                partition.insert(key.clone(), value.clone());
            }
        }
    }

    /// Merged view for one session.
    pub fn merged_view(&self, app_name: &str, user_id: &str, session_state: &StateMap) -> StateMap {
        merge_view(
            session_state,
            &self.app_state(app_name),
            &self.user_state(app_name, user_id),
        )
    }
}
