//! Scoped state keys and the merged state view.
//!
//! State keys carry their scope in a prefix:
//!
//! | prefix  | scope                                   | persisted |
//! |---------|-----------------------------------------|-----------|
//! | `app:`  | shared by every session of an app       | yes       |
//! | `user:` | shared by every session of an app/user  | yes       |
//! | `temp:` | current invocation only                 | no        |
//! | (none)  | the session itself                      | yes       |
//!
//! The merged view of a session re-attaches the `app:` and `user:` prefixes to
//! the shared partitions, so merged keys never collide with session keys.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// A flat string-to-value state map.
pub type StateMap = BTreeMap<String, Value>;

/// Prefix for application-scoped keys.
pub const APP_PREFIX: &str = "app:";
/// Prefix for user-scoped keys.
pub const USER_PREFIX: &str = "user:";
/// Prefix for ephemeral keys that are never persisted.
pub const TEMP_PREFIX: &str = "temp:";

/// Namespace a state key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    App,
    User,
    Session,
    Temp,
}

impl Scope {
    /// The key prefix for this scope (empty for session scope).
    pub fn prefix(&self) -> &'static str {
        match self {
            Scope::App => APP_PREFIX,
            Scope::User => USER_PREFIX,
            Scope::Session => "",
            Scope::Temp => TEMP_PREFIX,
        }
    }

    /// Whether values in this scope are ever written to storage.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, Scope::Temp)
    }
}

/// A state key split into its scope and the bare name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeKey<'a> {
    pub scope: Scope,
    pub name: &'a str,
}

impl<'a> ScopeKey<'a> {
    /// Parse a key by its prefix. Unprefixed keys are session-scoped.
    pub fn parse(key: &'a str) -> Self {
        let (scope, name) = if let Some(name) = key.strip_prefix(APP_PREFIX) {
            (Scope::App, name)
        } else if let Some(name) = key.strip_prefix(USER_PREFIX) {
            (Scope::User, name)
        } else if let Some(name) = key.strip_prefix(TEMP_PREFIX) {
            (Scope::Temp, name)
        } else {
            (Scope::Session, key)
        };
        Self { scope, name }
    }

    /// The full key, prefix included.
    pub fn qualified(&self) -> String {
        format!("{}{}", self.scope.prefix(), self.name)
    }
}

/// A state delta routed into its destination partitions.
///
/// `app` and `user` hold bare (unprefixed) names; `temp:` entries are dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopedDelta {
    pub app: StateMap,
    pub user: StateMap,
    pub session: StateMap,
}

impl ScopedDelta {
    /// Route every entry of `delta` by its prefix.
    pub fn split(delta: &StateMap) -> Self {
        let mut scoped = Self::default();
        for (key, value) in delta {
            let parsed = ScopeKey::parse(key);
            match parsed.scope {
                Scope::App => {
                    scoped.app.insert(parsed.name.to_string(), value.clone());
                }
                Scope::User => {
                    scoped.user.insert(parsed.name.to_string(), value.clone());
                }
                Scope::Session => {
                    scoped.session.insert(key.clone(), value.clone());
                }
                Scope::Temp => {}
            }
        }
        scoped
    }

    pub fn is_empty(&self) -> bool {
        self.app.is_empty() && self.user.is_empty() && self.session.is_empty()
    }
}

/// Remove every `temp:` entry from a delta.
pub fn strip_temp(delta: &mut StateMap) {
    delta.retain(|key, _| ScopeKey::parse(key).scope.is_persistent());
}

/// Build the merged view: session keys as-is, app and user partitions re-prefixed.
pub fn merge_view(session: &StateMap, app: &StateMap, user: &StateMap) -> StateMap {
    let mut merged = session.clone();
    for (name, value) in app {
        merged.insert(format!("{}{}", APP_PREFIX, name), value.clone());
    }
    for (name, value) in user {
        merged.insert(format!("{}{}", USER_PREFIX, name), value.clone());
    }
    merged
}

/// Merged state exposed on a session, with explicit typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State {
    values: StateMap,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a raw value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Get a raw value, or `default` when the key is absent.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.values.get(key).cloned().unwrap_or(default)
    }

    /// Get a value deserialized into `T`. Returns `None` when absent or of the wrong shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Get a string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Apply every entry of a delta in order.
    pub fn apply(&mut self, delta: &StateMap) {
        for (key, value) in delta {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn as_map(&self) -> &StateMap {
        &self.values
    }

    pub fn into_map(self) -> StateMap {
        self.values
    }

    /// Only the session-scoped entries (no prefix).
    pub fn session_scoped(&self) -> StateMap {
        self.values
            .iter()
            .filter(|(key, _)| ScopeKey::parse(key).scope == Scope::Session)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl From<StateMap> for State {
    fn from(values: StateMap) -> Self {
        Self { values }
    }
}
