//! Events: the unit of a session's append-only log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock;
use crate::error::{Error, Result};
use crate::state::{Scope, ScopeKey, StateMap};

/// Role of the content producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// User input
    User,
    /// Model output
    Model,
    /// Tool result
    Tool,
}

/// One part of an event's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Part {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "function_call")]
    FunctionCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    #[serde(rename = "function_response")]
    FunctionResponse {
        id: String,
        name: String,
        response: serde_json::Value,
    },
}

/// Content payload carried by an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    /// Single text part content.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    /// Concatenated text parts, newline separated.
    pub fn as_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Declares that a span of the log is summarized by this event's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCompaction {
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub summarized_content: Content,
}

impl EventCompaction {
    /// Whether `timestamp` falls inside the summarized span.
    pub fn covers(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start_timestamp && timestamp <= self.end_timestamp
    }
}

/// Side effects that are applied together with an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventActions {
    /// Scoped key to value, applied atomically with the event.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state_delta: StateMap,
    /// Filename to the artifact version reached during this invocation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifact_delta: BTreeMap<String, u32>,
    /// Present only on synthetic summary events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction: Option<EventCompaction>,
}

impl EventActions {
    pub fn is_empty(&self) -> bool {
        self.state_delta.is_empty() && self.artifact_delta.is_empty() && self.compaction.is_none()
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A single entry in a session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID
    pub id: String,
    /// Groups the events of one agent turn
    pub invocation_id: String,
    /// Who produced the event (`user` or an agent name)
    pub author: String,
    /// Dot-separated agent path, for multi-agent orchestration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Per-session ordering key
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default)]
    pub actions: EventActions,
    /// Streaming fragment; never persisted
    #[serde(default, skip_serializing_if = "is_false")]
    pub partial: bool,
    /// Final event of its invocation
    #[serde(default, skip_serializing_if = "is_false")]
    pub turn_complete: bool,
}

impl Event {
    /// Create an empty event for an invocation.
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: Self::new_id(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            branch: None,
            timestamp: clock::now(),
            content: None,
            actions: EventActions::default(),
            partial: false,
            turn_complete: false,
        }
    }

    /// Generate a fresh event or invocation ID.
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Build a compaction event summarizing `[start, end]`.
    pub fn compaction(
        author: impl Into<String>,
        start_timestamp: DateTime<Utc>,
        end_timestamp: DateTime<Utc>,
        summarized_content: Content,
    ) -> Self {
        let mut event = Self::new(Self::new_id(), author);
        event.actions.compaction = Some(EventCompaction {
            start_timestamp,
            end_timestamp,
            summarized_content,
        });
        event
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_text(self, role: Role, text: impl Into<String>) -> Self {
        self.with_content(Content::text(role, text))
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_state(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.actions.state_delta.insert(key.into(), value.into());
        self
    }

    pub fn with_artifact_version(mut self, filename: impl Into<String>, version: u32) -> Self {
        self.actions.artifact_delta.insert(filename.into(), version);
        self
    }

    /// Mark as a streaming fragment.
    pub fn into_partial(mut self) -> Self {
        self.partial = true;
        self
    }

    /// Mark as the final event of its invocation.
    pub fn finish_turn(mut self) -> Self {
        self.turn_complete = true;
        self
    }

    pub fn is_compaction(&self) -> bool {
        self.actions.compaction.is_some()
    }

    /// Text of the content, if any.
    pub fn text(&self) -> Option<String> {
        self.content.as_ref().map(Content::as_text)
    }

    /// Check the event is well-formed enough to persist.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("event id is empty"));
        }
        if self.invocation_id.trim().is_empty() {
            return Err(Error::validation(format!(
                "event {} has an empty invocation id",
                self.id
            )));
        }
        if self.author.trim().is_empty() {
            return Err(Error::validation(format!("event {} has an empty author", self.id)));
        }

        for key in self.actions.state_delta.keys() {
            let parsed = ScopeKey::parse(key);
            if parsed.name.is_empty() {
                return Err(Error::validation(format!(
                    "event {} has an empty state key{}",
                    self.id,
                    match parsed.scope {
                        Scope::Session => String::new(),
                        scope => format!(" under prefix '{}'", scope.prefix()),
                    }
                )));
            }
        }

        if self.actions.artifact_delta.keys().any(|f| f.trim().is_empty()) {
            return Err(Error::validation(format!(
                "event {} has an empty artifact filename",
                self.id
            )));
        }

        if let Some(ref compaction) = self.actions.compaction {
            if compaction.start_timestamp > compaction.end_timestamp {
                return Err(Error::validation(format!(
                    "event {} compacts an inverted range {} > {}",
                    self.id, compaction.start_timestamp, compaction.end_timestamp
                )));
            }
        }

        Ok(())
    }
}
