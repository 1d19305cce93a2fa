//! Session integrity checks.
//!
//! Stores enforce these rules on every write; the checks here are for
//! inspecting sessions after the fact (imports, manual edits, older data).

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use turnstore_core::state::TEMP_PREFIX;
use turnstore_core::Session;

use crate::artifact::{ArtifactScope, ArtifactStore};
use crate::error::Result;

/// Result of validating a session.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    /// Session ID that was validated.
    pub session_id: String,
    /// Whether the session is valid.
    pub is_valid: bool,
    /// List of issues found.
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            is_valid: true,
            issues: Vec::new(),
        }
    }

    fn push(&mut self, severity: IssueSeverity, description: String) {
        if severity == IssueSeverity::Error {
            self.is_valid = false;
        }
        self.issues.push(ValidationIssue {
            severity,
            description,
        });
    }
}

/// An issue found during validation.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    /// Severity of the issue.
    pub severity: IssueSeverity,
    /// Description of the issue.
    pub description: String,
}

/// Severity of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Informational, no action needed.
    Info,
    /// Warning, session may work but has issues.
    Warning,
    /// Error, session may be corrupted.
    Error,
}

/// Check a session's log and state for rule violations.
pub fn validate_session(session: &Session) -> ValidationResult {
    let mut result = ValidationResult::new(&session.id);
    let mut seen_ids = HashSet::new();
    let mut artifact_versions: BTreeMap<&str, u32> = BTreeMap::new();

    for (idx, event) in session.events.iter().enumerate() {
        if let Some(prev) = idx.checked_sub(1).map(|i| &session.events[i]) {
            if event.timestamp <= prev.timestamp {
                result.push(
                    IssueSeverity::Error,
                    format!(
                        "Event {} ({}) is not later than the event before it",
                        idx, event.id
                    ),
                );
            }
        }

        if event.partial {
            result.push(
                IssueSeverity::Error,
                format!("Partial event {} ({}) was persisted", idx, event.id),
            );
        }

        if !seen_ids.insert(event.id.as_str()) {
            result.push(
                IssueSeverity::Error,
                format!("Event ID {} appears more than once", event.id),
            );
        }

        if event.invocation_id.trim().is_empty() {
            result.push(
                IssueSeverity::Error,
                format!("Event {} ({}) has an empty invocation ID", idx, event.id),
            );
        }

        if event
            .actions
            .state_delta
            .keys()
            .any(|k| k.starts_with(TEMP_PREFIX))
        {
            result.push(
                IssueSeverity::Warning,
                format!("Event {} ({}) persisted a temp: state key", idx, event.id),
            );
        }

        for (filename, &version) in &event.actions.artifact_delta {
            if let Some(&previous) = artifact_versions.get(filename.as_str()) {
                if version < previous {
                    result.push(
                        IssueSeverity::Error,
                        format!(
                            "Artifact {} goes back from version {} to {} at event {}",
                            filename, previous, version, idx
                        ),
                    );
                }
            }
            artifact_versions.insert(filename, version);
        }

        if let Some(compaction) = &event.actions.compaction {
            if compaction.start_timestamp > compaction.end_timestamp {
                result.push(
                    IssueSeverity::Error,
                    format!("Compaction event {} has an inverted range", event.id),
                );
            } else if compaction.end_timestamp > event.timestamp {
                result.push(
                    IssueSeverity::Warning,
                    format!(
                        "Compaction event {} summarizes events after itself",
                        event.id
                    ),
                );
            }
            if compaction.summarized_content.as_text().trim().is_empty() {
                result.push(
                    IssueSeverity::Info,
                    format!("Compaction event {} has an empty summary", event.id),
                );
            }
        }
    }

    for key in session.state.as_map().keys() {
        if key.starts_with(TEMP_PREFIX) {
            result.push(
                IssueSeverity::Error,
                format!("State holds ephemeral key {}", key),
            );
        }
    }

    result
}

/// Check the session's artifact references against the artifact store.
///
/// Versions must be contiguous from 0 and every version an event refers to
/// must still exist.
pub async fn validate_artifacts(
    store: &dyn ArtifactStore,
    session: &Session,
) -> Result<ValidationResult> {
    let mut result = ValidationResult::new(&session.id);
    let scope = ArtifactScope::from_key(&session.key());

    let mut referenced: BTreeMap<&str, u32> = BTreeMap::new();
    for event in &session.events {
        for (filename, &version) in &event.actions.artifact_delta {
            let entry = referenced.entry(filename.as_str()).or_insert(version);
            *entry = (*entry).max(version);
        }
    }

    for filename in store.list_artifact_keys(&scope).await? {
        let versions = store.list_versions(&scope, &filename).await?;
        let contiguous = versions.iter().enumerate().all(|(i, &v)| v == i as u32);
        if !contiguous {
            result.push(
                IssueSeverity::Error,
                format!("Artifact {} has non-contiguous versions {:?}", filename, versions),
            );
        }
    }

    for (filename, version) in referenced {
        let versions = store.list_versions(&scope, filename).await?;
        if !versions.contains(&version) {
            result.push(
                IssueSeverity::Error,
                format!(
                    "Artifact {} version {} is referenced but not stored",
                    filename, version
                ),
            );
        }
    }

    Ok(result)
}
