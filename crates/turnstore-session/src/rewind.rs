//! Rewind: revert a session to its condition right before an invocation.
//!
//! Rewind is computed from the stored history:
//! 1. The cut is the first event of the target invocation.
//! 2. Session state is replayed from the creation state through the kept events.
//! 3. Each artifact referenced by the log is truncated to the highest version
//!    the kept events reached, or removed if they never referenced it.
//! 4. The log is truncated and the replayed state stored in one write.
//!
//! The shared `app:` and `user:` partitions are not rolled back, and
//! user-scoped artifacts are left untouched for the same reason: other
//! sessions may depend on them. The session returned by a rewind still shows
//! the shared values as the kept events left them; later reads show the
//! partitions as they are.

use std::collections::BTreeMap;
use std::sync::Arc;

use turnstore_core::state::{APP_PREFIX, USER_PREFIX};
use turnstore_core::{Event, GetSessionConfig, ScopedDelta, Session, SessionKey, StateMap};

use crate::artifact::{is_user_scoped, Artifact, ArtifactScope, ArtifactStore};
use crate::error::{Result, StoreError};
use crate::store::{SessionRewrite, SessionStore};

/// Artifact versions removed during a rewind, per filename.
type Truncated = Vec<(String, Vec<(u32, Artifact)>)>;

/// The outcome of rewinding a log, before anything is written.
#[derive(Debug, Clone, PartialEq)]
pub struct RewindPlan {
    /// Number of events kept from the start of the log
    pub cut_index: usize,
    /// Replayed session-scoped state
    pub session_state: StateMap,
    /// Replayed `app:`/`user:` values, prefixed. Only overlaid on the returned
    /// snapshot; the shared partitions are not written.
    pub shared_state: StateMap,
    /// Highest version to keep per filename; `None` removes the file
    pub artifact_thresholds: BTreeMap<String, Option<u32>>,
}

/// Compute what rewinding `events` before `invocation_id` does.
pub fn plan_rewind(
    key: &SessionKey,
    events: &[Event],
    initial_state: &StateMap,
    invocation_id: &str,
) -> Result<RewindPlan> {
    let cut_index = events
        .iter()
        .position(|e| e.invocation_id == invocation_id)
        .ok_or_else(|| StoreError::InvocationNotFound {
            key: key.clone(),
            invocation_id: invocation_id.to_string(),
        })?;
    let (kept, dropped) = events.split_at(cut_index);

    // Compaction events carry no state delta, so they replay as no-ops
    let mut session_state = initial_state.clone();
    let mut shared_state = StateMap::new();
    for event in kept {
        let scoped = ScopedDelta::split(&event.actions.state_delta);
        session_state.extend(scoped.session);
        for (name, value) in scoped.app {
            shared_state.insert(format!("{}{}", APP_PREFIX, name), value);
        }
        for (name, value) in scoped.user {
            shared_state.insert(format!("{}{}", USER_PREFIX, name), value);
        }
    }

    let mut artifact_thresholds: BTreeMap<String, Option<u32>> = BTreeMap::new();
    for event in kept {
        for (filename, &version) in &event.actions.artifact_delta {
            let threshold = artifact_thresholds.entry(filename.clone()).or_insert(None);
            *threshold = Some(threshold.map_or(version, |v| v.max(version)));
        }
    }
    for event in dropped {
        for filename in event.actions.artifact_delta.keys() {
            artifact_thresholds.entry(filename.clone()).or_insert(None);
        }
    }

    Ok(RewindPlan {
        cut_index,
        session_state,
        shared_state,
        artifact_thresholds,
    })
}

/// Applies rewind plans against a session store and an artifact store.
///
/// Callers must serialize rewinds with appends to the same session.
pub struct RewindEngine {
    sessions: Arc<dyn SessionStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl RewindEngine {
    pub fn new(sessions: Arc<dyn SessionStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            sessions,
            artifacts,
        }
    }

    /// Rewind the session to right before `invocation_id` and return it.
    pub async fn rewind(&self, key: &SessionKey, invocation_id: &str) -> Result<Session> {
        let history = self
            .sessions
            .load_history(key)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(key.clone()))?;

        let plan = plan_rewind(key, &history.events, &history.initial_state, invocation_id)?;
        tracing::info!(
            session = %key,
            invocation = invocation_id,
            kept = plan.cut_index,
            dropped = history.events.len() - plan.cut_index,
            "Rewinding session"
        );

        let scope = ArtifactScope::from_key(key);
        let truncated = match self.truncate_artifacts(&scope, &plan).await {
            Ok(truncated) => truncated,
            Err((truncated, err)) => {
                self.restore_artifacts(&scope, truncated).await;
                return Err(StoreError::RewindFailed {
                    key: key.clone(),
                    reason: err.to_string(),
                });
            }
        };

        let rewrite = SessionRewrite {
            keep_events: plan.cut_index,
            session_state: plan.session_state,
            expected_last_update_time: history.last_update_time,
        };
        if let Err(err) = self.sessions.rewrite_session(key, rewrite).await {
            self.restore_artifacts(&scope, truncated).await;
            return Err(StoreError::RewindFailed {
                key: key.clone(),
                reason: err.to_string(),
            });
        }

        let mut session = self
            .sessions
            .get_session(key, &GetSessionConfig::default())
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(key.clone()))?;
        session.state.apply(&plan.shared_state);
        Ok(session)
    }

    /// Truncate every planned artifact. On failure, hands back what was already
    /// removed so it can be restored.
    async fn truncate_artifacts(
        &self,
        scope: &ArtifactScope,
        plan: &RewindPlan,
    ) -> std::result::Result<Truncated, (Truncated, StoreError)> {
        let mut truncated = Vec::new();
        for (filename, threshold) in &plan.artifact_thresholds {
            if is_user_scoped(filename) {
                tracing::debug!(filename = %filename, "Leaving user-scoped artifact in place");
                continue;
            }
            match self
                .artifacts
                .truncate_artifact(scope, filename, *threshold)
                .await
            {
                Ok(removed) if removed.is_empty() => {}
                Ok(removed) => truncated.push((filename.clone(), removed)),
                Err(err) => return Err((truncated, err)),
            }
        }
        Ok(truncated)
    }

    /// Save removed versions back, oldest first, so they get their old numbers.
    async fn restore_artifacts(&self, scope: &ArtifactScope, truncated: Truncated) {
        for (filename, removed) in truncated {
            for (version, artifact) in removed {
                match self.artifacts.save_artifact(scope, &filename, artifact).await {
                    Ok(restored) if restored == version => {}
                    Ok(restored) => tracing::error!(
                        filename = %filename,
                        expected = version,
                        restored,
                        "Artifact restored under a different version"
                    ),
                    Err(err) => tracing::error!(
                        filename = %filename,
                        version,
                        error = %err,
                        "Failed to restore artifact after rewind failure"
                    ),
                }
            }
        }
    }
}
