//! Shared helpers for the integration tests.

#![allow(dead_code)]

use tempfile::TempDir;
use turnstore_core::{Event, Role};
use turnstore_session::{Artifact, ArtifactScope, SessionService};

/// Every backend under test. The temp dir must outlive the service.
pub fn backends() -> Vec<(&'static str, SessionService, Option<TempDir>)> {
    let temp_dir = TempDir::new().unwrap();
    let sqlite = SessionService::open_sqlite(temp_dir.path()).unwrap();
    vec![
        ("memory", SessionService::in_memory(), None),
        ("sqlite", sqlite, Some(temp_dir)),
    ]
}

/// A user message followed by a turn-complete model reply.
pub fn turn(invocation_id: &str, question: &str, answer: &str) -> Vec<Event> {
    vec![
        Event::new(invocation_id, "user").with_text(Role::User, question),
        Event::new(invocation_id, "agent")
            .with_text(Role::Model, answer)
            .finish_turn(),
    ]
}

/// Build the three-invocation session used by the rewind scenarios:
/// - inv1 sets k1=v1 and saves f1@0
/// - inv2 sets k1=v2, k2=v2 and saves f1@1, f2@0
/// - inv3 sets k2=v3
pub async fn three_invocation_session(
    service: &SessionService,
    session_id: &str,
) -> ArtifactScope {
    let mut session = service
        .create_session("app", "u", None, Some(session_id.to_string()))
        .await
        .unwrap();
    let scope = ArtifactScope::from_key(&session.key());

    let f1 = service.save_artifact(&scope, "f1", Artifact::text("f1v0")).await.unwrap();
    service
        .append_event(
            &mut session,
            Event::new("inv1", "agent")
                .with_state("k1", "v1")
                .with_artifact_version("f1", f1),
        )
        .await
        .unwrap();

    let f1 = service.save_artifact(&scope, "f1", Artifact::text("f1v1")).await.unwrap();
    let f2 = service.save_artifact(&scope, "f2", Artifact::text("f2v0")).await.unwrap();
    service
        .append_event(
            &mut session,
            Event::new("inv2", "agent")
                .with_state("k1", "v2")
                .with_state("k2", "v2")
                .with_artifact_version("f1", f1)
                .with_artifact_version("f2", f2),
        )
        .await
        .unwrap();

    service
        .append_event(&mut session, Event::new("inv3", "agent").with_state("k2", "v3"))
        .await
        .unwrap();

    scope
}

/// Text of the latest version, if any.
pub async fn artifact_text(
    service: &SessionService,
    scope: &ArtifactScope,
    filename: &str,
) -> Option<String> {
    service
        .load_artifact(scope, filename, None)
        .await
        .unwrap()
        .and_then(|a| a.as_text().map(str::to_string))
}
