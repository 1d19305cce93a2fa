//! Session management commands.

use turnstore_core::{Config, Event, GetSessionConfig, Session};
use turnstore_session::{IssueSeverity, SessionService, StoreError};

use super::{format_time, open_service, preview};
use crate::SessionAction;

pub async fn handle(action: SessionAction, config: &Config) -> anyhow::Result<()> {
    let service = open_service(config)?;
    run(&service, action).await
}

async fn run(service: &SessionService, action: SessionAction) -> anyhow::Result<()> {
    match action {
        SessionAction::List { app, user } => {
            list_sessions(service, &app, &user).await?;
        }
        SessionAction::Show {
            app,
            user,
            id,
            recent,
            json,
        } => {
            show_session(service, &app, &user, &id, recent, json).await?;
        }
        SessionAction::Delete { app, user, id } => match service
            .delete_session(&app, &user, &id)
            .await
        {
            Ok(()) => println!("Deleted session: {}", id),
            Err(StoreError::SessionNotFound(_)) => println!("Session not found: {}", id),
            Err(e) => return Err(e.into()),
        },
        SessionAction::Rewind {
            app,
            user,
            id,
            before,
        } => {
            let session = service.rewind(&app, &user, &id, &before).await?;
            println!(
                "Rewound session {} to before invocation {} ({} events remain)",
                session.id,
                before,
                session.events.len()
            );
        }
        SessionAction::Check { app, user, id } => {
            check_session(service, &app, &user, &id).await?;
        }
        SessionAction::Compact { app, user, id } => {
            match service.compact_session(&app, &user, &id).await? {
                Some(event) => {
                    let compaction = event.actions.compaction.as_ref();
                    println!("Compacted session {}", id);
                    if let Some(c) = compaction {
                        println!(
                            "  Range: {} .. {}",
                            format_time(&c.start_timestamp),
                            format_time(&c.end_timestamp)
                        );
                    }
                }
                None => println!("Nothing to compact in session {}", id),
            }
        }
    }

    Ok(())
}

async fn list_sessions(service: &SessionService, app: &str, user: &str) -> anyhow::Result<()> {
    let sessions = service.list_sessions(app, user).await?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!("Sessions ({}):", sessions.len());
    println!();

    for s in &sessions {
        println!(
            "{}  {}  ({} events)",
            s.id,
            format_time(&s.last_update_time),
            s.event_count
        );
    }

    println!();
    println!("Use 'turnstore session show {} {} <id>' for details", app, user);

    Ok(())
}

async fn show_session(
    service: &SessionService,
    app: &str,
    user: &str,
    id: &str,
    recent: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let mut filter = GetSessionConfig::new();
    if let Some(n) = recent {
        filter = filter.with_recent_events(n);
    }

    let Some(session) = service.get_session(app, user, id, &filter).await? else {
        println!("Session not found: {}", id);
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }

    print_session(&session);
    Ok(())
}

fn print_session(session: &Session) {
    println!("Session: {}", session.id);
    println!("================================================================================");
    println!();
    println!("App:         {}", session.app_name);
    println!("User:        {}", session.user_id);
    println!("Updated:     {}", format_time(&session.last_update_time));
    println!("Events:      {}", session.events.len());
    println!("Invocations: {}", session.invocation_ids().len());

    if !session.state.is_empty() {
        println!();
        println!("State:");
        for (key, value) in session.state.iter() {
            println!("  {} = {}", key, value);
        }
    }

    if !session.events.is_empty() {
        println!();
        println!("Events:");
        println!("-------");
        for (idx, event) in session.events.iter().enumerate() {
            println!("[{}] {}", idx, describe_event(event));
        }
    }
}

fn describe_event(event: &Event) -> String {
    let mut line = format!(
        "{} {} ({})",
        format_time(&event.timestamp),
        event.author,
        event.invocation_id
    );

    if let Some(c) = &event.actions.compaction {
        line.push_str(&format!(
            " summary of {} .. {}: {}",
            format_time(&c.start_timestamp),
            format_time(&c.end_timestamp),
            preview(&c.summarized_content.as_text(), 60)
        ));
        return line;
    }

    if let Some(text) = event.text() {
        line.push_str(": ");
        line.push_str(&preview(&text, 70));
    }
    if !event.actions.state_delta.is_empty() {
        let keys: Vec<&str> = event.actions.state_delta.keys().map(String::as_str).collect();
        line.push_str(&format!(" [state: {}]", keys.join(", ")));
    }
    for (filename, version) in &event.actions.artifact_delta {
        line.push_str(&format!(" [{} v{}]", filename, version));
    }
    line
}

async fn check_session(
    service: &SessionService,
    app: &str,
    user: &str,
    id: &str,
) -> anyhow::Result<()> {
    let result = service.check_session(app, user, id).await?;

    if result.issues.is_empty() {
        println!("Session {} is valid.", id);
        return Ok(());
    }

    for issue in &result.issues {
        let label = match issue.severity {
            IssueSeverity::Info => "info",
            IssueSeverity::Warning => "warning",
            IssueSeverity::Error => "error",
        };
        println!("{:<8} {}", label, issue.description);
    }

    if !result.is_valid {
        anyhow::bail!("Session {} failed integrity checks", id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use turnstore_core::Role;

    fn sqlite_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.backend = "sqlite".into();
        config.storage.data_dir = Some(dir.path().to_path_buf());
        config
    }

    async fn seeded(config: &Config) -> Session {
        let service = open_service(config).unwrap();
        let mut session = service
            .create_session("app", "u1", None, Some("s1".into()))
            .await
            .unwrap();
        for inv in ["inv1", "inv2"] {
            service
                .append_event(
                    &mut session,
                    Event::new(inv, "user")
                        .with_text(Role::User, format!("hello from {}", inv))
                        .with_state("last", inv),
                )
                .await
                .unwrap();
        }
        session
    }

    #[tokio::test]
    async fn test_rewind_through_cli_persists() {
        let dir = TempDir::new().unwrap();
        let config = sqlite_config(&dir);
        seeded(&config).await;

        handle(
            SessionAction::Rewind {
                app: "app".into(),
                user: "u1".into(),
                id: "s1".into(),
                before: "inv2".into(),
            },
            &config,
        )
        .await
        .unwrap();

        let service = open_service(&config).unwrap();
        let session = service
            .get_session("app", "u1", "s1", &GetSessionConfig::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.events.len(), 1);
        assert_eq!(session.state.get_str("last"), Some("inv1"));
    }

    #[tokio::test]
    async fn test_check_and_delete() {
        let dir = TempDir::new().unwrap();
        let config = sqlite_config(&dir);
        seeded(&config).await;

        let check = SessionAction::Check {
            app: "app".into(),
            user: "u1".into(),
            id: "s1".into(),
        };
        handle(check, &config).await.unwrap();

        let delete = SessionAction::Delete {
            app: "app".into(),
            user: "u1".into(),
            id: "s1".into(),
        };
        handle(delete, &config).await.unwrap();

        let service = open_service(&config).unwrap();
        assert!(service.list_sessions("app", "u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rewind_unknown_invocation_fails() {
        let dir = TempDir::new().unwrap();
        let config = sqlite_config(&dir);
        seeded(&config).await;

        let result = handle(
            SessionAction::Rewind {
                app: "app".into(),
                user: "u1".into(),
                id: "s1".into(),
                before: "missing".into(),
            },
            &config,
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_describe_event() {
        let event = Event::new("inv1", "user")
            .with_text(Role::User, "hi")
            .with_state("k", 1)
            .with_artifact_version("notes.txt", 2);
        let line = describe_event(&event);
        assert!(line.contains("user (inv1): hi"));
        assert!(line.contains("[state: k]"));
        assert!(line.contains("[notes.txt v2]"));
    }
}
