//! SQLite-backed session storage.
//!
//! Sessions, events and the shared app/user partitions live in four tables of
//! `sessions.db`. Every write runs inside one transaction, so a failed append
//! or rewrite leaves no partial state behind.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use turnstore_core::{
    clock, state::merge_view, Event, GetSessionConfig, ScopedDelta, Session, SessionKey,
    SessionSummary, StateMap,
};

use super::{
    apply_to_snapshot, prepare_event, sequence_after, validate_identity, SessionRewrite,
    SessionStore, StoredHistory,
};
use crate::db::Database;
use crate::error::{check_staleness, Result, StoreError};

/// SQLite-backed session storage.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    /// Open (or create) the store under `base_dir`.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_database(Database::open(base_dir)?))
    }

    /// Use an already opened database, e.g. one shared with the artifact store.
    pub fn from_database(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn parse_state(json: &str) -> Result<StateMap> {
    Ok(serde_json::from_str(json)?)
}

fn read_app_state(tx: &rusqlite::Connection, app_name: &str) -> Result<StateMap> {
    let json: Option<String> = tx
        .query_row(
            "SELECT state FROM app_states WHERE app_name = ?1",
            params![app_name],
            |row| row.get(0),
        )
        .optional()?;
    json.map(|s| parse_state(&s))
        .transpose()
        .map(Option::unwrap_or_default)
}

fn read_user_state(tx: &rusqlite::Connection, app_name: &str, user_id: &str) -> Result<StateMap> {
    let json: Option<String> = tx
        .query_row(
            "SELECT state FROM user_states WHERE app_name = ?1 AND user_id = ?2",
            params![app_name, user_id],
            |row| row.get(0),
        )
        .optional()?;
    json.map(|s| parse_state(&s))
        .transpose()
        .map(Option::unwrap_or_default)
}

/// Merge the app and user parts of a routed delta into their tables.
fn write_partitions(
    tx: &Transaction<'_>,
    app_name: &str,
    user_id: &str,
    scoped: &ScopedDelta,
    now: i64,
) -> Result<()> {
    if !scoped.app.is_empty() {
        let mut app = read_app_state(tx, app_name)?;
        app.extend(scoped.app.clone());
        tx.execute(
            r#"
            INSERT INTO app_states (app_name, state, update_time) VALUES (?1, ?2, ?3)
            ON CONFLICT(app_name) DO UPDATE SET state = excluded.state, update_time = excluded.update_time
            "#,
            params![app_name, serde_json::to_string(&app)?, now],
        )?;
    }

    if !scoped.user.is_empty() {
        let mut user = read_user_state(tx, app_name, user_id)?;
        user.extend(scoped.user.clone());
        tx.execute(
            r#"
            INSERT INTO user_states (app_name, user_id, state, update_time) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(app_name, user_id) DO UPDATE SET state = excluded.state, update_time = excluded.update_time
            "#,
            params![app_name, user_id, serde_json::to_string(&user)?, now],
        )?;
    }

    Ok(())
}

fn read_events(conn: &rusqlite::Connection, key: &SessionKey) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT body FROM events
        WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
        ORDER BY timestamp, seq
        "#,
    )?;
    let bodies = stmt
        .query_map(params![key.app_name, key.user_id, key.session_id], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    bodies
        .iter()
        .map(|body| Ok(serde_json::from_str(body)?))
        .collect()
}

/// `(session state JSON, initial state JSON, last_update_time µs)` of a session row.
fn read_session_row(
    conn: &rusqlite::Connection,
    key: &SessionKey,
) -> Result<Option<(String, String, i64)>> {
    Ok(conn
        .query_row(
            r#"
            SELECT state, initial_state, last_update_time FROM sessions
            WHERE app_name = ?1 AND user_id = ?2 AND id = ?3
            "#,
            params![key.app_name, key.user_id, key.session_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?)
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
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
        let now = clock::now();
        let session_json = serde_json::to_string(&scoped.session)?;

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        if read_session_row(&tx, &key)?.is_some() {
            return Err(StoreError::AlreadyExists(key));
        }

        tx.execute(
            r#"
            INSERT INTO sessions (app_name, user_id, id, state, initial_state, created_at, last_update_time)
            VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?5)
            "#,
            params![app_name, user_id, session_id, session_json, now.timestamp_micros()],
        )?;
        write_partitions(&tx, app_name, user_id, &scoped, now.timestamp_micros())?;

        let merged = merge_view(
            &scoped.session,
            &read_app_state(&tx, app_name)?,
            &read_user_state(&tx, app_name, user_id)?,
        );
        tx.commit()?;

        tracing::info!(session = %key, "Created session");
        Ok(Session {
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
            id: session_id,
            state: merged.into(),
            events: Vec::new(),
            last_update_time: now,
        })
    }

    async fn get_session(
        &self,
        key: &SessionKey,
        config: &GetSessionConfig,
    ) -> Result<Option<Session>> {
        let conn = self.db.lock();

        let Some((state_json, _, last_update)) = read_session_row(&conn, key)? else {
            return Ok(None);
        };

        let events = config.apply(read_events(&conn, key)?);
        let merged = merge_view(
            &parse_state(&state_json)?,
            &read_app_state(&conn, &key.app_name)?,
            &read_user_state(&conn, &key.app_name, &key.user_id)?,
        );

        Ok(Some(Session {
            app_name: key.app_name.clone(),
            user_id: key.user_id.clone(),
            id: key.session_id.clone(),
            state: merged.into(),
            events,
            last_update_time: clock::from_micros(last_update),
        }))
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<SessionSummary>> {
        let conn = self.db.lock();

        let mut stmt = conn.prepare(
            r#"
            SELECT s.id, s.last_update_time,
                   (SELECT COUNT(*) FROM events e
                    WHERE e.app_name = s.app_name AND e.user_id = s.user_id AND e.session_id = s.id)
            FROM sessions s
            WHERE s.app_name = ?1 AND s.user_id = ?2
            ORDER BY s.last_update_time DESC
            "#,
        )?;

        let rows = stmt.query_map(params![app_name, user_id], |row| {
            Ok(SessionSummary {
                app_name: app_name.to_string(),
                user_id: user_id.to_string(),
                id: row.get(0)?,
                last_update_time: clock::from_micros(row.get(1)?),
                event_count: row.get::<_, i64>(2)? as usize,
            })
        })?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn delete_session(&self, key: &SessionKey) -> Result<()> {
        let conn = self.db.lock();

        // Events go with the session through ON DELETE CASCADE
        let rows = conn.execute(
            "DELETE FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
            params![key.app_name, key.user_id, key.session_id],
        )?;

        if rows == 0 {
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

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let (state_json, _, stored_micros) = read_session_row(&tx, &key)?
            .ok_or_else(|| StoreError::SessionNotFound(key.clone()))?;
        let stored_time = clock::from_micros(stored_micros);
        check_staleness(&key, session.last_update_time, stored_time)?;

        let (last_timestamp, duplicate): (Option<i64>, i64) = tx.query_row(
            r#"
            SELECT MAX(timestamp), COALESCE(SUM(id = ?4), 0) FROM events
            WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
            "#,
            params![key.app_name, key.user_id, key.session_id, event.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        sequence_after(&mut event, last_timestamp.map(clock::from_micros));
        if duplicate > 0 {
            return Err(StoreError::Validation(format!(
                "event {} already exists in {}",
                event.id, key
            )));
        }

        let new_time = clock::advance(stored_time);
        let scoped = ScopedDelta::split(&event.actions.state_delta);
        write_partitions(&tx, &key.app_name, &key.user_id, &scoped, new_time.timestamp_micros())?;

        let mut session_state = parse_state(&state_json)?;
        session_state.extend(scoped.session);

        tx.execute(
            r#"
            INSERT INTO events (id, app_name, user_id, session_id, invocation_id, author, timestamp, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                event.id,
                key.app_name,
                key.user_id,
                key.session_id,
                event.invocation_id,
                event.author,
                event.timestamp.timestamp_micros(),
                serde_json::to_string(&event)?,
            ],
        )?;

        tx.execute(
            r#"
            UPDATE sessions SET state = ?4, last_update_time = ?5
            WHERE app_name = ?1 AND user_id = ?2 AND id = ?3
            "#,
            params![
                key.app_name,
                key.user_id,
                key.session_id,
                serde_json::to_string(&session_state)?,
                new_time.timestamp_micros(),
            ],
        )?;

        tx.commit()?;
        drop(conn);

        tracing::debug!(session = %key, event = %event.id, "Appended event");
        apply_to_snapshot(session, &event, new_time);
        Ok(event)
    }

    async fn load_history(&self, key: &SessionKey) -> Result<Option<StoredHistory>> {
        let conn = self.db.lock();

        let Some((_, initial_json, last_update)) = read_session_row(&conn, key)? else {
            return Ok(None);
        };

        Ok(Some(StoredHistory {
            events: read_events(&conn, key)?,
            initial_state: parse_state(&initial_json)?,
            last_update_time: clock::from_micros(last_update),
        }))
    }

    async fn rewrite_session(
        &self,
        key: &SessionKey,
        rewrite: SessionRewrite,
    ) -> Result<DateTime<Utc>> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let (_, _, stored_micros) = read_session_row(&tx, key)?
            .ok_or_else(|| StoreError::SessionNotFound(key.clone()))?;
        let stored_time = clock::from_micros(stored_micros);
        if stored_time != rewrite.expected_last_update_time {
            return Err(StoreError::StaleSession {
                key: key.clone(),
                snapshot: rewrite.expected_last_update_time,
                stored: stored_time,
            });
        }

        // LIMIT -1 OFFSET n selects everything after the first n events
        let dropped = tx.execute(
            r#"
            DELETE FROM events WHERE seq IN (
                SELECT seq FROM events
                WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
                ORDER BY timestamp, seq
                LIMIT -1 OFFSET ?4
            )
            "#,
            params![
                key.app_name,
                key.user_id,
                key.session_id,
                rewrite.keep_events as i64
            ],
        )?;

        let new_time = clock::advance(stored_time);
        tx.execute(
            r#"
            UPDATE sessions SET state = ?4, last_update_time = ?5
            WHERE app_name = ?1 AND user_id = ?2 AND id = ?3
            "#,
            params![
                key.app_name,
                key.user_id,
                key.session_id,
                serde_json::to_string(&rewrite.session_state)?,
                new_time.timestamp_micros(),
            ],
        )?;

        tx.commit()?;
        tracing::debug!(session = %key, dropped, "Rewrote session log");
        Ok(new_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (SqliteSessionStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteSessionStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let (store, _tmp) = create_test_store();

        let mut initial = StateMap::new();
        initial.insert("k".into(), json!("v0"));
        initial.insert("user:name".into(), json!("ada"));
        let session = store
            .create_session("app", "u", Some(initial), Some("s1".into()))
            .await
            .unwrap();
        assert_eq!(session.id, "s1");

        let retrieved = store
            .get_session(&session.key(), &GetSessionConfig::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retrieved.state.get("k"), Some(&json!("v0")));
        assert_eq!(retrieved.state.get("user:name"), Some(&json!("ada")));
        assert_eq!(retrieved.last_update_time, session.last_update_time);
    }

    #[tokio::test]
    async fn test_append_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let key = {
            let store = SqliteSessionStore::open(temp_dir.path()).unwrap();
            let mut session = store.create_session("app", "u", None, None).await.unwrap();
            store
                .append_event(&mut session, Event::new("inv-1", "user").with_state("k", 1))
                .await
                .unwrap();
            session.key()
        };

        let store = SqliteSessionStore::open(temp_dir.path()).unwrap();
        let session = store
            .get_session(&key, &GetSessionConfig::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.events.len(), 1);
        assert_eq!(session.state.get("k"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let (store, _tmp) = create_test_store();

        store.create_session("app", "u", None, None).await.unwrap();
        store.create_session("app", "u", None, None).await.unwrap();
        store.create_session("app", "other", None, None).await.unwrap();

        let sessions = store.list_sessions("app", "u").await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.event_count == 0));
    }

    #[tokio::test]
    async fn test_delete_session_cascades_events() {
        let (store, _tmp) = create_test_store();

        let mut session = store.create_session("app", "u", None, None).await.unwrap();
        store
            .append_event(&mut session, Event::new("inv", "user"))
            .await
            .unwrap();
        store.delete_session(&session.key()).await.unwrap();

        let remaining: i64 = store
            .database()
            .lock()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);

        let err = store.delete_session(&session.key()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_event_id_rejected() {
        let (store, _tmp) = create_test_store();

        let mut session = store.create_session("app", "u", None, None).await.unwrap();
        let event = Event::new("inv", "user");
        store.append_event(&mut session, event.clone()).await.unwrap();

        let err = store.append_event(&mut session, event).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_rewrite_keeps_prefix() {
        let (store, _tmp) = create_test_store();

        let mut session = store.create_session("app", "u", None, None).await.unwrap();
        for i in 0..4 {
            store
                .append_event(&mut session, Event::new(format!("inv-{}", i), "user"))
                .await
                .unwrap();
        }

        let new_time = store
            .rewrite_session(
                &session.key(),
                SessionRewrite {
                    keep_events: 1,
                    session_state: StateMap::new(),
                    expected_last_update_time: session.last_update_time,
                },
            )
            .await
            .unwrap();
        assert!(new_time > session.last_update_time);

        let history = store.load_history(&session.key()).await.unwrap().unwrap();
        assert_eq!(history.events.len(), 1);
        assert_eq!(history.events[0].invocation_id, "inv-0");
    }
}
