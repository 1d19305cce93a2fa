//! # turnstore-session
//!
//! Session persistence for conversational agents.
//!
//! This crate provides:
//! - Session stores (in-memory and SQLite) holding an append-only event log
//!   with optimistic concurrency on `last_update_time`
//! - Shared `app:`/`user:` state partitions merged into every session's view
//! - Versioned artifact storage, session- or user-scoped
//! - Rewind to the point right before any invocation
//! - Compaction of old invocations into summaries through a pluggable summarizer
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use turnstore_core::{Event, GetSessionConfig};
//! use turnstore_session::SessionService;
//!
//! let service = SessionService::open_sqlite("/var/lib/myagent")?;
//! let mut session = service.create_session("app", "user-1", None, None).await?;
//!
//! service
//!     .append_event(&mut session, Event::new("inv-1", "user").with_state("topic", "rust"))
//!     .await?;
//!
//! // Undo the whole turn
//! let session = service.rewind("app", "user-1", &session.id, "inv-1").await?;
//! ```
//!
//! ## Storage Architecture
//!
//! The SQLite backend keeps everything in one `sessions.db`:
//! - `sessions`: session-scoped state, creation state and `last_update_time`
//! - `events`: one row per event, ordered by timestamp
//! - `app_states` / `user_states`: the shared partitions
//! - `artifacts`: one row per artifact version

pub mod artifact;
pub mod compaction;
pub mod context;
pub mod db;
pub mod error;
pub mod integrity;
pub mod rewind;
pub mod service;
pub mod state;
pub mod store;

// Re-export commonly used types
pub use artifact::{
    Artifact, ArtifactScope, ArtifactStore, InMemoryArtifactStore, SqliteArtifactStore,
};
pub use compaction::{
    CompactionConfig, CompactionWindow, Compactor, CompletionProvider, LlmEventSummarizer,
    LlmSummaryConfig, Summarizer, TranscriptSummarizer,
};
pub use context::{prepare_context, PreparedContext};
pub use db::Database;
pub use error::{Result, StoreError};
pub use integrity::{
    validate_artifacts, validate_session, IssueSeverity, ValidationIssue, ValidationResult,
};
pub use rewind::{plan_rewind, RewindEngine, RewindPlan};
pub use service::{AppSessions, SessionService};
pub use state::StatePartitions;
pub use store::{
    InMemorySessionStore, SessionRewrite, SessionStore, SqliteSessionStore, StoredHistory,
};
