//! # turnstore-core
//!
//! Core types and abstractions for turnstore, the session persistence engine
//! for conversational agents.
//!
//! This crate provides:
//! - Events, their actions (state/artifact deltas, compaction markers) and content
//! - Sessions, session keys and read filters
//! - Scoped state keys (`app:`, `user:`, `temp:`) and the merged state view
//! - Configuration system
//! - Common error types

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Content, Event, EventActions, EventCompaction, Part, Role};
pub use session::{GetSessionConfig, Session, SessionKey, SessionSummary};
pub use state::{Scope, ScopeKey, ScopedDelta, State, StateMap};
