//! CLI command implementations.

use chrono::{DateTime, Local, Utc};

use turnstore_core::Config;
use turnstore_session::SessionService;

pub mod artifact;
pub mod config;
pub mod session;

/// Open the configured stores.
pub(crate) fn open_service(config: &Config) -> anyhow::Result<SessionService> {
    if config.storage.backend == "memory" {
        tracing::warn!("storage.backend is 'memory'; nothing persisted will be visible");
    }
    let service = SessionService::from_config(config, None)?;
    tracing::debug!(data_dir = %config.data_dir().display(), "Opened session store");
    Ok(service)
}

/// Format a datetime for display.
pub(crate) fn format_time(dt: &DateTime<Utc>) -> String {
    let local: DateTime<Local> = dt.with_timezone(&Local);
    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Shorten `text` to at most `max` characters for one-line previews.
pub(crate) fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > max {
        let cut: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else if line.len() < text.len() {
        format!("{}...", line)
    } else {
        line.to_string()
    }
}
