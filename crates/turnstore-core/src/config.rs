//! Configuration system for turnstore.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

/// Main configuration struct for turnstore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend settings
    pub storage: StorageConfig,
    /// Compaction cadence
    pub compaction: CompactionSettings,
    /// LLM summarizer settings
    pub summarizer: SummarizerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend: sqlite or memory
    pub backend: String,
    /// Overrides the default data directory
    pub data_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    /// Run compaction after completed invocations
    pub enabled: bool,
    /// Invocations between compactions
    pub interval: usize,
    /// Most recent invocations left out of each compaction
    pub overlap_size: usize,
    /// Upper bound on a single summarizer call
    pub summarizer_timeout_secs: u64,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 5,
            overlap_size: 2,
            summarizer_timeout_secs: 60,
        }
    }
}

impl CompactionSettings {
    pub fn summarizer_timeout(&self) -> Duration {
        Duration::from_secs(self.summarizer_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerSettings {
    /// Model to use for summarization (prefer fast/cheap models)
    pub model: String,
    /// Maximum tokens for the generated summary
    pub max_tokens: u32,
    /// Temperature for generation (lower = more focused)
    pub temperature: f32,
    /// System prompt for the summarizer
    pub system_prompt: String,
    /// Summaries longer than this are truncated
    pub max_summary_chars: usize,
}

impl Default for SummarizerSettings {
    fn default() -> Self {
        Self {
            model: "claude-haiku-3-5-20241022".to_string(),
            max_tokens: 1000,
            temperature: 0.3,
            system_prompt: "You are a precise summarizer. Create concise summaries that capture \
                            the essential information from conversations. Focus on: what was \
                            requested, what actions were taken, and the current state. Be factual \
                            and specific. Keep summaries under 500 words."
                .to_string(),
            max_summary_chars: 2000,
        }
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .collect()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    /// Field path (e.g., "compaction.interval")
    pub field: String,
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

const BACKENDS: [&str; 2] = ["sqlite", "memory"];

impl Config {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// The layered provider stack: defaults, user file, project files, environment.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(Self::config_dir().join("config.toml")))
            .merge(Toml::file(".turnstore/config.toml"))
            // Project local config (gitignored)
            .merge(Toml::file(".turnstore/config.local.toml"))
            .merge(Env::prefixed("TURNSTORE_").split("__"))
    }

    /// Load and validate configuration.
    pub fn load_validated() -> Result<Self, Error> {
        let config = Self::load().map_err(|e| Error::Config(e.to_string()))?;
        config.into_validated()
    }

    /// Validate an already-built configuration, logging warnings.
    pub fn into_validated(self) -> Result<Self, Error> {
        let result = self.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Config(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if !BACKENDS.contains(&self.storage.backend.as_str()) {
            result.add_error(
                "storage.backend",
                format!(
                    "Invalid backend '{}'. Valid values: {:?}",
                    self.storage.backend, BACKENDS
                ),
            );
        }

        if self.compaction.interval == 0 {
            result.add_error("compaction.interval", "interval must be greater than 0");
        }

        if self.compaction.overlap_size >= self.compaction.interval {
            result.add_error(
                "compaction.overlap_size",
                "overlap_size must be smaller than interval, or nothing is ever compacted",
            );
        }

        if self.compaction.summarizer_timeout_secs == 0 {
            result.add_error(
                "compaction.summarizer_timeout_secs",
                "summarizer_timeout_secs must be greater than 0",
            );
        }

        if self.summarizer.model.is_empty() {
            result.add_error("summarizer.model", "Model name cannot be empty");
        }

        if !(0.0..=1.0).contains(&self.summarizer.temperature) {
            result.add_warning(
                "summarizer.temperature",
                "temperature outside 0.0..=1.0 makes summaries less reliable",
            );
        }

        if self.summarizer.max_summary_chars < 100 {
            result.add_warning(
                "summarizer.max_summary_chars",
                "max_summary_chars below 100 truncates most summaries",
            );
        }

        result
    }

    /// Serialize to TOML for display.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("turnstore"))
            .unwrap_or_else(|| PathBuf::from("~/.config/turnstore"))
    }

    /// Get the data directory: the configured override, or the platform default.
    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|p| p.join("turnstore"))
                .unwrap_or_else(|| PathBuf::from("~/.local/share/turnstore"))
        })
    }
}
