//! Event log compaction and summarization.
//!
//! Once enough invocations have accumulated since the last compaction, the
//! oldest of them (all but the most recent `overlap_size`) are handed to a
//! [`Summarizer`]. The summary comes back as a compaction event that is
//! appended to the log like any other event. The summarized events stay in
//! the log; the compaction event only declares the span it stands in for.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use turnstore_core::config::{CompactionSettings, SummarizerSettings};
use turnstore_core::{Content, Event, Part, Role, Session};

use crate::error::{Result, StoreError};
use crate::store::SessionStore;

/// Author recorded on compaction events produced by the built-in summarizers.
pub const COMPACTION_AUTHOR: &str = "compactor";

/// Configuration for the compactor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// New invocations needed before a compaction runs.
    pub compaction_interval: usize,
    /// Most recent invocations left out of each compaction.
    pub overlap_size: usize,
    /// Upper bound on one summarizer call.
    pub summarizer_timeout: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            compaction_interval: 5,
            overlap_size: 2,
            summarizer_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&CompactionSettings> for CompactionConfig {
    fn from(settings: &CompactionSettings) -> Self {
        Self {
            compaction_interval: settings.interval,
            overlap_size: settings.overlap_size,
            summarizer_timeout: settings.summarizer_timeout(),
        }
    }
}

/// Turns a span of events into a compaction event.
///
/// Implementations must not touch the store; the compactor appends whatever
/// they return.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `events`, or return `None` when there is nothing worth keeping.
    async fn maybe_summarize_events(&self, events: &[Event]) -> anyhow::Result<Option<Event>>;
}

/// The span selected for one compaction.
#[derive(Debug, Clone)]
pub struct CompactionWindow {
    /// Invocations in the span, oldest first
    pub invocation_ids: Vec<String>,
    /// Their events in log order, compaction events excluded
    pub events: Vec<Event>,
}

impl CompactionWindow {
    pub fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.events.first().map(|e| e.timestamp)
    }

    pub fn end_timestamp(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.timestamp)
    }
}

/// Pick the span to compact, if the log is due for compaction.
///
/// An invocation counts as new when its first event comes after the end of
/// the latest compaction. When at least `compaction_interval` invocations are
/// new, all of them except the last `overlap_size` form the window.
pub fn select_window(events: &[Event], config: &CompactionConfig) -> Option<CompactionWindow> {
    if config.compaction_interval == 0 {
        return None;
    }

    let last_end = events
        .iter()
        .filter_map(|e| e.actions.compaction.as_ref())
        .map(|c| c.end_timestamp)
        .max();

    let mut seen = HashSet::new();
    let new_invocations: Vec<&str> = events
        .iter()
        .filter(|e| !e.is_compaction())
        .filter(|e| seen.insert(e.invocation_id.as_str()))
        .filter(|e| last_end.map_or(true, |end| e.timestamp > end))
        .map(|e| e.invocation_id.as_str())
        .collect();

    if new_invocations.len() < config.compaction_interval {
        return None;
    }

    let span_len = new_invocations.len().saturating_sub(config.overlap_size);
    if span_len == 0 {
        return None;
    }
    let span: HashSet<&str> = new_invocations[..span_len].iter().copied().collect();

    let window_events: Vec<Event> = events
        .iter()
        .filter(|e| !e.is_compaction() && span.contains(e.invocation_id.as_str()))
        .cloned()
        .collect();

    Some(CompactionWindow {
        invocation_ids: new_invocations[..span_len]
            .iter()
            .map(|id| id.to_string())
            .collect(),
        events: window_events,
    })
}

/// Runs compaction for sessions.
pub struct Compactor {
    config: CompactionConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl Compactor {
    pub fn new(config: CompactionConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { config, summarizer }
    }

    /// Get the compaction configuration.
    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn select_window(&self, events: &[Event]) -> Option<CompactionWindow> {
        select_window(events, &self.config)
    }

    /// Ask the summarizer for a compaction event.
    ///
    /// Failures and timeouts yield `None`: compaction is best effort.
    pub async fn summarize(&self, window: &CompactionWindow) -> Option<Event> {
        let call = self.summarizer.maybe_summarize_events(&window.events);
        match tokio::time::timeout(self.config.summarizer_timeout, call).await {
            Ok(Ok(Some(event))) if event.is_compaction() => Some(event),
            Ok(Ok(Some(event))) => {
                tracing::warn!(
                    event = %event.id,
                    "Summarizer returned an event without compaction data"
                );
                None
            }
            Ok(Ok(None)) => {
                tracing::debug!(
                    invocations = window.invocation_ids.len(),
                    "Summarizer produced nothing"
                );
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Summarizer failed; skipping compaction");
                None
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.config.summarizer_timeout.as_secs_f64(),
                    "Summarizer timed out; skipping compaction"
                );
                None
            }
        }
    }

    /// Compact `session` if it is due, appending the summary through `store`.
    ///
    /// The window is chosen from the full stored log, so `session` may be a
    /// filtered view. On success `session` reflects the appended event.
    pub async fn maybe_compact(
        &self,
        store: &dyn SessionStore,
        session: &mut Session,
    ) -> Result<Option<Event>> {
        let key = session.key();
        let history = store
            .load_history(&key)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(key.clone()))?;

        let Some(window) = self.select_window(&history.events) else {
            return Ok(None);
        };
        let Some(event) = self.summarize(&window).await else {
            return Ok(None);
        };

        let event = store.append_event(session, event).await?;
        tracing::info!(
            session = %key,
            invocations = window.invocation_ids.len(),
            events = window.events.len(),
            "Compacted session history"
        );
        Ok(Some(event))
    }
}

/// Char-boundary-safe truncation with a trailing ellipsis.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Model => "Assistant",
        Role::System => "System",
        Role::Tool => "Tool Result",
    }
}

/// Brief summary of call arguments: their first few keys.
fn summarize_args(args: &serde_json::Value) -> String {
    match args {
        serde_json::Value::Object(obj) => {
            let keys: Vec<&str> = obj.keys().map(|s| s.as_str()).take(3).collect();
            format!("({})", keys.join(", "))
        }
        _ => "()".to_string(),
    }
}

/// One transcript line per content part.
fn transcript_lines(event: &Event) -> Vec<String> {
    let Some(content) = &event.content else {
        return Vec::new();
    };
    let label = role_label(content.role);
    content
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text } if !text.trim().is_empty() => {
                Some(format!("{} ({}): {}", label, event.author, text.trim()))
            }
            Part::Text { .. } => None,
            Part::FunctionCall { name, args, .. } => Some(format!(
                "{} ({}) called {}{}",
                label,
                event.author,
                name,
                summarize_args(args)
            )),
            Part::FunctionResponse { name, .. } => {
                Some(format!("{} ({}): result of {}", label, event.author, name))
            }
        })
        .collect()
}

fn compaction_event(events: &[Event], summary: String) -> Option<Event> {
    let (first, last) = (events.first()?, events.last()?);
    Some(Event::compaction(
        COMPACTION_AUTHOR,
        first.timestamp,
        last.timestamp,
        Content::text(Role::Model, summary),
    ))
}

/// A summarizer that needs no model: it keeps a trimmed transcript of the span.
pub struct TranscriptSummarizer {
    max_chars: usize,
}

impl TranscriptSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Default for TranscriptSummarizer {
    fn default() -> Self {
        Self::new(2000)
    }
}

#[async_trait]
impl Summarizer for TranscriptSummarizer {
    async fn maybe_summarize_events(&self, events: &[Event]) -> anyhow::Result<Option<Event>> {
        let transcript: Vec<String> = events.iter().flat_map(transcript_lines).collect();
        if transcript.is_empty() {
            return Ok(None);
        }
        let summary = truncate_chars(&transcript.join("\n"), self.max_chars);
        Ok(compaction_event(events, summary))
    }
}

/// Configuration for LLM-based summary generation.
#[derive(Debug, Clone)]
pub struct LlmSummaryConfig {
    /// Model to use for summarization (prefer fast/cheap models)
    pub model: String,
    /// Maximum tokens for the generated summary
    pub max_tokens: u32,
    /// Temperature for generation (lower = more focused)
    pub temperature: f32,
    /// System prompt for the summarizer
    pub system_prompt: String,
    /// Summaries longer than this are cut
    pub max_summary_chars: usize,
}

impl Default for LlmSummaryConfig {
    fn default() -> Self {
        Self::from(&SummarizerSettings::default())
    }
}

impl From<&SummarizerSettings> for LlmSummaryConfig {
    fn from(settings: &SummarizerSettings) -> Self {
        Self {
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            system_prompt: settings.system_prompt.clone(),
            max_summary_chars: settings.max_summary_chars,
        }
    }
}

/// Trait alias for providers that support completion.
pub trait CompletionProvider: Send + Sync {
    /// Generate a completion for the given prompt.
    fn complete_for_summary(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>>;
}

/// Build the prompt asking a model to summarize `events`.
pub fn build_summary_prompt(events: &[Event]) -> String {
    let mut prompt_parts = vec![
        "Summarize the following conversation concisely, focusing on:
1. What the user wanted to accomplish
2. What actions were taken
3. The current state/outcome

Keep the summary under 500 words. Be factual and specific."
            .to_string(),
        "\n## Conversation to Summarize".to_string(),
    ];

    for event in events {
        for line in transcript_lines(event) {
            prompt_parts.push(format!("\n{}", truncate_chars(&line, 500)));
        }
    }

    let state_keys: Vec<&str> = events
        .iter()
        .flat_map(|e| e.actions.state_delta.keys())
        .map(|k| k.as_str())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    if !state_keys.is_empty() {
        prompt_parts.push("\n## State Updated".to_string());
        for key in state_keys {
            prompt_parts.push(format!("- {}", key));
        }
    }

    prompt_parts.join("\n")
}

/// Summarizer backed by a language model.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use turnstore_session::compaction::{LlmEventSummarizer, LlmSummaryConfig};
///
/// let summarizer = LlmEventSummarizer::new(Arc::new(my_provider), LlmSummaryConfig::default());
/// ```
pub struct LlmEventSummarizer<P> {
    provider: Arc<P>,
    config: LlmSummaryConfig,
}

impl<P> LlmEventSummarizer<P> {
    pub fn new(provider: Arc<P>, config: LlmSummaryConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl<P: CompletionProvider> Summarizer for LlmEventSummarizer<P> {
    async fn maybe_summarize_events(&self, events: &[Event]) -> anyhow::Result<Option<Event>> {
        if events.is_empty() {
            return Ok(None);
        }
        let prompt = build_summary_prompt(events);

        let response = self
            .provider
            .complete_for_summary(
                &self.config.model,
                &self.config.system_prompt,
                &prompt,
                self.config.max_tokens,
                self.config.temperature,
            )
            .await?;

        let response = response.trim();
        if response.is_empty() {
            return Ok(None);
        }
        let summary = truncate_chars(response, self.config.max_summary_chars);
        Ok(compaction_event(events, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;
    use turnstore_core::{clock, GetSessionConfig};

    use crate::store::InMemorySessionStore;

    /// Two events per invocation, one second apart.
    fn invocation_log(count: usize) -> Vec<Event> {
        let base = clock::now();
        (0..count)
            .flat_map(|i| {
                let inv = format!("inv{}", i + 1);
                let at = base + ChronoDuration::seconds(2 * i as i64);
                vec![
                    Event::new(&inv, "user")
                        .with_text(Role::User, format!("question {}", i + 1))
                        .with_timestamp(at),
                    Event::new(&inv, "agent")
                        .with_text(Role::Model, format!("answer {}", i + 1))
                        .with_timestamp(at + ChronoDuration::seconds(1))
                        .finish_turn(),
                ]
            })
            .collect()
    }

    fn config() -> CompactionConfig {
        CompactionConfig {
            compaction_interval: 5,
            overlap_size: 2,
            summarizer_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_no_window_below_interval() {
        assert!(select_window(&invocation_log(4), &config()).is_none());
    }

    #[test]
    fn test_window_holds_back_overlap() {
        let window = select_window(&invocation_log(5), &config()).unwrap();
        assert_eq!(window.invocation_ids, vec!["inv1", "inv2", "inv3"]);
        assert_eq!(window.events.len(), 6);
    }

    #[test]
    fn test_window_starts_after_last_compaction() {
        let mut events = invocation_log(5);
        let window = select_window(&events, &config()).unwrap();
        events.push(Event::compaction(
            COMPACTION_AUTHOR,
            window.start_timestamp().unwrap(),
            window.end_timestamp().unwrap(),
            Content::text(Role::Model, "summary"),
        ));
        assert!(select_window(&events, &config()).is_none());

        // inv4 and inv5 plus three more make five new invocations
        let later = invocation_log(8).split_off(10);
        let shift = events[9].timestamp - later[0].timestamp + ChronoDuration::seconds(10);
        events.extend(later.into_iter().map(|e| {
            let at = e.timestamp + shift;
            e.with_timestamp(at)
        }));

        let window = select_window(&events, &config()).unwrap();
        assert_eq!(window.invocation_ids, vec!["inv4", "inv5", "inv6"]);
    }

    #[test]
    fn test_zero_overlap_compacts_everything_new() {
        let config = CompactionConfig {
            compaction_interval: 2,
            overlap_size: 0,
            ..config()
        };
        let window = select_window(&invocation_log(2), &config).unwrap();
        assert_eq!(window.invocation_ids.len(), 2);
    }

    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Summarizer for Recording {
        async fn maybe_summarize_events(&self, events: &[Event]) -> anyhow::Result<Option<Event>> {
            self.seen
                .lock()
                .extend(events.iter().map(|e| e.invocation_id.clone()));
            TranscriptSummarizer::default().maybe_summarize_events(events).await
        }
    }

    #[tokio::test]
    async fn test_maybe_compact_appends_summary() {
        let store = InMemorySessionStore::new();
        let summarizer = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
        });
        let compactor = Compactor::new(config(), summarizer.clone());

        let mut session = store.create_session("app", "u", None, None).await.unwrap();
        for event in invocation_log(5) {
            store.append_event(&mut session, event).await.unwrap();
        }

        let summary = compactor
            .maybe_compact(&store, &mut session)
            .await
            .unwrap()
            .unwrap();
        let compaction = summary.actions.compaction.as_ref().unwrap();
        assert!(compaction.summarized_content.as_text().contains("question 1"));
        assert!(!compaction.summarized_content.as_text().contains("question 4"));

        let seen = summarizer.seen.lock().clone();
        assert!(seen.iter().all(|id| ["inv1", "inv2", "inv3"].contains(&id.as_str())));

        // Raw events stay retrievable
        let stored = store
            .get_session(&session.key(), &GetSessionConfig::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.events.len(), 11);
        assert_eq!(session.last_update_time, stored.last_update_time);

        // Nothing new to compact
        assert!(compactor
            .maybe_compact(&store, &mut session)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_tied_timestamps_keep_overlap_uncompacted() {
        let store = InMemorySessionStore::new();
        let config = CompactionConfig {
            compaction_interval: 2,
            overlap_size: 1,
            ..config()
        };
        let compactor = Compactor::new(config, Arc::new(TranscriptSummarizer::default()));
        let mut session = store.create_session("app", "u", None, None).await.unwrap();

        // Every event stamped in the same microsecond
        let at = clock::now();
        let turn = |inv: &str, q: &str, a: &str| {
            vec![
                Event::new(inv, "user")
                    .with_text(Role::User, q)
                    .with_timestamp(at),
                Event::new(inv, "agent")
                    .with_text(Role::Model, a)
                    .with_timestamp(at)
                    .finish_turn(),
            ]
        };
        for event in turn("inv1", "q1", "a1").into_iter().chain(turn("inv2", "q2", "a2")) {
            store.append_event(&mut session, event).await.unwrap();
        }

        let summary = compactor
            .maybe_compact(&store, &mut session)
            .await
            .unwrap()
            .unwrap();
        let text = summary
            .actions
            .compaction
            .as_ref()
            .unwrap()
            .summarized_content
            .as_text();
        assert!(text.contains("q1"));
        assert!(!text.contains("q2"));

        let history = store.load_history(&session.key()).await.unwrap().unwrap();
        let visible: Vec<String> = crate::context::prepare_context(&history.events)
            .events
            .iter()
            .filter_map(|e| e.text())
            .collect();
        assert_eq!(visible.len(), 3);
        assert_eq!(visible[1..], ["q2".to_string(), "a2".to_string()]);

        // inv2 was held back, so it still counts toward the next compaction
        for event in turn("inv3", "q3", "a3") {
            store.append_event(&mut session, event).await.unwrap();
        }
        let history = store.load_history(&session.key()).await.unwrap().unwrap();
        let window = compactor.select_window(&history.events).unwrap();
        assert_eq!(window.invocation_ids, vec!["inv2"]);
    }

    struct Failing;

    #[async_trait]
    impl Summarizer for Failing {
        async fn maybe_summarize_events(&self, _events: &[Event]) -> anyhow::Result<Option<Event>> {
            anyhow::bail!("model unavailable")
        }
    }

    struct Slow;

    #[async_trait]
    impl Summarizer for Slow {
        async fn maybe_summarize_events(&self, events: &[Event]) -> anyhow::Result<Option<Event>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            TranscriptSummarizer::default().maybe_summarize_events(events).await
        }
    }

    #[tokio::test]
    async fn test_summarizer_failure_is_not_an_error() {
        let window = select_window(&invocation_log(5), &config()).unwrap();
        let compactor = Compactor::new(config(), Arc::new(Failing));
        assert!(compactor.summarize(&window).await.is_none());
    }

    #[tokio::test]
    async fn test_summarizer_timeout() {
        let window = select_window(&invocation_log(5), &config()).unwrap();
        let config = CompactionConfig {
            summarizer_timeout: Duration::from_millis(20),
            ..config()
        };
        let compactor = Compactor::new(config, Arc::new(Slow));
        assert!(compactor.summarize(&window).await.is_none());
    }

    #[tokio::test]
    async fn test_transcript_summarizer_skips_empty_text() {
        let events = vec![
            Event::new("inv", "user").with_text(Role::User, "   "),
            Event::new("inv", "agent"),
        ];
        let result = TranscriptSummarizer::default()
            .maybe_summarize_events(&events)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    struct FixedProvider(String);

    impl CompletionProvider for FixedProvider {
        fn complete_for_summary(
            &self,
            _model: &str,
            _system: &str,
            _prompt: &str,
            _max_tokens: u32,
            _temperature: f32,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
            let response = self.0.clone();
            Box::pin(async move { Ok(response) })
        }
    }

    #[tokio::test]
    async fn test_llm_summarizer_whitespace_output() {
        let summarizer = LlmEventSummarizer::new(
            Arc::new(FixedProvider(" \n ".into())),
            LlmSummaryConfig::default(),
        );
        let result = summarizer
            .maybe_summarize_events(&invocation_log(1))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_llm_summarizer_truncates_long_output() {
        let config = LlmSummaryConfig {
            max_summary_chars: 10,
            ..Default::default()
        };
        let summarizer = LlmEventSummarizer::new(Arc::new(FixedProvider("é".repeat(50))), config);
        let events = invocation_log(2);
        let event = summarizer
            .maybe_summarize_events(&events)
            .await
            .unwrap()
            .unwrap();

        let compaction = event.actions.compaction.unwrap();
        assert_eq!(compaction.summarized_content.as_text().chars().count(), 10);
        assert_eq!(compaction.start_timestamp, events[0].timestamp);
        assert_eq!(compaction.end_timestamp, events[3].timestamp);
    }

    #[test]
    fn test_build_summary_prompt() {
        let events = vec![
            Event::new("inv", "user").with_text(Role::User, "book a flight"),
            Event::new("inv", "agent")
                .with_content(Content {
                    role: Role::Model,
                    parts: vec![Part::FunctionCall {
                        id: "c1".into(),
                        name: "search_flights".into(),
                        args: serde_json::json!({"from": "SFO", "to": "JFK"}),
                    }],
                })
                .with_state("destination", "JFK"),
        ];

        let prompt = build_summary_prompt(&events);
        assert!(prompt.contains("Summarize"));
        assert!(prompt.contains("User (user): book a flight"));
        assert!(prompt.contains("called search_flights(from, to)"));
        assert!(prompt.contains("- destination"));
    }
}
