//! Compaction-aware history for agents.
//!
//! Compaction never deletes events, so a session's log holds both the raw
//! events and the summaries standing in for them. [`prepare_context`] builds
//! the history an agent should actually see: each summarized span collapses
//! into its summary, placed where the span began.

use serde::{Deserialize, Serialize};

use turnstore_core::{Event, EventCompaction};

/// Average characters per token, for estimates.
const CHARS_PER_TOKEN: f32 = 4.0;

/// History prepared for an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreparedContext {
    /// Events to include, in order.
    pub events: Vec<Event>,
    /// Number of raw events replaced by summaries.
    pub compacted_events: usize,
    /// Token count estimate.
    pub estimated_tokens: u32,
}

/// Whether `outer` covers all of `inner`.
fn subsumes(outer: &EventCompaction, inner: &EventCompaction) -> bool {
    outer.start_timestamp <= inner.start_timestamp && inner.end_timestamp <= outer.end_timestamp
}

/// Rough token estimate for an event's text.
pub fn estimate_tokens(event: &Event) -> u32 {
    let chars = event.text().map(|t| t.chars().count()).unwrap_or(0) as f32;
    (chars / CHARS_PER_TOKEN) as u32
}

/// Replace summarized spans of `events` with their summaries.
///
/// A compaction whose range lies inside a later or wider compaction is
/// dropped in favour of the wider one.
pub fn prepare_context(events: &[Event]) -> PreparedContext {
    let compactions: Vec<(usize, &EventCompaction)> = events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| e.actions.compaction.as_ref().map(|c| (i, c)))
        .collect();

    let active: Vec<(usize, &EventCompaction)> = compactions
        .iter()
        .filter(|(i, c)| {
            !compactions.iter().any(|(j, other)| {
                j != i && subsumes(other, c) && (!subsumes(c, other) || j > i)
            })
        })
        .copied()
        .collect();

    // (position timestamp, log index, event)
    let mut ordered: Vec<(chrono::DateTime<chrono::Utc>, usize, Event)> = Vec::new();
    let mut compacted_events = 0;

    for (i, event) in events.iter().enumerate() {
        if event.is_compaction() {
            continue;
        }
        if active.iter().any(|(_, c)| c.covers(event.timestamp)) {
            compacted_events += 1;
        } else {
            ordered.push((event.timestamp, i, event.clone()));
        }
    }

    for (i, compaction) in &active {
        let mut summary = events[*i].clone();
        if summary.content.is_none() {
            summary.content = Some(compaction.summarized_content.clone());
        }
        ordered.push((compaction.start_timestamp, *i, summary));
    }

    ordered.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    let events: Vec<Event> = ordered.into_iter().map(|(_, _, e)| e).collect();
    let estimated_tokens = events.iter().map(estimate_tokens).sum();

    PreparedContext {
        events,
        compacted_events,
        estimated_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use turnstore_core::{clock, Content, Role};

    fn log(count: i64) -> Vec<Event> {
        let base = clock::now();
        (0..count)
            .map(|i| {
                Event::new(format!("inv{}", i), "user")
                    .with_text(Role::User, format!("message {}", i))
                    .with_timestamp(base + Duration::seconds(i))
            })
            .collect()
    }

    fn summary(events: &[Event], from: usize, to: usize, text: &str) -> Event {
        Event::compaction(
            "compactor",
            events[from].timestamp,
            events[to].timestamp,
            Content::text(Role::Model, text),
        )
        .with_timestamp(events[events.len() - 1].timestamp)
    }

    #[test]
    fn test_no_compaction_keeps_everything() {
        let events = log(3);
        let context = prepare_context(&events);
        assert_eq!(context.events.len(), 3);
        assert_eq!(context.compacted_events, 0);
    }

    #[test]
    fn test_summary_replaces_span() {
        let mut events = log(5);
        let compaction = summary(&events, 0, 2, "first three");
        events.push(compaction);

        let context = prepare_context(&events);
        assert_eq!(context.compacted_events, 3);
        let texts: Vec<String> = context.events.iter().filter_map(|e| e.text()).collect();
        assert_eq!(texts, vec!["first three", "message 3", "message 4"]);
    }

    #[test]
    fn test_wider_compaction_subsumes_narrower() {
        let mut events = log(6);
        let narrow = summary(&events, 0, 1, "narrow");
        let wide = summary(&events, 0, 3, "wide");
        events.push(narrow);
        events.push(wide);

        let context = prepare_context(&events);
        let texts: Vec<String> = context.events.iter().filter_map(|e| e.text()).collect();
        assert_eq!(texts, vec!["wide", "message 4", "message 5"]);
        assert_eq!(context.compacted_events, 4);
    }

    #[test]
    fn test_disjoint_compactions_both_apply() {
        let mut events = log(6);
        let first = summary(&events, 0, 1, "a");
        let second = summary(&events, 2, 3, "b");
        events.push(first);
        events.push(second);

        let texts: Vec<String> = prepare_context(&events)
            .events
            .iter()
            .filter_map(|e| e.text())
            .collect();
        assert_eq!(texts, vec!["a", "b", "message 4", "message 5"]);
    }

    #[test]
    fn test_token_estimate() {
        let event = Event::new("inv", "user").with_text(Role::User, "abcdefgh");
        assert_eq!(estimate_tokens(&event), 2);
        assert_eq!(estimate_tokens(&Event::new("inv", "user")), 0);
    }
}
