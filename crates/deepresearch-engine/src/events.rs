//! Progress event bus.
//!
//! Every stage transition emits one [`ProgressEvent`] on a one-directional
//! channel. Observers only read; nothing on this channel feeds back into
//! control flow, and the channel closes when the engine drops its collector.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Stage names visible to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Clarify,
    Brief,
    Research,
    Report,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStage::Clarify => "clarify",
            ProgressStage::Brief => "brief",
            ProgressStage::Research => "research",
            ProgressStage::Report => "report",
        }
    }
}

/// Snapshot of whatever the emitting stage produced. Every field is optional
/// and observers must tolerate any of them being absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification_question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_brief: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_report: Option<String>,
}

impl PartialState {
    pub fn phase(phase: impl Into<String>) -> Self {
        Self {
            phase: Some(phase.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub sequence: u64,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub stage: ProgressStage,
    pub state: PartialState,
}

/// Emitting half of the progress channel. Cloned into every task; a disabled
/// collector drops events silently.
#[derive(Debug, Clone, Default)]
pub struct ProgressCollector {
    sender: Option<mpsc::UnboundedSender<ProgressEvent>>,
    sequence: Arc<AtomicU64>,
}

impl ProgressCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
                sequence: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, stage: ProgressStage, state: PartialState) {
        let Some(sender) = &self.sender else {
            return;
        };
        let event = ProgressEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: current_timestamp(),
            stage,
            state,
        };
        if let Err(err) = sender.send(event) {
            tracing::debug!(error = %err, "progress receiver dropped");
        }
    }
}

/// Consumer of progress events, e.g. a console printer.
pub trait ProgressSink: Send {
    fn observe(&mut self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(&ProgressEvent) + Send,
{
    fn observe(&mut self, event: &ProgressEvent) {
        self(event)
    }
}

/// Feed every event into `sink` until the channel closes; returns the number
/// of events observed.
pub async fn drain<S: ProgressSink>(
    mut receiver: mpsc::UnboundedReceiver<ProgressEvent>,
    mut sink: S,
) -> usize {
    let mut observed = 0;
    while let Some(event) = receiver.recv().await {
        sink.observe(&event);
        observed += 1;
    }
    observed
}

/// First `limit` characters of `text`, with an ellipsis when cut.
pub fn preview(text: &str, limit: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn current_timestamp() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order_and_channel_closes() {
        let (collector, receiver) = ProgressCollector::new();
        let clone = collector.clone();

        collector.emit(ProgressStage::Clarify, PartialState::phase("started"));
        clone.emit(
            ProgressStage::Brief,
            PartialState {
                research_brief: Some("I want a report".into()),
                ..PartialState::default()
            },
        );
        drop(collector);
        drop(clone);

        let mut seen = Vec::new();
        let count = drain(receiver, |event: &ProgressEvent| {
            seen.push((event.sequence, event.stage))
        })
        .await;

        assert_eq!(count, 2);
        assert_eq!(
            seen,
            [(0, ProgressStage::Clarify), (1, ProgressStage::Brief)]
        );
    }

    #[test]
    fn disabled_collector_is_silent() {
        ProgressCollector::disabled().emit(ProgressStage::Report, PartialState::default());
    }

    #[test]
    fn preview_counts_characters() {
        assert_eq!(preview("研究简报内容", 4), "研究简报...");
        assert_eq!(preview("short", 10), "short");
    }
}
