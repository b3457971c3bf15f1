//! Run state shared between the pipeline stages.
//!
//! Everything here is serialisable because it travels through the
//! `graph_flow` session context between tasks.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::citations::Citation;
use crate::language::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Where the conversation stands with respect to the clarification gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationPhase {
    #[default]
    NotAsked,
    /// A clarifying question was put to the user; never ask again.
    Asked,
    /// The gate decided research can start.
    Settled,
}

/// Append-only conversation between the user and the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    messages: Vec<Message>,
    clarification: ClarificationPhase,
}

impl ConversationState {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::user(question)],
            clarification: ClarificationPhase::NotAsked,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clarification(&self) -> ClarificationPhase {
        self.clarification
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    /// Record the gate's decision: the question or verification becomes an
    /// assistant message and the phase flag moves forward.
    pub fn record_clarification(&mut self, decision: &crate::ClarifyWithUser) {
        if decision.need_clarification {
            self.push_assistant(decision.question.clone());
            self.clarification = ClarificationPhase::Asked;
        } else {
            if !decision.verification.trim().is_empty() {
                self.push_assistant(decision.verification.clone());
            }
            self.clarification = ClarificationPhase::Settled;
        }
    }

    pub fn first_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }

    pub fn language(&self) -> Language {
        self.first_user_message()
            .map(Language::detect)
            .unwrap_or_default()
    }

    /// Plain-text rendering used inside prompts.
    pub fn render_transcript(&self) -> String {
        self.messages
            .iter()
            .map(|message| format!("{}: {}", message.role.as_str(), message.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The single research directive for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResearchBrief(String);

impl ResearchBrief {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResearchBrief {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subtopics dispatched together in one delegation round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationPlan {
    topics: Vec<String>,
}

impl DelegationPlan {
    /// Build a plan from raw supervisor output: blanks and duplicates are
    /// dropped and the plan is capped at `max_units`. Returns `None` when no
    /// usable topic remains.
    pub fn new(topics: Vec<String>, max_units: usize) -> Option<Self> {
        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        for topic in topics {
            let trimmed = topic.trim();
            if trimmed.is_empty() {
                continue;
            }
            let key = trimmed
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            if seen.insert(key) {
                kept.push(trimmed.to_string());
            }
        }

        if kept.len() > max_units {
            tracing::warn!(
                requested = kept.len(),
                max_units,
                "delegation plan truncated to concurrency limit"
            );
            kept.truncate(max_units);
        }

        if kept.is_empty() {
            None
        } else {
            Some(Self { topics: kept })
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// A source a researcher touched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub title: String,
    pub url: String,
}

impl SourceRef {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
        }
    }
}

/// Raw output of one researcher task, consumed once by the compressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub worker_id: String,
    pub topic: String,
    pub transcript: String,
    pub citations: Vec<SourceRef>,
    pub coverage_gaps: Vec<String>,
    pub tool_calls: usize,
    /// Whether any tool call returned content.
    pub has_results: bool,
}

impl Finding {
    pub fn new(worker_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            topic: topic.into(),
            transcript: String::new(),
            citations: Vec::new(),
            coverage_gaps: Vec::new(),
            tool_calls: 0,
            has_results: false,
        }
    }

    pub fn distinct_urls(&self) -> BTreeSet<&str> {
        self.citations.iter().map(|source| source.url.as_str()).collect()
    }

    /// Add a citation unless its url is already known.
    pub fn cite(&mut self, source: SourceRef) {
        if !self.citations.iter().any(|known| known.url == source.url) {
            self.citations.push(source);
        }
    }
}

/// Compressed, verbatim-preserving rewrite of one finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedNote {
    pub worker_id: String,
    pub topic: String,
    pub text: String,
    /// Every source of the finding, deduplicated by url.
    pub sources: Vec<SourceRef>,
    pub coverage_gaps: Vec<String>,
    /// Set when compression failed and the raw transcript was passed through.
    pub verbatim_fallback: bool,
    /// Set when no tool call of the task returned content.
    pub empty: bool,
}

impl CompressedNote {
    /// Note for a task that produced nothing usable.
    pub fn gap(worker_id: impl Into<String>, topic: impl Into<String>, gap: impl Into<String>) -> Self {
        let topic = topic.into();
        let gap = gap.into();
        Self {
            worker_id: worker_id.into(),
            text: format!("No findings were gathered for: {topic}\n\nCoverage gap: {gap}"),
            topic,
            sources: Vec::new(),
            coverage_gaps: vec![gap],
            verbatim_fallback: false,
            empty: true,
        }
    }

    pub fn citations(&self) -> BTreeSet<&str> {
        self.sources.iter().map(|source| source.url.as_str()).collect()
    }

    pub fn has_findings(&self) -> bool {
        !self.empty
    }
}

/// Terminal artefact of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    markdown: String,
    citations: Vec<Citation>,
    language: Language,
}

impl FinalReport {
    pub(crate) fn new(markdown: String, citations: Vec<Citation>, language: Language) -> Self {
        Self {
            markdown,
            citations,
            language,
        }
    }

    pub fn markdown(&self) -> &str {
        &self.markdown
    }

    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    pub fn language(&self) -> Language {
        self.language
    }
}

impl std::fmt::Display for FinalReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.markdown)
    }
}
