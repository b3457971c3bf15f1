use std::collections::HashMap;
use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, instrument};

use crate::citations::{render_sources_section, renumber, strip_trailing_sources, without_urls};
use crate::error::DeepResearchError;
use crate::events::preview;
use crate::language::{Language, text_units};
use crate::model::{DynModel, ModelRequest, ModelSpec, Purpose, generate_validated};
use crate::prompts;
use crate::state::{CompressedNote, ConversationState, FinalReport, ResearchBrief};

static SELF_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:in this report|this report (?:will|aims to|attempts to)|as an ai\b|as a language model|i (?:will|have) (?:write|written|compile|compiled|prepare|prepared))|本报告将|在本报告中|作为(?:一个)?(?:人工智能|AI)",
    )
    .expect("invalid self-reference regex")
});

/// Merges every note into the final long-form report.
#[derive(Clone)]
pub struct ReportGenerator {
    model: DynModel,
    spec: ModelSpec,
    max_attempts: u32,
    min_section_words: usize,
}

impl ReportGenerator {
    pub fn new(model: DynModel, spec: ModelSpec, max_attempts: u32, min_section_words: usize) -> Self {
        Self {
            model,
            spec,
            max_attempts,
            min_section_words,
        }
    }

    /// The brief takes precedence over the conversation when they disagree.
    /// Exhausting the attempts is fatal: no partial report is produced.
    #[instrument(name = "report.generate", skip_all, fields(notes = notes.len()))]
    pub async fn generate(
        &self,
        brief: &ResearchBrief,
        notes: &[CompressedNote],
        conversation: &ConversationState,
    ) -> Result<FinalReport, DeepResearchError> {
        let language = conversation.language();
        let request = ModelRequest::new(Purpose::Report, self.spec.clone())
            .with_system(prompts::report_system(language, self.min_section_words))
            .with_user(prompts::report_request(
                brief.as_str(),
                &conversation.render_transcript(),
                &render_findings(notes),
            ))
            .in_language(language);

        let min_words = self.min_section_words;
        let draft = generate_validated(self.model.as_ref(), request, self.max_attempts, |raw| {
            validate_draft(raw, language, min_words)
        })
        .await?;

        let (body, listed) = strip_trailing_sources(&draft);
        let (mut markdown, registry) = renumber(&body, &known_titles(notes), &listed);

        if let Some(section) = coverage_gap_section(notes, language) {
            markdown.push_str("\n\n");
            markdown.push_str(&section);
        }
        let sources = render_sources_section(&registry, language.sources_heading());
        if !sources.is_empty() {
            markdown.push_str("\n\n");
            markdown.push_str(&sources);
        }
        markdown.push('\n');

        info!(
            language = language.name(),
            citations = registry.len(),
            chars = markdown.chars().count(),
            "final report assembled"
        );
        Ok(FinalReport::new(markdown, registry.into_entries(), language))
    }
}

fn render_findings(notes: &[CompressedNote]) -> String {
    if notes.is_empty() {
        return "No findings were gathered.".to_string();
    }
    let mut findings = String::new();
    for note in notes {
        let _ = writeln!(findings, "### {} ({})\n{}\n", note.topic, note.worker_id, note.text);
    }
    findings
}

fn known_titles(notes: &[CompressedNote]) -> HashMap<String, String> {
    let mut titles = HashMap::new();
    for source in notes.iter().flat_map(|note| note.sources.iter()) {
        titles
            .entry(source.url.clone())
            .or_insert_with(|| source.title.clone());
    }
    titles
}

fn coverage_gap_section(notes: &[CompressedNote], language: Language) -> Option<String> {
    let mut entries = String::new();
    for note in notes.iter().filter(|note| !note.coverage_gaps.is_empty()) {
        let topic = if note.topic.trim().is_empty() {
            format!("{} {}", language.missing_topic_label(), note.worker_id)
        } else {
            preview(note.topic.trim(), 120)
        };
        let _ = writeln!(entries, "- **{topic}**: {}", note.coverage_gaps.join("; "));
    }
    if entries.is_empty() {
        return None;
    }
    Some(format!(
        "## {}\n\n{}\n\n{}",
        language.coverage_gaps_heading(),
        language.coverage_gaps_intro(),
        entries.trim_end()
    ))
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop the info string (e.g. `markdown`) on the opening fence line.
    body.split_once('\n').map(|(_, inner)| inner).unwrap_or(body).trim()
}

/// Accept a draft only if it is a titled report in the expected language,
/// every section is dense enough, and it never talks about itself.
fn validate_draft(raw: &str, language: Language, min_section_words: usize) -> Result<String, String> {
    let text = strip_fence(raw.trim());
    if text.is_empty() {
        return Err("the report is empty".into());
    }
    if !text.lines().any(|line| line.starts_with("# ")) {
        return Err("the report needs a top-level '# ' title".into());
    }

    let detected = Language::detect(&without_urls(text));
    if language.is_verifiable() && detected != language {
        return Err(format!(
            "the report is written in {} but must be written entirely in {}",
            detected.name(),
            language.name()
        ));
    }

    if let Some(found) = SELF_REFERENCE.find(text) {
        return Err(format!(
            "remove self-referential commentary such as \"{}\"",
            found.as_str()
        ));
    }

    if min_section_words > 0 {
        let (body, _) = strip_trailing_sources(text);
        for (title, content) in sections(&body) {
            let units = text_units(&without_urls(&content));
            if units < min_section_words {
                return Err(format!(
                    "section \"{title}\" has {units} words; every section needs at least {min_section_words}"
                ));
            }
        }
    }

    Ok(text.to_string())
}

/// `##` sections with their content, nested subsections included. A report
/// without `##` headings counts as one section.
fn sections(body: &str) -> Vec<(String, String)> {
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut preamble = String::new();
    for line in body.lines() {
        if let Some(title) = line.strip_prefix("## ") {
            sections.push((title.trim().to_string(), String::new()));
        } else if line.starts_with("# ") {
            continue;
        } else if let Some((_, content)) = sections.last_mut() {
            content.push_str(line);
            content.push('\n');
        } else {
            preamble.push_str(line);
            preamble.push('\n');
        }
    }
    if sections.is_empty() {
        sections.push(("report".to_string(), preamble));
    }
    sections
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::state::SourceRef;
    use crate::stub::{StubModel, StubReply};

    fn note(topic: &str, sources: &[(&str, &str)], gaps: &[&str]) -> CompressedNote {
        CompressedNote {
            worker_id: "r1-w1".into(),
            topic: topic.into(),
            text: "facts".into(),
            sources: sources
                .iter()
                .map(|(title, url)| SourceRef::new(*title, *url))
                .collect(),
            coverage_gaps: gaps.iter().map(|gap| gap.to_string()).collect(),
            verbatim_fallback: false,
            empty: sources.is_empty(),
        }
    }

    #[test]
    fn validation_feedback_names_the_problem() {
        let en = Language::English;
        assert!(validate_draft("## Only a section\n\ntext", en, 0).unwrap_err().contains("title"));
        assert!(
            validate_draft("# 标题\n\n## 部分\n\n这是中文内容。", en, 0)
                .unwrap_err()
                .contains("English")
        );
        assert!(
            validate_draft("# T\n\n## A\n\nIn this report we look at things.", en, 0)
                .unwrap_err()
                .contains("self-referential")
        );
        assert!(
            validate_draft("# T\n\n## A\n\none two three\n\n## B\n\nfour", en, 3)
                .unwrap_err()
                .contains("section \"B\" has 1 words")
        );
        assert_eq!(
            validate_draft("```markdown\n# T\n\nBody text here.\n```", en, 2).unwrap(),
            "# T\n\nBody text here."
        );
    }

    #[test]
    fn cjk_density_counts_characters() {
        let draft = "# 报告\n\n## 概述\n\n并发模型的比较\n\n### 信息源\n[1] A: https://a.example";
        assert!(validate_draft(draft, Language::Chinese, 7).is_ok());
        assert!(validate_draft(draft, Language::Chinese, 8).is_err());
    }

    #[tokio::test]
    async fn report_renumbers_and_lists_gaps() {
        let model = Arc::new(
            StubModel::new()
                .with_reply(Purpose::Report, StubReply::text("no heading"))
                .with_reply(
                    Purpose::Report,
                    StubReply::text(
                        "# Rust vs Go\n\n## Overview\n\nGo uses goroutines [Go docs](https://go.dev/doc) \
                         while Rust uses async [Tokio](https://tokio.rs).\n\n### Sources\n[1] Go: https://go.dev/doc",
                    ),
                ),
        );
        let generator = ReportGenerator::new(model.clone(), ModelSpec::new("stub", 64), 3, 5);
        let notes = vec![
            note("Go", &[("The Go documentation", "https://go.dev/doc")], &[]),
            note("Rust", &[], &["web_search failed: timeout"]),
        ];

        let report = generator
            .generate(
                &ResearchBrief::new("Compare Rust and Go"),
                &notes,
                &ConversationState::new("Compare Rust and Go"),
            )
            .await
            .unwrap();

        assert_eq!(model.calls(Purpose::Report), 2);
        let markdown = report.markdown();
        assert!(markdown.contains("goroutines Go docs [1] while Rust uses async Tokio [2]."));
        assert!(markdown.contains("## Research Coverage Gaps"));
        assert!(markdown.contains("- **Rust**: web_search failed: timeout"));
        assert!(markdown.ends_with(
            "### Sources\n\n[1] The Go documentation: https://go.dev/doc\n[2] Tokio: https://tokio.rs\n"
        ));
        assert_eq!(report.citations().len(), 2);
    }

    #[tokio::test]
    async fn french_question_gets_a_french_report() {
        let model = Arc::new(StubModel::new().with_reply(
            Purpose::Report,
            StubReply::text(
                "# Rust and Go\n\n## Overview\n\nBoth languages are used for network services and the tooling is mature.",
            ),
        ));
        let generator = ReportGenerator::new(model.clone(), ModelSpec::new("stub", 64), 2, 0);
        let question = ConversationState::new("Comparez les modèles de concurrence de Rust et de Go");
        assert_eq!(question.language(), Language::French);

        let report = generator
            .generate(
                &ResearchBrief::new("Je veux comparer Rust et Go"),
                &[note("Go", &[], &["web_search failed: timeout"])],
                &question,
            )
            .await
            .unwrap();

        assert_eq!(model.calls(Purpose::Report), 2);
        assert_eq!(report.language(), Language::French);
        assert!(report.markdown().starts_with("# Rapport de recherche"));
        assert!(report.markdown().contains("## Lacunes de la recherche"));
    }

    #[test]
    fn unlisted_languages_skip_the_language_check() {
        let draft = "# Raport\n\n## Wnioski\n\nRust i Go mają różne modele współbieżności.";
        assert!(validate_draft(draft, Language::Other, 0).is_ok());
        assert!(
            prompts::report_system(Language::Other, 0)
                .contains("in the language of the user's first message")
        );
    }

    #[tokio::test]
    async fn exhausted_retries_are_fatal() {
        let model = Arc::new(
            StubModel::new()
                .with_reply(Purpose::Report, StubReply::text(""))
                .with_reply(Purpose::Report, StubReply::text("")),
        );
        let generator = ReportGenerator::new(model, ModelSpec::new("stub", 64), 2, 0);

        let err = generator
            .generate(
                &ResearchBrief::new("brief"),
                &[],
                &ConversationState::new("question"),
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal_output_failure());
    }
}
