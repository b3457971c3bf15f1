use std::fmt::Write as _;

use tracing::{debug, instrument, warn};

use crate::metrics;
use crate::model::{DynModel, ModelRequest, ModelSpec, Purpose};
use crate::prompts;
use crate::state::{CompressedNote, Finding};

/// Rewrites a researcher transcript into a note without dropping facts or
/// sources. Any failure passes the transcript through unchanged.
#[derive(Clone)]
pub struct Compressor {
    model: DynModel,
    spec: ModelSpec,
}

impl Compressor {
    pub fn new(model: DynModel, spec: ModelSpec) -> Self {
        Self { model, spec }
    }

    #[instrument(name = "compressor.compress", skip_all, fields(worker = %finding.worker_id))]
    pub async fn compress(&self, finding: Finding) -> CompressedNote {
        if !finding.has_results {
            debug!("finding has no tool output; skipping compression");
            return empty_note(finding);
        }

        let request = ModelRequest::new(Purpose::Compress, self.spec.clone())
            .with_system(prompts::compress_system())
            .with_user(prompts::compress_request(&finding.topic, &finding.transcript));

        let (mut text, verbatim_fallback) = match self.model.generate(request).await {
            Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), false),
            Ok(_) => {
                warn!("compression returned empty text; passing transcript through");
                metrics::record_compression_fallback();
                (finding.transcript.trim().to_string(), true)
            }
            Err(err) => {
                warn!(error = %err, "compression failed; passing transcript through");
                metrics::record_compression_fallback();
                (finding.transcript.trim().to_string(), true)
            }
        };

        let missing: Vec<_> = finding
            .citations
            .iter()
            .filter(|source| !text.contains(source.url.as_str()))
            .collect();
        if !missing.is_empty() {
            debug!(missing = missing.len(), "restoring sources dropped by compression");
            text.push_str("\n\n**Additional sources:**\n");
            for source in missing {
                let _ = writeln!(text, "- {}: {}", source.title, source.url);
            }
        }

        CompressedNote {
            worker_id: finding.worker_id,
            topic: finding.topic,
            text: text.trim_end().to_string(),
            sources: finding.citations,
            coverage_gaps: finding.coverage_gaps,
            verbatim_fallback,
            empty: false,
        }
    }
}

fn empty_note(finding: Finding) -> CompressedNote {
    let mut text = format!("No findings were gathered for: {}", finding.topic);
    for gap in &finding.coverage_gaps {
        let _ = write!(text, "\nCoverage gap: {gap}");
    }
    CompressedNote {
        worker_id: finding.worker_id,
        topic: finding.topic,
        text,
        sources: finding.citations,
        coverage_gaps: finding.coverage_gaps,
        verbatim_fallback: false,
        empty: true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::ModelError;
    use crate::state::SourceRef;
    use crate::stub::{StubModel, StubReply};

    fn finding() -> Finding {
        let mut finding = Finding::new("r1-w1", "Rust");
        finding.transcript = "Rust 1.0 shipped in 2015.\n- Blog: https://blog.rust-lang.org".into();
        finding.has_results = true;
        finding.cite(SourceRef::new("Blog", "https://blog.rust-lang.org"));
        finding.cite(SourceRef::new("Book", "https://doc.rust-lang.org/book"));
        finding
    }

    #[tokio::test]
    async fn dropped_urls_are_restored() {
        let model = Arc::new(StubModel::new().with_reply(
            Purpose::Compress,
            StubReply::text("Rust 1.0 shipped in 2015 [1].\n[1] Blog: https://blog.rust-lang.org"),
        ));
        let note = Compressor::new(model, ModelSpec::new("stub", 64))
            .compress(finding())
            .await;

        assert!(!note.verbatim_fallback);
        assert!(note.text.contains("- Book: https://doc.rust-lang.org/book"));
        assert_eq!(note.citations().len(), 2);
    }

    #[tokio::test]
    async fn failure_passes_transcript_through() {
        let model = Arc::new(StubModel::new().with_reply(
            Purpose::Compress,
            StubReply::Error(ModelError::Timeout),
        ));
        let note = Compressor::new(model, ModelSpec::new("stub", 64))
            .compress(finding())
            .await;

        assert!(note.verbatim_fallback);
        assert!(note.text.starts_with("Rust 1.0 shipped in 2015."));
        assert!(note.text.contains("https://doc.rust-lang.org/book"));
    }

    #[tokio::test]
    async fn empty_finding_skips_the_model() {
        let model = Arc::new(StubModel::new());
        let mut finding = Finding::new("r1-w2", "Go");
        finding.coverage_gaps.push("web_search failed: timeout".into());

        let note = Compressor::new(model.clone(), ModelSpec::new("stub", 64))
            .compress(finding)
            .await;

        assert!(!note.has_findings());
        assert!(note.text.contains("Coverage gap: web_search failed: timeout"));
        assert_eq!(model.calls(Purpose::Compress), 0);
    }
}
