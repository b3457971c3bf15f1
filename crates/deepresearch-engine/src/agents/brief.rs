use serde::Deserialize;
use tracing::{info, instrument};

use crate::error::DeepResearchError;
use crate::model::{DynModel, ModelRequest, ModelSpec, Purpose, generate_validated, parse_json_response};
use crate::prompts;
use crate::state::{ConversationState, ResearchBrief};

#[derive(Debug, Deserialize)]
struct BriefResponse {
    research_brief: String,
}

/// Compiles the conversation into the single research directive for the run.
#[derive(Clone)]
pub struct BriefSynthesizer {
    model: DynModel,
    spec: ModelSpec,
    max_attempts: u32,
}

impl BriefSynthesizer {
    pub fn new(model: DynModel, spec: ModelSpec, max_attempts: u32) -> Self {
        Self {
            model,
            spec,
            max_attempts,
        }
    }

    #[instrument(name = "brief.synthesize", skip_all)]
    pub async fn synthesize(
        &self,
        conversation: &ConversationState,
    ) -> Result<ResearchBrief, DeepResearchError> {
        let request = ModelRequest::new(Purpose::Brief, self.spec.clone())
            .with_system(prompts::brief_system(&conversation.render_transcript()))
            .with_user("Write the research brief.")
            .expecting_json();

        let brief = generate_validated(self.model.as_ref(), request, self.max_attempts, |raw| {
            let response = parse_json_response::<BriefResponse>(raw)?;
            let text = response.research_brief.trim();
            if text.is_empty() {
                Err("research_brief is empty".to_string())
            } else {
                Ok(ResearchBrief::new(text))
            }
        })
        .await?;

        info!(chars = brief.as_str().chars().count(), "research brief synthesized");
        Ok(brief)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::stub::{StubModel, StubReply};

    #[tokio::test]
    async fn empty_brief_is_retried_then_fatal() {
        let model = Arc::new(
            StubModel::new().with_reply(Purpose::Brief, StubReply::json(json!({"research_brief": " "}))),
        );
        let synthesizer = BriefSynthesizer::new(model.clone(), ModelSpec::new("stub", 128), 2);
        let conversation = ConversationState::new("How do tokio tasks get scheduled?");

        let brief = synthesizer.synthesize(&conversation).await.unwrap();
        assert!(brief.as_str().ends_with("How do tokio tasks get scheduled?"));
        assert_eq!(model.calls(Purpose::Brief), 2);

        let stubborn = Arc::new(
            StubModel::new().with_reply(Purpose::Brief, StubReply::text("no json here")),
        );
        let err = BriefSynthesizer::new(stubborn, ModelSpec::new("stub", 128), 1)
            .synthesize(&conversation)
            .await
            .unwrap_err();
        assert!(err.is_fatal_output_failure());
    }
}
