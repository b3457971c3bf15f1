use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::DeepResearchError;
use crate::model::{DynModel, ModelRequest, ModelSpec, Purpose, generate_validated, parse_json_response};
use crate::prompts;
use crate::state::{ClarificationPhase, ConversationState};

/// Structured answer of the clarification gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarifyWithUser {
    pub need_clarification: bool,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub verification: String,
}

impl ClarifyWithUser {
    pub fn proceed(verification: impl Into<String>) -> Self {
        Self {
            need_clarification: false,
            question: String::new(),
            verification: verification.into(),
        }
    }

    /// Enforce the either/or shape: a question and no verification, or the
    /// other way round.
    fn normalize(mut self) -> Result<Self, String> {
        self.question = self.question.trim().to_string();
        self.verification = self.verification.trim().to_string();
        if self.need_clarification {
            if self.question.is_empty() {
                return Err("need_clarification is true but question is empty".into());
            }
            self.verification.clear();
        } else {
            self.question.clear();
        }
        Ok(self)
    }
}

/// Decides whether the run must pause for user input before research.
#[derive(Clone)]
pub struct ClarificationGate {
    model: DynModel,
    spec: ModelSpec,
    max_attempts: u32,
    allow: bool,
}

impl ClarificationGate {
    pub fn new(model: DynModel, spec: ModelSpec, max_attempts: u32, allow: bool) -> Self {
        Self {
            model,
            spec,
            max_attempts,
            allow,
        }
    }

    /// At most one question per conversation: once a question was asked, the
    /// model's answer is coerced to proceed, and once the gate settled it is
    /// not consulted again.
    #[instrument(name = "gate.evaluate", skip_all, fields(phase = ?conversation.clarification()))]
    pub async fn evaluate(
        &self,
        conversation: &ConversationState,
    ) -> Result<ClarifyWithUser, DeepResearchError> {
        if !self.allow {
            debug!("clarification disabled; proceeding");
            return Ok(ClarifyWithUser::proceed(""));
        }

        let phase = conversation.clarification();
        if phase == ClarificationPhase::Settled {
            debug!("clarification already settled; proceeding");
            return Ok(ClarifyWithUser::proceed(""));
        }

        let already_asked = phase == ClarificationPhase::Asked;
        let request = ModelRequest::new(Purpose::Clarify, self.spec.clone())
            .with_system(prompts::clarify_system(
                &conversation.render_transcript(),
                already_asked,
            ))
            .with_user("Decide whether a clarifying question is needed.")
            .expecting_json();

        let mut decision = generate_validated(
            self.model.as_ref(),
            request,
            self.max_attempts,
            |raw| parse_json_response::<ClarifyWithUser>(raw).and_then(ClarifyWithUser::normalize),
        )
        .await?;

        if already_asked && decision.need_clarification {
            info!("model asked a second clarifying question; proceeding instead");
            decision = ClarifyWithUser::proceed("");
        }

        info!(
            need_clarification = decision.need_clarification,
            "clarification decided"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::stub::{StubModel, StubReply};

    fn gate(model: Arc<StubModel>) -> ClarificationGate {
        ClarificationGate::new(model, ModelSpec::new("stub", 64), 2, true)
    }

    #[tokio::test]
    async fn settled_conversation_is_not_reconsidered() {
        let model = Arc::new(StubModel::new());
        let gate = gate(model.clone());
        let mut conversation = ConversationState::new("Compare tokio and smol");

        let first = gate.evaluate(&conversation).await.unwrap();
        assert!(!first.need_clarification);
        conversation.record_clarification(&first);
        assert_eq!(model.calls(Purpose::Clarify), 1);

        model.push_reply(
            Purpose::Clarify,
            StubReply::json(json!({
                "need_clarification": true,
                "question": "Which platforms matter?",
                "verification": ""
            })),
        );
        for _ in 0..2 {
            let again = gate.evaluate(&conversation).await.unwrap();
            assert!(!again.need_clarification);
            assert!(again.question.is_empty());
        }
        assert_eq!(model.calls(Purpose::Clarify), 1);
    }

    #[tokio::test]
    async fn second_question_is_coerced_to_proceed() {
        let question = json!({
            "need_clarification": true,
            "question": "Which platforms matter?",
            "verification": ""
        });
        let model = Arc::new(
            StubModel::new()
                .with_reply(Purpose::Clarify, StubReply::json(question.clone()))
                .with_reply(Purpose::Clarify, StubReply::json(question)),
        );
        let gate = gate(model.clone());
        let mut conversation = ConversationState::new("Compare tokio and smol");

        let first = gate.evaluate(&conversation).await.unwrap();
        assert!(first.need_clarification);
        conversation.record_clarification(&first);
        conversation.push_user("Linux servers only");

        let second = gate.evaluate(&conversation).await.unwrap();
        assert!(!second.need_clarification);
        assert_eq!(model.calls(Purpose::Clarify), 2);
    }

    #[test]
    fn normalize_rejects_question_less_requests() {
        let raw = ClarifyWithUser {
            need_clarification: true,
            question: "  ".into(),
            verification: "x".into(),
        };
        assert!(raw.normalize().is_err());

        let ok = ClarifyWithUser {
            need_clarification: false,
            question: "stray".into(),
            verification: " Starting. ".into(),
        }
        .normalize()
        .unwrap();
        assert_eq!(ok, ClarifyWithUser::proceed("Starting."));
    }
}
