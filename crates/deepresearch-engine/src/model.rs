//! Model invocation seam and the bounded structured-output retry loop.
//!
//! The engine never talks to an LLM directly: every call goes through a
//! [`ModelInvoker`] supplied by the caller. Structured decisions are plain
//! JSON in the response text and are validated here, retried up to the
//! configured number of attempts with the parse error fed back to the model.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DeepResearchError, ModelError};
use crate::language::Language;
use crate::metrics;
use crate::state::Message;

/// Which pipeline step a model call serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Clarify,
    Brief,
    Supervise,
    Research,
    Compress,
    Report,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Clarify => "clarify",
            Purpose::Brief => "brief",
            Purpose::Supervise => "supervise",
            Purpose::Research => "research",
            Purpose::Compress => "compress",
            Purpose::Report => "report",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model selector paired with its token budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model: String,
    pub max_tokens: u32,
}

impl ModelSpec {
    pub fn new(model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            max_tokens,
        }
    }
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub purpose: Purpose,
    pub model: ModelSpec,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    /// Whether the caller expects a JSON object in the response.
    pub json: bool,
    /// Language the response must be written in, when it matters.
    pub language: Option<Language>,
}

impl ModelRequest {
    pub fn new(purpose: Purpose, model: ModelSpec) -> Self {
        Self {
            purpose,
            model,
            system: None,
            messages: Vec::new(),
            json: false,
            language: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(Message::user(content));
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn expecting_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn in_language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }
}

/// Executes a single generation. Implementations own transport, timeouts and
/// token accounting.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn generate(&self, request: ModelRequest) -> Result<String, ModelError>;
}

pub type DynModel = Arc<dyn ModelInvoker>;

/// Call the model and deserialize a JSON object from the response.
pub async fn generate_structured<T>(
    model: &dyn ModelInvoker,
    request: ModelRequest,
    max_attempts: u32,
) -> Result<T, DeepResearchError>
where
    T: DeserializeOwned,
{
    generate_validated(model, request.expecting_json(), max_attempts, |raw| {
        parse_json_response::<T>(raw)
    })
    .await
}

/// Call the model and run `validate` over the raw response, retrying on
/// failure. Transport failures count as failed attempts too.
pub async fn generate_validated<T, F>(
    model: &dyn ModelInvoker,
    request: ModelRequest,
    max_attempts: u32,
    validate: F,
) -> Result<T, DeepResearchError>
where
    F: Fn(&str) -> Result<T, String>,
{
    let attempts = max_attempts.max(1);
    let purpose = request.purpose;
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=attempts {
        let mut current = request.clone();
        if attempt > 1 {
            current.messages.push(Message::user(format!(
                "Your previous response could not be used: {last_error}. \
                 Respond again and follow the required output format exactly."
            )));
            metrics::record_structured_retry(purpose);
        }

        match model.generate(current).await {
            Ok(raw) => match validate(&raw) {
                Ok(value) => {
                    debug!(%purpose, attempt, "structured output accepted");
                    return Ok(value);
                }
                Err(reason) => {
                    warn!(%purpose, attempt, %reason, "structured output rejected");
                    last_error = reason;
                }
            },
            Err(err) => {
                warn!(%purpose, attempt, error = %err, "model call failed");
                last_error = err.to_string();
            }
        }
    }

    Err(DeepResearchError::StructuredOutput {
        purpose,
        attempts,
        reason: last_error,
    })
}

/// Deserialize the first JSON object found in a model response.
pub fn parse_json_response<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    let candidate = extract_json_object(raw).ok_or_else(|| "no JSON object found".to_string())?;
    serde_json::from_str(candidate).map_err(|err| format!("invalid JSON: {err}"))
}

/// Locate the first balanced `{...}` object in `text`, skipping braces inside
/// string literals. Tolerates markdown fences and chatter around the object.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (offset, ch) in text[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
