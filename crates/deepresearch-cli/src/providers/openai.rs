use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use deepresearch_engine::{ModelError, ModelInvoker, ModelRequest, SecretValue};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::debug;

/// Chat-completions client for any OpenAI-compatible endpoint (DeepSeek,
/// DashScope compatible mode, OpenAI itself).
pub struct OpenAiCompatible {
    client: Client,
    endpoint: String,
    api_key: SecretValue,
}

impl OpenAiCompatible {
    pub fn new(base_url: &str, api_key: SecretValue, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }
}

fn request_body(request: &ModelRequest) -> Value {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for message in &request.messages {
        messages.push(json!({ "role": message.role.as_str(), "content": message.content }));
    }

    let mut body = json!({
        "model": request.model.model,
        "messages": messages,
        "max_tokens": request.model.max_tokens,
    });
    // Reasoning models reject response_format.
    if request.json && !request.model.model.contains("reasoner") {
        body["response_format"] = json!({ "type": "json_object" });
    }
    body
}

fn message_content(response: &Value) -> Option<&str> {
    response["choices"][0]["message"]["content"].as_str()
}

#[async_trait]
impl ModelInvoker for OpenAiCompatible {
    async fn generate(&self, request: ModelRequest) -> Result<String, ModelError> {
        debug!(purpose = %request.purpose, model = %request.model.model, "chat completion request");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose())
            .json(&request_body(&request))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ModelError::Timeout
                } else {
                    ModelError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let reason = format!("{status}: {}", self.api_key.scrub(&text));
            return Err(
                if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                    ModelError::Rejected(reason)
                } else {
                    ModelError::Transport(reason)
                },
            );
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| ModelError::Transport(format!("invalid response body: {err}")))?;
        message_content(&payload)
            .map(str::to_string)
            .ok_or_else(|| ModelError::Transport("response carried no message content".into()))
    }
}
