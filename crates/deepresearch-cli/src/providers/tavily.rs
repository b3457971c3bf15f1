use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use deepresearch_engine::{SecretValue, SourceRef, Tool, ToolError, ToolOutput};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";
const TOOL_NAME: &str = "web_search";
/// Page content kept per hit.
const CONTENT_CHARS: usize = 1500;

#[derive(Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
    search_depth: &'static str,
    include_answer: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

/// Web search through the Tavily API.
pub struct TavilySearch {
    client: Client,
    api_key: SecretValue,
    max_results: usize,
}

impl TavilySearch {
    pub fn new(api_key: SecretValue, max_results: usize, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_key,
            max_results: max_results.max(1),
        })
    }
}

fn render(response: SearchResponse) -> ToolOutput {
    let mut content = String::new();
    if let Some(answer) = response.answer.filter(|text| !text.trim().is_empty()) {
        let _ = writeln!(content, "Summary: {}\n", answer.trim());
    }
    let mut sources = Vec::with_capacity(response.results.len());
    for hit in response.results {
        let title = if hit.title.trim().is_empty() {
            hit.url.clone()
        } else {
            hit.title.trim().to_string()
        };
        let excerpt: String = hit.content.trim().chars().take(CONTENT_CHARS).collect();
        let _ = writeln!(content, "### {title}\nURL: {}\n{excerpt}\n", hit.url);
        sources.push(SourceRef::new(title, hit.url));
    }

    let mut output = ToolOutput::new(content.trim_end());
    output.sources = sources;
    output
}

#[async_trait]
impl Tool for TavilySearch {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Search the web. Returns titles, urls and page excerpts for the query."
    }

    fn parameters(&self) -> Value {
        json!({ "query": "string: the search query" })
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|query| !query.is_empty())
            .ok_or_else(|| ToolError::invalid_arguments(TOOL_NAME, "missing string field `query`"))?;

        let request = SearchRequest {
            api_key: self.api_key.expose(),
            query,
            max_results: self.max_results,
            search_depth: "advanced",
            include_answer: true,
        };
        let response = self
            .client
            .post(TAVILY_ENDPOINT)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ToolError::Timeout(TOOL_NAME.into())
                } else {
                    ToolError::failed(TOOL_NAME, err)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::failed(
                TOOL_NAME,
                format!("HTTP {status}: {}", self.api_key.scrub(&body)),
            ));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|err| ToolError::failed(TOOL_NAME, format!("invalid response: {err}")))?;
        Ok(render(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_become_sources() {
        let response: SearchResponse = serde_json::from_value(json!({
            "answer": "Tokio is an async runtime.",
            "results": [
                {"title": "Tokio", "url": "https://tokio.rs", "content": "An asynchronous runtime."},
                {"url": "https://docs.rs/tokio"}
            ]
        }))
        .unwrap();

        let output = render(response);
        assert!(output.content.starts_with("Summary: Tokio is an async runtime."));
        assert!(output.content.contains("### Tokio\nURL: https://tokio.rs"));
        assert_eq!(output.sources.len(), 2);
        assert_eq!(output.sources[1].title, "https://docs.rs/tokio");
    }
}
