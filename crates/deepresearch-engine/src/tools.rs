//! Tool seam used by researchers.
//!
//! Providers implement [`Tool`]; the set of tools available to a run is fixed
//! once at session start in a [`ToolRegistry`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ToolProviderConfig;
use crate::error::ToolError;
use crate::metrics;
use crate::state::SourceRef;

/// A tool invocation requested by a researcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// Content returned by a tool plus the sources it drew from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub sources: Vec<SourceRef>,
}

impl ToolOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sources: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: SourceRef) -> Self {
        self.sources.push(source);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.sources.is_empty()
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON description of the accepted arguments, shown to the model.
    fn parameters(&self) -> Value {
        Value::Object(Default::default())
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, ToolError>;
}

pub type DynTool = Arc<dyn Tool>;

/// Immutable name → tool map resolved once per session.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<BTreeMap<String, DynTool>>,
    instructions: Option<String>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .field("instructions", &self.instructions.is_some())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(tools: impl IntoIterator<Item = DynTool>) -> Self {
        let mut map = BTreeMap::new();
        for tool in tools {
            let name = tool.name().to_string();
            if map.insert(name.clone(), tool).is_some() {
                warn!(tool = %name, "duplicate tool name; keeping the last registration");
            }
        }
        Self {
            tools: Arc::new(map),
            instructions: None,
        }
    }

    /// Combine built-in tools with an external provider's tools. Provider
    /// tools outside `allowed_tools` are dropped and the provider's
    /// instructions are carried into researcher prompts.
    pub fn with_external(
        builtin: impl IntoIterator<Item = DynTool>,
        provider: &ToolProviderConfig,
        external: impl IntoIterator<Item = DynTool>,
    ) -> Self {
        let allowed: Vec<DynTool> = external
            .into_iter()
            .filter(|tool| {
                let keep = provider
                    .allowed_tools
                    .iter()
                    .any(|allowed| allowed == tool.name());
                if !keep {
                    debug!(tool = tool.name(), "external tool not in allowed_tools");
                }
                keep
            })
            .collect();

        let mut registry = Self::new(builtin.into_iter().chain(allowed));
        registry.instructions = provider
            .instructions
            .as_ref()
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        registry
    }

    pub fn get(&self, name: &str) -> Option<&DynTool> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    /// Markdown list of tools for researcher prompts.
    pub fn describe(&self) -> String {
        self.tools
            .values()
            .map(|tool| {
                let params = tool.parameters();
                if params.as_object().is_some_and(|map| map.is_empty()) {
                    format!("- `{}`: {}", tool.name(), tool.description())
                } else {
                    format!(
                        "- `{}`: {} Arguments: {}",
                        tool.name(),
                        tool.description(),
                        params
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn invoke(&self, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let Some(tool) = self.get(&call.tool) else {
            metrics::record_tool_call(&call.tool, "unknown");
            return Err(ToolError::Unknown(call.tool.clone()));
        };

        let result = tool.invoke(call.args.clone()).await;
        metrics::record_tool_call(
            &call.tool,
            if result.is_ok() { "ok" } else { "error" },
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolTransport;
    use serde_json::json;

    struct Echo(&'static str);

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "Echo the arguments back."
        }

        async fn invoke(&self, args: Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::new(args.to_string()))
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new([Arc::new(Echo("echo")) as DynTool]);

        let output = registry
            .invoke(&ToolCall {
                tool: "echo".into(),
                args: json!({"q": 1}),
            })
            .await
            .unwrap();
        assert_eq!(output.content, r#"{"q":1}"#);

        let err = registry
            .invoke(&ToolCall {
                tool: "missing".into(),
                args: Value::Null,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Unknown(name) if name == "missing"));
    }

    #[test]
    fn external_tools_are_filtered() {
        let provider = ToolProviderConfig {
            transport: ToolTransport::Local,
            endpoint: "./docs".into(),
            allowed_tools: vec!["read_file".into()],
            instructions: Some("  Prefer local files.  ".into()),
        };
        let registry = ToolRegistry::with_external(
            [Arc::new(Echo("web_search")) as DynTool],
            &provider,
            [
                Arc::new(Echo("read_file")) as DynTool,
                Arc::new(Echo("delete_file")) as DynTool,
            ],
        );

        assert_eq!(registry.names(), ["read_file", "web_search"]);
        assert_eq!(registry.instructions(), Some("Prefer local files."));
        assert!(registry.describe().contains("- `read_file`: Echo"));
    }
}
