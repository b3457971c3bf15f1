use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::model::ModelSpec;
use crate::{DeepResearchError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "DEEPRESEARCH_CONFIG";

/// Limits, model selection and tool wiring for a research run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub max_structured_output_retries: u32,
    pub allow_clarification: bool,
    pub max_concurrent_research_units: usize,
    pub max_researcher_iterations: usize,
    pub max_react_tool_calls: usize,
    pub models: StageModels,
    pub search_api: SearchApi,
    pub search: SearchSettings,
    pub tool_provider: Option<ToolProviderConfig>,
    pub researcher: ResearcherTuning,
    pub report: ReportSettings,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_structured_output_retries: 3,
            allow_clarification: true,
            max_concurrent_research_units: 5,
            max_researcher_iterations: 6,
            max_react_tool_calls: 10,
            models: StageModels::default(),
            search_api: SearchApi::Tavily,
            search: SearchSettings::default(),
            tool_provider: None,
            researcher: ResearcherTuning::default(),
            report: ReportSettings::default(),
            llm: LlmConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ResearchConfig {
    /// Resolve the configured LLM secret value (from environment only).
    pub fn llm_api_key(&self) -> Result<SecretValue, DeepResearchError> {
        require_env(&self.llm.api_key_env)
    }

    pub fn search_api_key(&self) -> Result<SecretValue, DeepResearchError> {
        require_env(&self.search.api_key_env)
    }

    /// Upper bound on supervisor planning calls for one run.
    pub fn max_supervisor_decisions(&self) -> usize {
        self.max_researcher_iterations.saturating_mul(2) + 2
    }

    pub fn validate(&self) -> Result<(), DeepResearchError> {
        let invalid = |message: &str| Err(DeepResearchError::InvalidConfiguration(message.into()));

        if self.max_structured_output_retries == 0 {
            return invalid("max_structured_output_retries must be at least 1");
        }
        if self.max_concurrent_research_units == 0 {
            return invalid("max_concurrent_research_units must be at least 1");
        }
        if self.max_researcher_iterations == 0 {
            return invalid("max_researcher_iterations must be at least 1");
        }
        if self.max_react_tool_calls == 0 {
            return invalid("max_react_tool_calls must be at least 1");
        }

        for (stage, spec) in self.models.iter() {
            if spec.model.trim().is_empty() {
                return Err(DeepResearchError::InvalidConfiguration(format!(
                    "models.{stage}.model must not be empty"
                )));
            }
            if spec.max_tokens == 0 {
                return Err(DeepResearchError::InvalidConfiguration(format!(
                    "models.{stage}.max_tokens must be greater than zero"
                )));
            }
        }

        if self.researcher.sufficient_sources == 0 {
            return invalid("researcher.sufficient_sources must be at least 1");
        }
        if !(self.researcher.duplicate_threshold > 0.0 && self.researcher.duplicate_threshold <= 1.0)
        {
            return invalid("researcher.duplicate_threshold must be in (0, 1]");
        }

        if let Some(provider) = &self.tool_provider {
            if provider.endpoint.trim().is_empty() {
                return invalid("tool_provider.endpoint must not be empty");
            }
            if provider.allowed_tools.is_empty() {
                return invalid("tool_provider.allowed_tools must list at least one tool");
            }
        }

        if self.llm.api_key_env.trim().is_empty() {
            return invalid("llm.api_key_env must reference an environment variable");
        }
        Ok(())
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `DEEPRESEARCH_CONFIG` environment variable.
    /// 3. `config.toml` in the current working directory.
    ///
    /// Built-in defaults apply only when neither 1 nor 2 named a file and
    /// `config.toml` does not exist.
    pub fn load(path: Option<PathBuf>) -> Result<ResearchConfig, DeepResearchError> {
        let (candidate, explicit) = resolve_path(path);
        if !explicit && !candidate.exists() {
            tracing::debug!(path = %candidate.display(), "no config file found; using defaults");
            let config = ResearchConfig::default();
            config.validate()?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| DeepResearchError::config_io(candidate.clone(), err))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<ResearchConfig, DeepResearchError> {
        let config: ResearchConfig = toml::from_str(raw)
            .map_err(|err| DeepResearchError::InvalidConfiguration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn resolve_path(path: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = path {
        return (path, true);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return (PathBuf::from(from_env), true);
        }
    }

    (Path::new(DEFAULT_CONFIG_PATH).to_path_buf(), false)
}

/// Per-stage model selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageModels {
    /// Clarification, brief and supervisor planning.
    pub summarization: ModelSpec,
    pub research: ModelSpec,
    pub compression: ModelSpec,
    pub final_report: ModelSpec,
}

impl Default for StageModels {
    fn default() -> Self {
        Self {
            summarization: ModelSpec::new("deepseek-chat", 4096),
            research: ModelSpec::new("deepseek-chat", 8192),
            compression: ModelSpec::new("deepseek-chat", 4096),
            final_report: ModelSpec::new("deepseek-chat", 8192),
        }
    }
}

impl StageModels {
    /// Same model for every stage, each keeping its own token budget unless
    /// `max_tokens` is given.
    pub fn uniform(model: &str, max_tokens: Option<u32>) -> Self {
        let defaults = Self::default();
        let pick = |spec: ModelSpec| ModelSpec::new(model, max_tokens.unwrap_or(spec.max_tokens));
        Self {
            summarization: pick(defaults.summarization),
            research: pick(defaults.research),
            compression: pick(defaults.compression),
            final_report: pick(defaults.final_report),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ModelSpec)> {
        [
            ("summarization", &self.summarization),
            ("research", &self.research),
            ("compression", &self.compression),
            ("final_report", &self.final_report),
        ]
        .into_iter()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchApi {
    #[default]
    Tavily,
    #[serde(alias = "none")]
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub api_key_env: String,
    pub max_results: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            api_key_env: "TAVILY_API_KEY".into(),
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolTransport {
    /// In-process tools over a local documents directory.
    Local,
}

/// External tool provider attached to researchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProviderConfig {
    pub transport: ToolTransport,
    pub endpoint: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearcherTuning {
    /// Distinct sources after which a researcher stops early.
    pub sufficient_sources: usize,
    /// Jaccard similarity at which two consecutive tool results count as
    /// repeating each other.
    pub duplicate_threshold: f64,
}

impl Default for ResearcherTuning {
    fn default() -> Self {
        Self {
            sufficient_sources: 6,
            duplicate_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    /// Minimum words (characters for CJK) per `##` section; 0 disables the check.
    pub min_section_words: usize,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            min_section_words: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com/v1".into(),
            api_key_env: "DEEPSEEK_API_KEY".into(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Append a JSONL record per finished session.
    pub session_log: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            session_log: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = ConfigLoader::from_toml_str(
            r#"
            max_concurrent_research_units = 2
            search_api = "none"

            [models.final_report]
            model = "qwen-plus"
            max_tokens = 16000

            [tool_provider]
            transport = "local"
            endpoint = "./docs"
            allowed_tools = ["read_file"]
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent_research_units, 2);
        assert_eq!(config.max_researcher_iterations, 6);
        assert_eq!(config.search_api, SearchApi::Disabled);
        assert_eq!(config.models.final_report.model, "qwen-plus");
        assert_eq!(config.models.research.max_tokens, 8192);
        assert_eq!(
            config.tool_provider.as_ref().map(|p| p.transport),
            Some(ToolTransport::Local)
        );
        assert_eq!(config.max_supervisor_decisions(), 14);
    }

    #[test]
    fn rejects_zero_caps_and_empty_providers() {
        let err = ConfigLoader::from_toml_str("max_researcher_iterations = 0").unwrap_err();
        assert!(matches!(err, DeepResearchError::InvalidConfiguration(_)));

        let err = ConfigLoader::from_toml_str(
            r#"
            [tool_provider]
            transport = "local"
            endpoint = "./docs"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("allowed_tools"));

        let err = ConfigLoader::from_toml_str(
            r#"
            [models.research]
            model = ""
            max_tokens = 10
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("models.research.model"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::load(Some(dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, DeepResearchError::ConfigIo { .. }));
    }

    #[test]
    fn uniform_models_keep_stage_budgets() {
        let models = StageModels::uniform("qwen-flash", None);
        assert!(models.iter().all(|(_, spec)| spec.model == "qwen-flash"));
        assert_eq!(models.final_report.max_tokens, 8192);
        assert_eq!(
            StageModels::uniform("x", Some(100)).compression.max_tokens,
            100
        );
    }
}
