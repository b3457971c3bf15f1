use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Purpose;

/// Core error type for DeepResearch runs.
///
/// Only configuration problems and structured-output exhaustion are fatal for
/// a run; everything else degrades inside the pipeline.
#[derive(Debug, Error)]
pub enum DeepResearchError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{purpose} stage produced no usable structured output after {attempts} attempt(s): {reason}")]
    StructuredOutput {
        purpose: Purpose,
        attempts: u32,
        reason: String,
    },
    #[error(transparent)]
    Transition(#[from] crate::stage::InvalidTransition),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeepResearchError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    pub fn is_fatal_output_failure(&self) -> bool {
        matches!(self, Self::StructuredOutput { .. })
    }
}

/// Failure returned by a [`crate::ModelInvoker`]. Timeouts are owned by the
/// invoker and surface here like any other failure.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("model transport failure: {0}")]
    Transport(String),
    #[error("model call timed out")]
    Timeout,
    #[error("model rejected the request: {0}")]
    Rejected(String),
}

/// Failure returned by a [`crate::Tool`]. Never retried by the engine; the
/// issuing researcher records it as a coverage gap.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("tool `{0}` is not available")]
    Unknown(String),
    #[error("invalid arguments for `{tool}`: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("tool `{tool}` failed: {reason}")]
    Failed { tool: String, reason: String },
    #[error("tool `{0}` timed out")]
    Timeout(String),
}

impl ToolError {
    pub fn failed(tool: impl Into<String>, reason: impl ToString) -> Self {
        Self::Failed {
            tool: tool.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_arguments(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

/// Fatal run failure recorded in the graph context by the task that hit it.
///
/// Graph tasks end the flow instead of returning an error so the session is
/// persisted with the failure attached; the driver turns it back into a
/// [`DeepResearchError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub purpose: Purpose,
    pub attempts: u32,
    pub reason: String,
}

impl RunFailure {
    pub fn from_error(purpose: Purpose, error: &DeepResearchError) -> Self {
        match error {
            DeepResearchError::StructuredOutput {
                purpose,
                attempts,
                reason,
            } => Self {
                purpose: *purpose,
                attempts: *attempts,
                reason: reason.clone(),
            },
            other => Self {
                purpose,
                attempts: 0,
                reason: other.to_string(),
            },
        }
    }

    pub fn into_error(self) -> DeepResearchError {
        if self.attempts == 0 {
            DeepResearchError::Other(anyhow::anyhow!(
                "{} stage failed: {}",
                self.purpose,
                self.reason
            ))
        } else {
            DeepResearchError::StructuredOutput {
                purpose: self.purpose,
                attempts: self.attempts,
                reason: self.reason,
            }
        }
    }
}
