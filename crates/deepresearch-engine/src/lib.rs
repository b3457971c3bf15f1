//! DeepResearch engine built directly on top of `graph_flow`.
//!
//! A question passes through a clarification gate, is compiled into a
//! research brief, is researched by parallel tool-calling workers under a
//! supervisor, and ends as a cited long-form report in the question's
//! language.

pub mod agents;
mod budget;
mod citations;
mod config;
mod error;
mod events;
mod language;
mod logging;
pub mod metrics;
mod model;
mod prompts;
mod security;
mod stage;
mod state;
pub mod stub;
mod tasks;
mod telemetry;
mod tools;
mod trace;
mod workflow;

pub use agents::{
    BriefSynthesizer, ClarificationGate, ClarifyWithUser, Compressor, NotesLedger,
    ReportGenerator, ResearchSupervisor, Researcher, ResearcherStep, SupervisorDecision,
    SupervisorOutcome, Termination,
};
pub use budget::CancellationFlag;
pub use citations::{
    Citation, CitationRegistry, ListedSource, extract_urls, render_sources_section, renumber,
    strip_trailing_sources,
};
pub use config::{
    ConfigLoader, LlmConfig, LoggingConfig, ReportSettings, ResearchConfig, ResearcherTuning,
    SearchApi, SearchSettings, StageModels, ToolProviderConfig, ToolTransport,
};
pub use error::{DeepResearchError, ModelError, RunFailure, ToolError};
pub use events::{
    PartialState, ProgressCollector, ProgressEvent, ProgressSink, ProgressStage, drain, preview,
};
pub use language::Language;
pub use logging::{SessionLogInput, log_session_completion, log_session_completion_in};
pub use model::{
    DynModel, ModelInvoker, ModelRequest, ModelSpec, Purpose, extract_json_object,
    generate_structured, generate_validated, parse_json_response,
};
pub use security::{SecretValue, require_env, secret_status};
pub use stage::{InvalidTransition, Stage, Transition};
pub use state::{
    ClarificationPhase, CompressedNote, ConversationState, DelegationPlan, FinalReport, Finding,
    Message, ResearchBrief, Role, SourceRef,
};
pub use tasks::{BriefTask, ClarifyTask, ReportTask, ResearchServices, SupervisorTask};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use tools::{DynTool, Tool, ToolCall, ToolOutput, ToolRegistry};
pub use trace::{TraceCollector, TraceEvent, TraceStep, TraceSummary, persist_trace};
pub use workflow::{
    ClarificationResponder, CompletedSession, NO_FURTHER_DETAILS, ResearchEngine, ResumeOptions,
    SessionOptions, SessionOutcome, load_conversation, store_conversation,
};
