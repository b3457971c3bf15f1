use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use graph_flow::{
    ExecutionStatus, FlowRunner, Graph, GraphBuilder, InMemorySessionStorage, Session,
    SessionStorage, Task,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::agents::Termination;
use crate::budget::CancellationFlag;
use crate::config::ResearchConfig;
use crate::error::{DeepResearchError, RunFailure};
use crate::events::ProgressCollector;
use crate::logging::{SessionLogInput, log_session_completion};
use crate::model::DynModel;
use crate::stage::Stage;
use crate::state::{ClarificationPhase, CompressedNote, ConversationState, FinalReport, ResearchBrief};
use crate::tasks::{BriefTask, ClarifyTask, ReportTask, ResearchServices, SupervisorTask, keys};
use crate::tools::ToolRegistry;
use crate::trace::{TraceEvent, persist_trace};

/// User message recorded when a clarifying question gets an empty answer.
pub const NO_FURTHER_DETAILS: &str = "No further details; proceed with the original question.";

const START_TASK: &str = "clarify";

/// Answers a clarifying question in-line, e.g. by prompting on a terminal.
/// `None` or an empty answer continues with the original question.
#[async_trait]
pub trait ClarificationResponder: Send + Sync {
    async fn answer(&self, question: &str) -> Option<String>;
}

/// Options for starting a research session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub question: String,
    pub session_id: Option<String>,
}

impl SessionOptions {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Options for continuing a session paused on a clarifying question.
#[derive(Debug, Clone)]
pub struct ResumeOptions {
    pub session_id: String,
    pub answer: Option<String>,
}

impl ResumeOptions {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            answer: None,
        }
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = Some(answer.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CompletedSession {
    pub session_id: String,
    pub report: FinalReport,
    pub brief: ResearchBrief,
    pub notes: Vec<CompressedNote>,
    pub rounds: usize,
    pub termination: Termination,
    pub trace: Vec<TraceEvent>,
    pub trace_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Completed(Box<CompletedSession>),
    /// The run paused on a clarifying question; continue with
    /// [`ResearchEngine::resume`].
    AwaitingClarification { session_id: String, question: String },
}

impl SessionOutcome {
    pub fn session_id(&self) -> &str {
        match self {
            SessionOutcome::Completed(completed) => &completed.session_id,
            SessionOutcome::AwaitingClarification { session_id, .. } => session_id,
        }
    }

    pub fn into_completed(self) -> Option<CompletedSession> {
        match self {
            SessionOutcome::Completed(completed) => Some(*completed),
            SessionOutcome::AwaitingClarification { .. } => None,
        }
    }
}

/// Runs the clarify → brief → supervise → report graph for one question at
/// a time. Sessions live in the configured `graph_flow` storage, so a paused
/// session can be resumed by any engine sharing that storage.
pub struct ResearchEngine {
    config: ResearchConfig,
    model: DynModel,
    tools: ToolRegistry,
    progress: ProgressCollector,
    cancel: CancellationFlag,
    responder: Option<Arc<dyn ClarificationResponder>>,
    storage: Arc<dyn SessionStorage>,
    trace_dir: Option<PathBuf>,
}

impl ResearchEngine {
    pub fn new(config: ResearchConfig, model: DynModel) -> Self {
        Self {
            config,
            model,
            tools: ToolRegistry::default(),
            progress: ProgressCollector::disabled(),
            cancel: CancellationFlag::new(),
            responder: None,
            storage: Arc::new(InMemorySessionStorage::new()),
            trace_dir: None,
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Progress events go to `progress`; the channel closes once the engine
    /// is dropped.
    pub fn with_progress(mut self, progress: ProgressCollector) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn ClarificationResponder>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Persist each completed session's trace as `<dir>/<session_id>.json`.
    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn SessionStorage> {
        Arc::clone(&self.storage)
    }

    #[instrument(name = "engine.run", skip_all)]
    pub async fn run(&self, options: SessionOptions) -> Result<SessionOutcome, DeepResearchError> {
        self.config.validate()?;
        let question = options.question.trim();
        if question.is_empty() {
            return Err(DeepResearchError::InvalidConfiguration(
                "the research question must not be empty".into(),
            ));
        }

        let session_id = options
            .session_id
            .unwrap_or_else(|| format!("session-{}", Uuid::new_v4()));
        store_conversation(
            self.storage.as_ref(),
            &session_id,
            &ConversationState::new(question),
        )
        .await?;
        info!(%session_id, "research session started");

        self.drive(&session_id).await
    }

    /// Continue a session that paused on a clarifying question.
    #[instrument(name = "engine.resume", skip_all, fields(session = %options.session_id))]
    pub async fn resume(&self, options: ResumeOptions) -> Result<SessionOutcome, DeepResearchError> {
        self.config.validate()?;
        let conversation = load_conversation(self.storage.as_ref(), &options.session_id).await?;
        if conversation.clarification() != ClarificationPhase::Asked {
            return Err(DeepResearchError::InvalidConfiguration(format!(
                "session {} is not waiting for a clarification answer",
                options.session_id
            )));
        }
        self.record_answer(&options.session_id, options.answer).await?;
        self.drive(&options.session_id).await
    }

    async fn drive(&self, session_id: &str) -> Result<SessionOutcome, DeepResearchError> {
        let services = Arc::new(ResearchServices::new(
            &self.config,
            Arc::clone(&self.model),
            self.tools.clone(),
            self.progress.clone(),
            self.cancel.clone(),
        ));
        let runner = FlowRunner::new(build_graph(services), Arc::clone(&self.storage));

        loop {
            let result = runner
                .run(session_id)
                .await
                .map_err(|err| anyhow!("graph execution failure: {err}"))?;

            let session = self.session(session_id).await?;
            if let Some(failure) = session.context.get::<RunFailure>(keys::FAILURE).await {
                return Err(failure.into_error());
            }

            match result.status {
                ExecutionStatus::Completed => return self.completed(session_id, &session).await,
                ExecutionStatus::WaitingForInput => {
                    let question: String = session
                        .context
                        .get(keys::CLARIFICATION_QUESTION)
                        .await
                        .unwrap_or_default();
                    let Some(responder) = &self.responder else {
                        info!(%session_id, "paused for clarification");
                        return Ok(SessionOutcome::AwaitingClarification {
                            session_id: session_id.to_string(),
                            question,
                        });
                    };
                    let answer = responder.answer(&question).await;
                    self.record_answer(session_id, answer).await?;
                }
                ExecutionStatus::Error(message) => {
                    return Err(anyhow!("graph execution failure: {message}").into());
                }
                #[allow(unreachable_patterns)]
                _ => continue,
            }
        }
    }

    async fn record_answer(
        &self,
        session_id: &str,
        answer: Option<String>,
    ) -> Result<(), DeepResearchError> {
        let mut conversation = load_conversation(self.storage.as_ref(), session_id).await?;
        match answer.as_deref().map(str::trim).filter(|text| !text.is_empty()) {
            Some(text) => conversation.push_user(text),
            None => conversation.push_user(NO_FURTHER_DETAILS),
        }
        store_conversation(self.storage.as_ref(), session_id, &conversation).await
    }

    async fn session(&self, session_id: &str) -> Result<Session, DeepResearchError> {
        self.storage
            .get(session_id)
            .await
            .map_err(|err| anyhow!("failed to reload session: {err}"))?
            .ok_or_else(|| DeepResearchError::SessionNotFound(session_id.to_string()))
    }

    async fn completed(
        &self,
        session_id: &str,
        session: &Session,
    ) -> Result<SessionOutcome, DeepResearchError> {
        let context = &session.context;
        let report: FinalReport = context
            .get(keys::REPORT)
            .await
            .ok_or_else(|| anyhow!("session {session_id} completed without a report"))?;
        let brief: ResearchBrief = context
            .get(keys::BRIEF)
            .await
            .ok_or_else(|| anyhow!("session {session_id} completed without a brief"))?;
        let notes: Vec<CompressedNote> = context.get(keys::NOTES).await.unwrap_or_default();
        let rounds: usize = context.get(keys::ROUNDS).await.unwrap_or_default();
        let termination: Termination = context
            .get(keys::TERMINATION)
            .await
            .unwrap_or(Termination::Signalled);
        let trace: Vec<TraceEvent> = context.get(keys::TRACE).await.unwrap_or_default();
        let conversation: ConversationState =
            context.get(keys::CONVERSATION).await.unwrap_or_default();

        let trace_path = self.trace_dir.as_ref().and_then(|dir| {
            persist_trace(dir, session_id, &trace)
                .map_err(|err| warn!(error = %err, "failed to persist session trace"))
                .ok()
        });

        if self.config.logging.session_log {
            let input = SessionLogInput {
                session_id: session_id.to_string(),
                question: conversation
                    .first_user_message()
                    .unwrap_or_default()
                    .to_string(),
                brief: Some(brief.as_str().to_string()),
                rounds,
                termination: Some(termination.as_str().to_string()),
                sources: report
                    .citations()
                    .iter()
                    .map(|citation| citation.url.clone())
                    .collect(),
                coverage_gaps: notes
                    .iter()
                    .flat_map(|note| note.coverage_gaps.iter().cloned())
                    .collect(),
                report_chars: report.markdown().chars().count(),
                trace_path: trace_path
                    .as_ref()
                    .map(|path| path.display().to_string()),
            };
            if let Err(err) = log_session_completion(input) {
                warn!(error = %err, "failed to write session log");
            }
        }

        info!(
            %session_id,
            rounds,
            notes = notes.len(),
            termination = termination.as_str(),
            "research session completed"
        );
        Ok(SessionOutcome::Completed(Box::new(CompletedSession {
            session_id: session_id.to_string(),
            report,
            brief,
            notes,
            rounds,
            termination,
            trace,
            trace_path,
        })))
    }
}

fn build_graph(services: Arc<ResearchServices>) -> Arc<Graph> {
    let clarify = Arc::new(ClarifyTask::new(Arc::clone(&services)));
    let brief = Arc::new(BriefTask::new(Arc::clone(&services)));
    let supervisor = Arc::new(SupervisorTask::new(Arc::clone(&services)));
    let report = Arc::new(ReportTask::new(services));

    let builder = GraphBuilder::new("deep_research")
        .add_task(clarify.clone())
        .add_task(brief.clone())
        .add_task(supervisor.clone())
        .add_task(report.clone())
        .add_edge(clarify.id(), brief.id())
        .add_edge(brief.id(), supervisor.id())
        .add_edge(supervisor.id(), report.id())
        .set_start_task(clarify.id());

    Arc::new(builder.build())
}

/// Read the conversation of a stored session.
pub async fn load_conversation(
    storage: &dyn SessionStorage,
    session_id: &str,
) -> Result<ConversationState, DeepResearchError> {
    let session = storage
        .get(session_id)
        .await
        .map_err(|err| anyhow!("failed to load session: {err}"))?
        .ok_or_else(|| DeepResearchError::SessionNotFound(session_id.to_string()))?;
    session
        .context
        .get(keys::CONVERSATION)
        .await
        .ok_or_else(|| DeepResearchError::SessionNotFound(session_id.to_string()))
}

/// Write the conversation of a session, creating the session at the start
/// of the graph when it does not exist yet.
pub async fn store_conversation(
    storage: &dyn SessionStorage,
    session_id: &str,
    conversation: &ConversationState,
) -> Result<(), DeepResearchError> {
    let existing = storage
        .get(session_id)
        .await
        .map_err(|err| anyhow!("failed to load session: {err}"))?;
    let session = match existing {
        Some(session) => session,
        None => {
            let session = Session::new_from_task(session_id.to_string(), START_TASK);
            session.context.set(keys::STAGE, Stage::default()).await;
            session
        }
    };
    session.context.set(keys::CONVERSATION, conversation).await;
    storage
        .save(session)
        .await
        .map_err(|err| anyhow!("failed to persist session: {err}"))?;
    Ok(())
}
