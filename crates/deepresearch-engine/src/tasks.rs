use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use graph_flow::{Context, NextAction, Task, TaskResult};
use tracing::{debug, error, info, instrument};

use crate::agents::{
    BriefSynthesizer, ClarificationGate, Compressor, ReportGenerator, ResearchSupervisor,
    Researcher, Termination,
};
use crate::budget::CancellationFlag;
use crate::config::ResearchConfig;
use crate::error::{DeepResearchError, RunFailure};
use crate::events::{PartialState, ProgressCollector, ProgressStage, preview};
use crate::model::{DynModel, Purpose};
use crate::stage::{Stage, Transition};
use crate::state::{CompressedNote, ConversationState, FinalReport, ResearchBrief};
use crate::tools::ToolRegistry;
use crate::trace::{TraceCollector, TraceEvent};

/// Keys under which the tasks exchange state through the session context.
pub(crate) mod keys {
    pub const CONVERSATION: &str = "conversation";
    pub const STAGE: &str = "stage";
    pub const CLARIFICATION_QUESTION: &str = "clarification.question";
    pub const BRIEF: &str = "research.brief";
    pub const NOTES: &str = "research.notes";
    pub const ROUNDS: &str = "research.rounds";
    pub const TERMINATION: &str = "research.termination";
    pub const REPORT: &str = "final.report";
    pub const TRACE: &str = "trace.events";
    pub const FAILURE: &str = "run.failure";
}

const BRIEF_PREVIEW_CHARS: usize = 200;

/// The stage agents of one engine, shared by every graph task.
pub struct ResearchServices {
    gate: ClarificationGate,
    brief: BriefSynthesizer,
    supervisor: ResearchSupervisor,
    report: ReportGenerator,
    progress: ProgressCollector,
}

impl ResearchServices {
    pub fn new(
        config: &ResearchConfig,
        model: DynModel,
        tools: ToolRegistry,
        progress: ProgressCollector,
        cancel: CancellationFlag,
    ) -> Self {
        let attempts = config.max_structured_output_retries;
        let models = &config.models;

        let researcher = Researcher::new(
            model.clone(),
            models.research.clone(),
            tools,
            attempts,
            config.max_react_tool_calls,
            config.researcher.clone(),
            cancel.clone(),
        );
        let compressor = Compressor::new(model.clone(), models.compression.clone());

        Self {
            gate: ClarificationGate::new(
                model.clone(),
                models.summarization.clone(),
                attempts,
                config.allow_clarification,
            ),
            brief: BriefSynthesizer::new(model.clone(), models.summarization.clone(), attempts),
            supervisor: ResearchSupervisor::new(
                model.clone(),
                models.research.clone(),
                attempts,
                config.max_concurrent_research_units,
                config.max_researcher_iterations,
                config.max_supervisor_decisions(),
                researcher,
                compressor,
                progress.clone(),
                cancel,
            ),
            report: ReportGenerator::new(
                model,
                models.final_report.clone(),
                attempts,
                config.report.min_section_words,
            ),
            progress,
        }
    }
}

async fn conversation(context: &Context) -> Result<ConversationState, DeepResearchError> {
    context
        .get::<ConversationState>(keys::CONVERSATION)
        .await
        .ok_or_else(|| anyhow!("conversation missing from session context").into())
}

/// Apply `transition` to the stage stored in the context.
async fn advance(context: &Context, transition: Transition) -> Result<Stage, DeepResearchError> {
    let stage: Stage = context.get(keys::STAGE).await.unwrap_or_default();
    let next = stage.next(transition)?;
    context.set(keys::STAGE, next).await;
    Ok(next)
}

async fn record_trace(context: &Context, stage: &str, message: impl Into<String>) {
    let events: Vec<TraceEvent> = context.get(keys::TRACE).await.unwrap_or_default();
    let mut trace = TraceCollector::from_events(events);
    trace.record(stage, message);
    context.set(keys::TRACE, trace.into_events()).await;
}

/// Attach the failure to the session and end the flow.
async fn fail(
    context: &Context,
    purpose: Purpose,
    err: DeepResearchError,
) -> graph_flow::Result<TaskResult> {
    error!(%purpose, error = %err, "research run failed");
    record_trace(context, purpose.as_str(), format!("failed: {err}")).await;
    context
        .set(keys::FAILURE, RunFailure::from_error(purpose, &err))
        .await;
    Ok(TaskResult::new(Some(err.to_string()), NextAction::End))
}

pub struct ClarifyTask {
    services: Arc<ResearchServices>,
}

impl ClarifyTask {
    pub fn new(services: Arc<ResearchServices>) -> Self {
        Self { services }
    }

    async fn step(&self, context: &Context) -> Result<Option<String>, DeepResearchError> {
        let mut conversation = conversation(context).await?;
        let decision = self.services.gate.evaluate(&conversation).await?;
        conversation.record_clarification(&decision);
        context.set(keys::CONVERSATION, &conversation).await;

        if decision.need_clarification {
            advance(context, Transition::AwaitUser).await?;
            context
                .set(keys::CLARIFICATION_QUESTION, decision.question.clone())
                .await;
            self.services.progress.emit(
                ProgressStage::Clarify,
                PartialState {
                    phase: Some("awaiting_user".into()),
                    clarification_question: Some(decision.question.clone()),
                    ..PartialState::default()
                },
            );
            record_trace(context, "clarify", format!("asked: {}", decision.question)).await;
            return Ok(Some(decision.question));
        }

        advance(context, Transition::Proceed).await?;
        self.services.progress.emit(
            ProgressStage::Clarify,
            PartialState {
                phase: Some("proceed".into()),
                verification: Some(decision.verification.clone()).filter(|text| !text.is_empty()),
                ..PartialState::default()
            },
        );
        record_trace(context, "clarify", "no clarification needed").await;
        Ok(None)
    }
}

#[async_trait]
impl Task for ClarifyTask {
    fn id(&self) -> &str {
        "clarify"
    }

    #[instrument(name = "task.clarify", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        match self.step(&context).await {
            Ok(Some(question)) => {
                info!("waiting for the user to answer a clarifying question");
                Ok(TaskResult::new(Some(question), NextAction::WaitForInput))
            }
            Ok(None) => Ok(TaskResult::new(
                Some("Clarification settled".to_string()),
                NextAction::ContinueAndExecute,
            )),
            Err(err) => fail(&context, Purpose::Clarify, err).await,
        }
    }
}

pub struct BriefTask {
    services: Arc<ResearchServices>,
}

impl BriefTask {
    pub fn new(services: Arc<ResearchServices>) -> Self {
        Self { services }
    }

    async fn step(&self, context: &Context) -> Result<ResearchBrief, DeepResearchError> {
        let conversation = conversation(context).await?;
        let brief = self.services.brief.synthesize(&conversation).await?;
        advance(context, Transition::Proceed).await?;
        context.set(keys::BRIEF, &brief).await;

        self.services.progress.emit(
            ProgressStage::Brief,
            PartialState {
                research_brief: Some(brief.as_str().to_string()),
                ..PartialState::default()
            },
        );
        record_trace(
            context,
            "brief",
            preview(brief.as_str(), BRIEF_PREVIEW_CHARS),
        )
        .await;
        Ok(brief)
    }
}

#[async_trait]
impl Task for BriefTask {
    fn id(&self) -> &str {
        "brief"
    }

    #[instrument(name = "task.brief", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        match self.step(&context).await {
            Ok(brief) => {
                debug!(chars = brief.as_str().chars().count(), "brief stored in context");
                Ok(TaskResult::new(
                    Some("Research brief ready".to_string()),
                    NextAction::ContinueAndExecute,
                ))
            }
            Err(err) => fail(&context, Purpose::Brief, err).await,
        }
    }
}

pub struct SupervisorTask {
    services: Arc<ResearchServices>,
}

impl SupervisorTask {
    pub fn new(services: Arc<ResearchServices>) -> Self {
        Self { services }
    }

    async fn step(&self, context: &Context) -> Result<(usize, Termination), DeepResearchError> {
        let brief: ResearchBrief = context
            .get(keys::BRIEF)
            .await
            .ok_or_else(|| anyhow!("research brief missing from session context"))?;
        let events: Vec<TraceEvent> = context.get(keys::TRACE).await.unwrap_or_default();
        let mut trace = TraceCollector::from_events(events);

        let outcome = self.services.supervisor.run(&brief, &mut trace).await?;
        advance(context, Transition::ResearchFinished).await?;

        context.set(keys::NOTES, &outcome.notes).await;
        context.set(keys::ROUNDS, outcome.rounds).await;
        context.set(keys::TERMINATION, outcome.termination).await;
        context.set(keys::TRACE, trace.into_events()).await;

        self.services.progress.emit(
            ProgressStage::Research,
            PartialState {
                phase: Some("complete".into()),
                round: Some(outcome.rounds),
                notes_count: Some(outcome.notes.len()),
                ..PartialState::default()
            },
        );
        Ok((outcome.notes.len(), outcome.termination))
    }
}

#[async_trait]
impl Task for SupervisorTask {
    fn id(&self) -> &str {
        "supervisor"
    }

    #[instrument(name = "task.supervisor", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        match self.step(&context).await {
            Ok((notes, termination)) => Ok(TaskResult::new(
                Some(format!(
                    "Research finished with {notes} note(s) ({})",
                    termination.as_str()
                )),
                NextAction::ContinueAndExecute,
            )),
            Err(err) => fail(&context, Purpose::Supervise, err).await,
        }
    }
}

pub struct ReportTask {
    services: Arc<ResearchServices>,
}

impl ReportTask {
    pub fn new(services: Arc<ResearchServices>) -> Self {
        Self { services }
    }

    async fn step(&self, context: &Context) -> Result<FinalReport, DeepResearchError> {
        let conversation = conversation(context).await?;
        let brief: ResearchBrief = context
            .get(keys::BRIEF)
            .await
            .ok_or_else(|| anyhow!("research brief missing from session context"))?;
        let notes: Vec<CompressedNote> = context.get(keys::NOTES).await.unwrap_or_default();

        let report = self
            .services
            .report
            .generate(&brief, &notes, &conversation)
            .await?;
        advance(context, Transition::ReportWritten).await?;
        context.set(keys::REPORT, &report).await;

        self.services.progress.emit(
            ProgressStage::Report,
            PartialState {
                phase: Some("complete".into()),
                final_report: Some(report.markdown().to_string()),
                ..PartialState::default()
            },
        );
        record_trace(
            context,
            "report",
            format!(
                "report written in {} with {} citation(s)",
                report.language().name(),
                report.citations().len()
            ),
        )
        .await;
        Ok(report)
    }
}

#[async_trait]
impl Task for ReportTask {
    fn id(&self) -> &str {
        "report"
    }

    #[instrument(name = "task.report", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        match self.step(&context).await {
            Ok(report) => Ok(TaskResult::new(
                Some(report.markdown().to_string()),
                NextAction::End,
            )),
            Err(err) => fail(&context, Purpose::Report, err).await,
        }
    }
}
