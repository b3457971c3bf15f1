use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{Instrument, info, info_span, instrument, warn};

use crate::agents::{Compressor, Researcher};
use crate::budget::CancellationFlag;
use crate::error::DeepResearchError;
use crate::events::{PartialState, ProgressCollector, ProgressStage, preview};
use crate::metrics;
use crate::model::{DynModel, ModelRequest, ModelSpec, Purpose, generate_structured};
use crate::prompts;
use crate::stage::{Stage, Transition};
use crate::state::{CompressedNote, DelegationPlan, Message, ResearchBrief};
use crate::trace::TraceCollector;

const NOTE_PREVIEW_CHARS: usize = 600;

/// One supervisor decision. Exactly one kind per model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SupervisorDecision {
    Reflect {
        #[serde(default)]
        reflection: String,
    },
    ConductResearch {
        #[serde(default)]
        topics: Vec<String>,
    },
    ResearchComplete,
}

/// Why the research loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The supervisor declared research complete.
    Signalled,
    IterationCap,
    /// The planning call budget ran out.
    DecisionCap,
    /// Planning output stayed unusable after at least one round.
    PlanningFailed,
    Cancelled,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Signalled => "signalled",
            Termination::IterationCap => "iteration_cap",
            Termination::DecisionCap => "decision_cap",
            Termination::PlanningFailed => "planning_failed",
            Termination::Cancelled => "cancelled",
        }
    }
}

/// Append-only notes shared by the workers of a run, plus the round and
/// dispatch counters.
#[derive(Debug, Default)]
pub struct NotesLedger {
    notes: Mutex<Vec<CompressedNote>>,
    rounds: AtomicUsize,
    dispatched: AtomicUsize,
}

impl NotesLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, note: CompressedNote) -> usize {
        let mut notes = self.notes.lock().await;
        notes.push(note);
        notes.len()
    }

    pub async fn len(&self) -> usize {
        self.notes.lock().await.len()
    }

    pub async fn snapshot(&self) -> Vec<CompressedNote> {
        self.notes.lock().await.clone()
    }

    /// Start the next round and return its 1-based number.
    fn begin_round(&self, tasks: usize) -> usize {
        self.dispatched.fetch_add(tasks, Ordering::SeqCst);
        self.rounds.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn rounds(&self) -> usize {
        self.rounds.load(Ordering::SeqCst)
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOutcome {
    /// Notes in completion order.
    pub notes: Vec<CompressedNote>,
    pub rounds: usize,
    pub dispatched: usize,
    pub termination: Termination,
}

/// Drives delegation rounds until research is complete or a budget runs out.
#[derive(Clone)]
pub struct ResearchSupervisor {
    model: DynModel,
    spec: ModelSpec,
    max_attempts: u32,
    max_units: usize,
    max_iterations: usize,
    max_decisions: usize,
    researcher: Arc<Researcher>,
    compressor: Arc<Compressor>,
    progress: ProgressCollector,
    cancel: CancellationFlag,
}

impl ResearchSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: DynModel,
        spec: ModelSpec,
        max_attempts: u32,
        max_units: usize,
        max_iterations: usize,
        max_decisions: usize,
        researcher: Researcher,
        compressor: Compressor,
        progress: ProgressCollector,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            model,
            spec,
            max_attempts,
            max_units: max_units.max(1),
            max_iterations: max_iterations.max(1),
            max_decisions: max_decisions.max(1),
            researcher: Arc::new(researcher),
            compressor: Arc::new(compressor),
            progress,
            cancel,
        }
    }

    #[instrument(name = "supervisor.run", skip_all)]
    pub async fn run(
        &self,
        brief: &ResearchBrief,
        trace: &mut TraceCollector,
    ) -> Result<SupervisorOutcome, DeepResearchError> {
        let ledger = Arc::new(NotesLedger::new());
        let mut stage = Stage::Researching;
        let mut messages = vec![Message::user(prompts::supervisor_brief(brief.as_str()))];
        let system = prompts::supervisor_system(self.max_units, self.max_iterations);
        let mut decisions = 0usize;
        let mut last_was_reflect = false;

        let termination = loop {
            if self.cancel.is_cancelled() {
                info!("cancelled; no further rounds");
                break Termination::Cancelled;
            }
            if ledger.rounds() >= self.max_iterations {
                info!(rounds = ledger.rounds(), "iteration cap reached");
                break Termination::IterationCap;
            }
            if decisions >= self.max_decisions {
                if ledger.rounds() == 0 {
                    self.fallback_round(brief, &ledger, &mut stage, &mut messages, trace)
                        .await?;
                }
                warn!(decisions, "supervisor decision budget exhausted");
                break Termination::DecisionCap;
            }
            decisions += 1;

            let request = ModelRequest::new(Purpose::Supervise, self.spec.clone())
                .with_system(system.clone())
                .with_messages(messages.clone());
            let decision = match generate_structured::<SupervisorDecision>(
                self.model.as_ref(),
                request,
                self.max_attempts,
            )
            .await
            {
                Ok(decision) => decision,
                Err(err) if ledger.rounds() == 0 => {
                    warn!(error = %err, "planning failed before any round; delegating the brief");
                    self.fallback_round(brief, &ledger, &mut stage, &mut messages, trace)
                        .await?;
                    last_was_reflect = false;
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "planning failed; ending research with current notes");
                    trace.record("supervisor", format!("planning failed: {err}"));
                    break Termination::PlanningFailed;
                }
            };

            messages.push(Message::assistant(
                serde_json::to_string(&decision).unwrap_or_default(),
            ));

            match decision {
                SupervisorDecision::Reflect { .. } if last_was_reflect => {
                    messages.push(Message::user(
                        "You already reflected. Choose conduct_research or research_complete.",
                    ));
                }
                SupervisorDecision::Reflect { reflection } => {
                    last_was_reflect = true;
                    trace.record("supervisor", format!("reflection: {}", preview(reflection.trim(), 200)));
                    messages.push(Message::user("Reflection noted. Choose the next action."));
                }
                SupervisorDecision::ConductResearch { topics } => {
                    last_was_reflect = false;
                    match DelegationPlan::new(topics, self.max_units) {
                        Some(plan) => {
                            let feedback = self.run_round(plan, &ledger, &mut stage, trace).await?;
                            messages.push(Message::user(feedback));
                        }
                        None => messages.push(Message::user(
                            "conduct_research needs at least one non-empty topic.",
                        )),
                    }
                }
                SupervisorDecision::ResearchComplete if ledger.rounds() == 0 => {
                    info!("completion signalled before any research; delegating the brief");
                    self.fallback_round(brief, &ledger, &mut stage, &mut messages, trace)
                        .await?;
                    last_was_reflect = false;
                }
                SupervisorDecision::ResearchComplete => break Termination::Signalled,
            }
        };

        stage.next(Transition::ResearchFinished)?;
        let notes = ledger.snapshot().await;
        trace.record(
            "supervisor",
            format!(
                "research finished after {} round(s) with {} note(s): {}",
                ledger.rounds(),
                notes.len(),
                termination.as_str()
            ),
        );

        Ok(SupervisorOutcome {
            rounds: ledger.rounds(),
            dispatched: ledger.dispatched(),
            notes,
            termination,
        })
    }

    async fn fallback_round(
        &self,
        brief: &ResearchBrief,
        ledger: &Arc<NotesLedger>,
        stage: &mut Stage,
        messages: &mut Vec<Message>,
        trace: &mut TraceCollector,
    ) -> Result<(), DeepResearchError> {
        if let Some(plan) = DelegationPlan::new(vec![brief.as_str().to_string()], self.max_units) {
            let feedback = self.run_round(plan, ledger, stage, trace).await?;
            messages.push(Message::user(feedback));
        }
        Ok(())
    }

    /// Dispatch one round and wait for every worker; returns the feedback
    /// message for the next planning call.
    async fn run_round(
        &self,
        plan: DelegationPlan,
        ledger: &Arc<NotesLedger>,
        stage: &mut Stage,
        trace: &mut TraceCollector,
    ) -> Result<String, DeepResearchError> {
        *stage = stage.next(Transition::Delegate)?;
        let round = ledger.begin_round(plan.len());
        let started = Instant::now();
        info!(round, tasks = plan.len(), "delegation round started");
        trace.record(
            "supervisor",
            format!("round {round}: {} researcher(s): {}", plan.len(), plan.topics().join(" | ")),
        );

        let handles: Vec<_> = plan
            .topics()
            .iter()
            .enumerate()
            .map(|(idx, topic)| {
                let worker_id = format!("r{round}-w{}", idx + 1);
                let researcher = Arc::clone(&self.researcher);
                let compressor = Arc::clone(&self.compressor);
                let ledger = Arc::clone(ledger);
                let task_worker = worker_id.clone();
                let task_topic = topic.clone();
                let span = info_span!("worker", worker = %worker_id);
                let handle = tokio::spawn(
                    async move {
                        let finding = researcher.run(&task_worker, &task_topic).await;
                        let note = compressor.compress(finding).await;
                        ledger.append(note.clone()).await;
                        note
                    }
                    .instrument(span),
                );
                (worker_id, topic.clone(), handle)
            })
            .collect();

        let joined = join_all(handles.into_iter().map(|(worker_id, topic, handle)| async move {
            (worker_id, topic, handle.await)
        }))
        .await;

        let mut round_notes = Vec::with_capacity(joined.len());
        for (worker_id, topic, result) in joined {
            match result {
                Ok(note) => round_notes.push(note),
                Err(err) => {
                    warn!(worker = %worker_id, error = %err, "researcher task aborted");
                    let note = CompressedNote::gap(worker_id, topic, format!("researcher task aborted: {err}"));
                    ledger.append(note.clone()).await;
                    round_notes.push(note);
                }
            }
        }

        *stage = stage.next(Transition::RoundComplete)?;
        let elapsed = started.elapsed().as_millis() as u64;
        metrics::record_round(round, plan.len(), elapsed);

        let notes_count = ledger.len().await;
        let latest = ledger
            .snapshot()
            .await
            .last()
            .map(|note| preview(&note.text, 150));
        self.progress.emit(
            ProgressStage::Research,
            PartialState {
                phase: Some("round_complete".into()),
                round: Some(round),
                notes_count: Some(notes_count),
                latest_note: latest,
                ..PartialState::default()
            },
        );
        info!(round, notes = notes_count, elapsed_ms = elapsed, "delegation round finished");

        let mut feedback = format!(
            "Delegation round {round} finished with {} note(s). Rounds used: {round} of {}.\n",
            round_notes.len(),
            self.max_iterations
        );
        for note in &round_notes {
            let _ = writeln!(
                feedback,
                "\n[{}] {} ({} source(s))\n{}",
                note.worker_id,
                note.topic,
                note.sources.len(),
                preview(&note.text, NOTE_PREVIEW_CHARS)
            );
            for gap in &note.coverage_gaps {
                let _ = writeln!(feedback, "Coverage gap: {gap}");
            }
        }
        feedback.push_str("\nChoose the next action.");
        Ok(feedback)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::ResearcherTuning;
    use crate::stub::{StubModel, StubReply};
    use crate::tools::ToolRegistry;

    fn supervisor(model: Arc<StubModel>, max_units: usize, max_iterations: usize) -> ResearchSupervisor {
        let spec = ModelSpec::new("stub", 128);
        let cancel = CancellationFlag::new();
        ResearchSupervisor::new(
            model.clone(),
            spec.clone(),
            2,
            max_units,
            max_iterations,
            max_iterations * 2 + 2,
            Researcher::new(
                model.clone(),
                spec.clone(),
                ToolRegistry::default(),
                2,
                4,
                ResearcherTuning::default(),
                cancel.clone(),
            ),
            Compressor::new(model, spec),
            ProgressCollector::disabled(),
            cancel,
        )
    }

    #[tokio::test]
    async fn completion_before_any_round_still_delegates_the_brief() {
        let model = Arc::new(StubModel::new().with_reply(
            Purpose::Supervise,
            StubReply::json(json!({"action": "research_complete"})),
        ));
        let brief = ResearchBrief::new("Survey async runtimes in Rust");
        let mut trace = TraceCollector::new();

        let outcome = supervisor(model, 3, 4).run(&brief, &mut trace).await.unwrap();
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.notes.len(), 1);
        assert_eq!(outcome.notes[0].topic, brief.as_str());
        assert!(!outcome.notes[0].has_findings());
        assert_eq!(outcome.termination, Termination::Signalled);
    }

    #[tokio::test]
    async fn second_reflection_in_a_row_is_not_executed() {
        let model = Arc::new(StubModel::new());
        for reply in [
            json!({"action": "reflect", "reflection": "scope first"}),
            json!({"action": "reflect", "reflection": "still thinking"}),
            json!({"action": "conduct_research", "topics": ["tokio", "async-std", "smol"]}),
        ] {
            model.push_reply(Purpose::Supervise, StubReply::json(reply));
        }
        let brief = ResearchBrief::new("Compare async runtimes");
        let mut trace = TraceCollector::new();

        let outcome = supervisor(model.clone(), 2, 4)
            .run(&brief, &mut trace)
            .await
            .unwrap();
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.dispatched, 2);
        assert_eq!(outcome.notes.len(), 2);
        assert_eq!(outcome.termination, Termination::Signalled);
        assert_eq!(model.calls(Purpose::Supervise), 4);
        assert_eq!(
            trace.events().iter().filter(|event| event.message.starts_with("reflection:")).count(),
            1
        );
    }

    #[tokio::test]
    async fn decision_budget_bounds_planning_calls() {
        let model = Arc::new(StubModel::new());
        for _ in 0..5 {
            model.push_reply(
                Purpose::Supervise,
                StubReply::json(json!({"action": "reflect", "reflection": "not yet"})),
            );
        }
        let brief = ResearchBrief::new("Survey async runtimes in Rust");
        let mut trace = TraceCollector::new();
        let mut capped = supervisor(model.clone(), 2, 4);
        capped.max_decisions = 3;

        let outcome = capped.run(&brief, &mut trace).await.unwrap();
        assert_eq!(model.calls(Purpose::Supervise), 3);
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.termination, Termination::DecisionCap);
    }
}
