use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deepresearch_engine::stub::{StubModel, StubReply, StubSearchTool};
use deepresearch_engine::{
    CancellationFlag, ClarificationResponder, CompletedSession, DynTool, Language,
    NO_FURTHER_DETAILS, ProgressCollector, ProgressEvent, ProgressStage, Purpose, ResearchConfig,
    ResearchEngine, ResumeOptions, SessionOptions, SessionOutcome, SourceRef, Termination, Tool,
    ToolError, ToolOutput, ToolRegistry, drain, load_conversation,
};
use serde_json::{Value, json};
use tokio::sync::Barrier;

fn config(units: usize, iterations: usize) -> ResearchConfig {
    let mut config = ResearchConfig::default();
    config.allow_clarification = false;
    config.max_concurrent_research_units = units;
    config.max_researcher_iterations = iterations;
    config.report.min_section_words = 0;
    config.logging.session_log = false;
    config
}

fn engine(config: ResearchConfig, model: Arc<StubModel>, tool: DynTool) -> ResearchEngine {
    ResearchEngine::new(config, model).with_tools(ToolRegistry::new([tool]))
}

async fn complete(engine: &ResearchEngine, question: &str) -> CompletedSession {
    engine
        .run(SessionOptions::new(question))
        .await
        .expect("research run should succeed")
        .into_completed()
        .expect("run should not pause for clarification")
}

/// Holds every call until the barrier's party count is in flight at once.
struct BarrierTool {
    barrier: Barrier,
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Tool for BarrierTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web."
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        self.barrier.wait().await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let query = args["query"].as_str().unwrap_or_default().to_string();
        Ok(ToolOutput::new(format!("notes on {query}")).with_source(SourceRef::new(
            query.clone(),
            format!("https://barrier.example/{query}"),
        )))
    }
}

struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web."
    }

    async fn invoke(&self, _args: Value) -> Result<ToolOutput, ToolError> {
        Err(ToolError::failed("web_search", "upstream returned 503"))
    }
}

struct FixedResponder(&'static str);

#[async_trait]
impl ClarificationResponder for FixedResponder {
    async fn answer(&self, _question: &str) -> Option<String> {
        Some(self.0.to_string())
    }
}

fn ask_question() -> StubReply {
    StubReply::json(json!({
        "need_clarification": true,
        "question": "Which time period should the report cover?",
        "verification": ""
    }))
}

#[tokio::test]
async fn comparison_splits_into_two_parallel_workers() {
    let model = Arc::new(StubModel::new());
    let engine = engine(config(2, 3), model.clone(), Arc::new(StubSearchTool));

    let completed = complete(&engine, "Compare Rust and Go").await;

    assert_eq!(completed.rounds, 1);
    assert_eq!(completed.termination, Termination::Signalled);
    assert_eq!(completed.notes.len(), 2);
    let topics: BTreeSet<&str> = completed
        .notes
        .iter()
        .map(|note| note.topic.split(':').next().unwrap_or_default())
        .collect();
    assert_eq!(topics, BTreeSet::from(["Go", "Rust"]));

    let citations = completed.report.citations();
    assert_eq!(citations.len(), 4);
    let ids: Vec<usize> = citations.iter().map(|citation| citation.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert!(completed.report.markdown().contains("\n### Sources\n\n[1] "));
    assert_eq!(model.calls(Purpose::Clarify), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn round_runs_up_to_the_concurrency_cap_in_parallel() {
    let model = Arc::new(StubModel::new().with_reply(
        Purpose::Supervise,
        StubReply::json(json!({
            "action": "conduct_research",
            "topics": ["alpha", "beta", "gamma", "delta", "epsilon"]
        })),
    ));
    let tool = Arc::new(BarrierTool {
        barrier: Barrier::new(3),
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let engine = engine(config(3, 2), model, tool.clone());

    // Workers only get past the barrier if all three run at the same time.
    let completed = tokio::time::timeout(
        Duration::from_secs(10),
        complete(&engine, "Survey of Greek letters"),
    )
    .await
    .expect("workers of one round must run concurrently");

    assert_eq!(completed.rounds, 1);
    assert_eq!(completed.notes.len(), 3);
    assert_eq!(tool.peak.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn single_iteration_allows_exactly_one_round() {
    let delegate = || {
        StubReply::json(json!({"action": "conduct_research", "topics": ["Rust ownership"]}))
    };
    let model = Arc::new(
        StubModel::new()
            .with_reply(Purpose::Supervise, delegate())
            .with_reply(Purpose::Supervise, delegate())
            .with_reply(Purpose::Supervise, delegate()),
    );
    let engine = engine(config(5, 1), model.clone(), Arc::new(StubSearchTool));

    let completed = complete(&engine, "How does Rust ownership work?").await;

    assert_eq!(completed.rounds, 1);
    assert_eq!(completed.termination, Termination::IterationCap);
    assert_eq!(model.calls(Purpose::Supervise), 1);
}

#[tokio::test]
async fn failing_tools_leave_a_gap_in_the_report() {
    let model = Arc::new(StubModel::new());
    let engine = engine(config(2, 2), model, Arc::new(FailingTool));

    let completed = complete(&engine, "History of the Rust language").await;

    assert_eq!(completed.notes.len(), 1);
    let note = &completed.notes[0];
    assert!(!note.has_findings());
    assert_eq!(
        note.coverage_gaps,
        ["tool `web_search` failed: upstream returned 503"]
    );

    let markdown = completed.report.markdown();
    assert!(markdown.contains("## Research Coverage Gaps"));
    assert!(markdown.contains("upstream returned 503"));
    assert!(completed.report.citations().is_empty());
}

#[tokio::test]
async fn chinese_question_gets_a_chinese_report() {
    let model = Arc::new(StubModel::new());
    let engine = engine(config(2, 2), model, Arc::new(StubSearchTool));

    let completed = complete(&engine, "比较 Rust 和 Go 的并发模型").await;

    assert_eq!(completed.notes.len(), 2);
    assert_eq!(completed.report.language(), Language::Chinese);
    let markdown = completed.report.markdown();
    assert!(markdown.starts_with("# 研究报告"));
    assert!(markdown.contains("## 概述"));
    assert!(markdown.contains("### 信息源\n\n[1] "));
    assert!(!markdown.contains("### Sources"));
}

#[tokio::test]
async fn compression_keeps_every_source() {
    let model = Arc::new(StubModel::new().with_reply(
        Purpose::Compress,
        StubReply::text("Rust ownership moves values between bindings."),
    ));
    let engine = engine(config(1, 1), model, Arc::new(StubSearchTool));

    let completed = complete(&engine, "How does Rust ownership work?").await;

    let note = &completed.notes[0];
    assert!(!note.verbatim_fallback);
    assert_eq!(note.sources.len(), 2);
    for source in &note.sources {
        assert!(note.text.contains(&source.url), "{} dropped", source.url);
    }
}

#[tokio::test]
async fn clarification_pauses_and_resumes() {
    let mut config = config(1, 1);
    config.allow_clarification = true;
    let model = Arc::new(StubModel::new().with_reply(Purpose::Clarify, ask_question()));
    let engine = engine(config, model.clone(), Arc::new(StubSearchTool));

    let outcome = engine
        .run(SessionOptions::new("Tell me about Rust").with_session_id("clarify-session"))
        .await
        .unwrap();
    let SessionOutcome::AwaitingClarification { session_id, question } = outcome else {
        panic!("expected the run to pause for clarification");
    };
    assert_eq!(session_id, "clarify-session");
    assert_eq!(question, "Which time period should the report cover?");

    let completed = engine
        .resume(ResumeOptions::new(&session_id).with_answer("The last five years"))
        .await
        .unwrap()
        .into_completed()
        .expect("resumed run should complete");
    assert_eq!(completed.rounds, 1);
    assert_eq!(model.calls(Purpose::Clarify), 2);

    let conversation = load_conversation(engine.storage().as_ref(), &session_id)
        .await
        .unwrap();
    assert!(
        conversation
            .messages()
            .iter()
            .any(|message| message.content == "The last five years")
    );

    // The gate never asks twice: the settled session cannot be resumed again.
    assert!(
        engine
            .resume(ResumeOptions::new(&session_id))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn empty_answer_continues_with_the_original_question() {
    let mut config = config(1, 1);
    config.allow_clarification = true;
    let model = Arc::new(StubModel::new().with_reply(Purpose::Clarify, ask_question()));
    let engine = engine(config, model, Arc::new(StubSearchTool))
        .with_responder(Arc::new(FixedResponder("  ")));

    let completed = complete(&engine, "Tell me about Rust").await;

    let conversation = load_conversation(engine.storage().as_ref(), &completed.session_id)
        .await
        .unwrap();
    let contents: Vec<&str> = conversation
        .messages()
        .iter()
        .map(|message| message.content.as_str())
        .collect();
    assert!(contents.contains(&NO_FURTHER_DETAILS));
    assert!(contents.contains(&"Which time period should the report cover?"));
}

#[tokio::test]
async fn progress_events_follow_the_stages_and_close() {
    let (collector, receiver) = ProgressCollector::new();
    let model = Arc::new(StubModel::new());
    let engine = engine(config(2, 2), model, Arc::new(StubSearchTool)).with_progress(collector);

    let observer = tokio::spawn(async move {
        let mut events: Vec<ProgressEvent> = Vec::new();
        drain(receiver, |event: &ProgressEvent| events.push(event.clone())).await;
        events
    });

    complete(&engine, "Compare Rust and Go").await;
    drop(engine);
    let events = observer.await.unwrap();

    let stages: Vec<ProgressStage> = events.iter().map(|event| event.stage).collect();
    assert_eq!(stages.first(), Some(&ProgressStage::Clarify));
    assert_eq!(stages[1], ProgressStage::Brief);
    assert_eq!(stages.last(), Some(&ProgressStage::Report));
    assert!(stages.contains(&ProgressStage::Research));
    assert!(
        events
            .windows(2)
            .all(|pair| pair[0].sequence < pair[1].sequence)
    );
    let final_report = events
        .last()
        .and_then(|event| event.state.final_report.clone())
        .unwrap_or_default();
    assert!(final_report.starts_with("# Research Report"));
}

#[tokio::test]
async fn report_retries_exhausted_fail_the_run() {
    let model = Arc::new(
        StubModel::new()
            .with_reply(Purpose::Report, StubReply::text(""))
            .with_reply(Purpose::Report, StubReply::text("no title"))
            .with_reply(Purpose::Report, StubReply::text("")),
    );
    let engine = engine(config(1, 1), model.clone(), Arc::new(StubSearchTool));

    let err = engine
        .run(SessionOptions::new("How does Rust ownership work?"))
        .await
        .unwrap_err();

    assert!(err.is_fatal_output_failure(), "unexpected error: {err}");
    assert_eq!(model.calls(Purpose::Report), 3);
}

#[tokio::test]
async fn cancelled_run_still_writes_a_report() {
    let cancel = CancellationFlag::new();
    cancel.cancel();
    let model = Arc::new(StubModel::new());
    let engine =
        engine(config(2, 2), model.clone(), Arc::new(StubSearchTool)).with_cancellation(cancel);

    let completed = complete(&engine, "How does Rust ownership work?").await;

    assert_eq!(completed.termination, Termination::Cancelled);
    assert_eq!(completed.rounds, 0);
    assert!(completed.notes.is_empty());
    assert_eq!(model.calls(Purpose::Supervise), 0);
    assert!(completed.report.markdown().starts_with("# Research Report"));
}

#[tokio::test]
async fn empty_question_is_rejected() {
    let engine = engine(
        config(1, 1),
        Arc::new(StubModel::new()),
        Arc::new(StubSearchTool),
    );
    assert!(engine.run(SessionOptions::new("   ")).await.is_err());
}
