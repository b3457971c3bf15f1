use std::collections::HashSet;
use std::fmt::Write as _;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::budget::CancellationFlag;
use crate::config::ResearcherTuning;
use crate::events::preview;
use crate::model::{DynModel, ModelRequest, ModelSpec, Purpose, generate_structured};
use crate::prompts;
use crate::state::{Finding, Message};
use crate::tools::{ToolCall, ToolOutput, ToolRegistry};

/// Tool output shown back to the model is cut to this many characters.
const RESULT_PREVIEW_CHARS: usize = 4000;

/// One planning step of a researcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResearcherStep {
    UseTools {
        #[serde(default)]
        calls: Vec<ToolCall>,
    },
    Reflect {
        #[serde(default)]
        reflection: String,
    },
    Finish,
}

/// Bounded tool-calling loop on a single subtopic. Never fails: whatever was
/// gathered when the loop stops becomes the finding.
#[derive(Clone)]
pub struct Researcher {
    model: DynModel,
    spec: ModelSpec,
    tools: ToolRegistry,
    max_attempts: u32,
    max_tool_calls: usize,
    tuning: ResearcherTuning,
    cancel: CancellationFlag,
}

impl Researcher {
    pub fn new(
        model: DynModel,
        spec: ModelSpec,
        tools: ToolRegistry,
        max_attempts: u32,
        max_tool_calls: usize,
        tuning: ResearcherTuning,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            model,
            spec,
            tools,
            max_attempts,
            max_tool_calls,
            tuning,
            cancel,
        }
    }

    #[instrument(name = "researcher.run", skip_all, fields(worker = %worker_id))]
    pub async fn run(&self, worker_id: &str, topic: &str) -> Finding {
        let mut finding = Finding::new(worker_id, topic);
        let _ = writeln!(finding.transcript, "**Topic:** {topic}\n");

        if self.tools.is_empty() {
            record_gap(&mut finding, "no research tools are configured");
            return finding;
        }

        let system = prompts::researcher_system(
            &self.tools.describe(),
            self.tools.instructions(),
            self.max_tool_calls,
        );
        let mut messages = vec![Message::user(prompts::researcher_topic(topic))];
        let mut previous_was_tools = false;
        let mut previous_signature: Option<HashSet<String>> = None;
        let max_steps = self.max_tool_calls.saturating_mul(2) + 2;

        for step in 1..=max_steps {
            if self.cancel.is_cancelled() {
                info!("cancelled; stopping research");
                break;
            }
            if finding.tool_calls >= self.max_tool_calls {
                debug!(calls = finding.tool_calls, "tool budget exhausted");
                break;
            }

            let request = ModelRequest::new(Purpose::Research, self.spec.clone())
                .with_system(system.clone())
                .with_messages(messages.clone());
            let decision =
                match generate_structured::<ResearcherStep>(self.model.as_ref(), request, self.max_attempts)
                    .await
                {
                    Ok(decision) => decision,
                    Err(err) => {
                        warn!(step, error = %err, "researcher planning failed; keeping partial finding");
                        break;
                    }
                };

            messages.push(Message::assistant(
                serde_json::to_string(&decision).unwrap_or_default(),
            ));

            match decision {
                ResearcherStep::Finish => {
                    debug!(step, "researcher finished");
                    break;
                }
                ResearcherStep::Reflect { reflection } => {
                    let _ = writeln!(finding.transcript, "**Reflection:** {}\n", reflection.trim());
                    previous_was_tools = false;
                    messages.push(Message::user(
                        "Reflection noted. Call tools again or finish.",
                    ));
                }
                ResearcherStep::UseTools { .. } if previous_was_tools => {
                    messages.push(Message::user(
                        "Reflect on the previous tool results before calling tools again.",
                    ));
                }
                ResearcherStep::UseTools { calls } if calls.is_empty() => {
                    messages.push(Message::user("use_tools needs at least one call."));
                }
                ResearcherStep::UseTools { mut calls } => {
                    let remaining = self.max_tool_calls - finding.tool_calls;
                    if calls.len() > remaining {
                        debug!(requested = calls.len(), remaining, "truncating tool calls to budget");
                        calls.truncate(remaining);
                    }

                    let (feedback, signature) = self.execute(&mut finding, calls).await;
                    messages.push(Message::user(feedback));
                    previous_was_tools = true;

                    let distinct = finding.distinct_urls().len();
                    if distinct >= self.tuning.sufficient_sources {
                        info!(distinct, "enough distinct sources; stopping early");
                        break;
                    }
                    if let (Some(previous), Some(current)) = (&previous_signature, &signature) {
                        let similarity = jaccard(previous, current);
                        if similarity >= self.tuning.duplicate_threshold {
                            info!(similarity, "consecutive results repeat each other; stopping early");
                            break;
                        }
                    }
                    if signature.is_some() {
                        previous_signature = signature;
                    }
                }
            }
        }

        if !finding.has_results && finding.coverage_gaps.is_empty() {
            record_gap(&mut finding, "no tool results were gathered for this topic");
        }

        info!(
            tool_calls = finding.tool_calls,
            sources = finding.citations.len(),
            gaps = finding.coverage_gaps.len(),
            "research finding ready"
        );
        finding
    }

    /// Run one tool step concurrently. Returns the feedback message for the
    /// model and the signature of what came back, if anything did.
    async fn execute(
        &self,
        finding: &mut Finding,
        calls: Vec<ToolCall>,
    ) -> (String, Option<HashSet<String>>) {
        let mut dispatched = Vec::with_capacity(calls.len());
        for call in calls {
            if self.cancel.is_cancelled() {
                break;
            }
            dispatched.push(call);
        }
        finding.tool_calls += dispatched.len();

        let results = join_all(dispatched.iter().map(|call| self.tools.invoke(call))).await;

        let mut feedback = String::from("Tool results:\n");
        let mut outputs: Vec<&ToolOutput> = Vec::new();
        for (call, result) in dispatched.iter().zip(results.iter()) {
            let _ = writeln!(finding.transcript, "**Tool call:** `{}` {}", call.tool, call.args);
            match result {
                Ok(output) if output.is_empty() => {
                    let _ = writeln!(finding.transcript, "(no content returned)\n");
                    let _ = writeln!(feedback, "- `{}` returned nothing.", call.tool);
                }
                Ok(output) => {
                    finding.has_results = true;
                    let _ = writeln!(finding.transcript, "{}", output.content.trim());
                    for source in &output.sources {
                        let _ = writeln!(finding.transcript, "- {}: {}", source.title, source.url);
                        finding.cite(source.clone());
                    }
                    finding.transcript.push('\n');
                    let _ = writeln!(
                        feedback,
                        "- `{}`:\n{}",
                        call.tool,
                        preview(output.content.trim(), RESULT_PREVIEW_CHARS)
                    );
                    outputs.push(output);
                }
                Err(err) => {
                    let gap = err.to_string();
                    warn!(tool = %call.tool, error = %gap, "tool call failed; recording coverage gap");
                    let _ = writeln!(feedback, "- `{}` failed: {gap}", call.tool);
                    record_gap(finding, gap);
                }
            }
        }

        (feedback, signature(&outputs))
    }
}

fn record_gap(finding: &mut Finding, gap: impl Into<String>) {
    let gap = gap.into();
    let _ = writeln!(finding.transcript, "**Coverage gap:** {gap}\n");
    finding.coverage_gaps.push(gap);
}

/// Source urls of a tool step, or its lowercased words when no url came back.
fn signature(outputs: &[&ToolOutput]) -> Option<HashSet<String>> {
    let urls: HashSet<String> = outputs
        .iter()
        .flat_map(|output| output.sources.iter().map(|source| source.url.clone()))
        .collect();
    if !urls.is_empty() {
        return Some(urls);
    }
    let tokens: HashSet<String> = outputs
        .iter()
        .flat_map(|output| output.content.split_whitespace())
        .map(str::to_lowercase)
        .collect();
    (!tokens.is_empty()).then_some(tokens)
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::error::ToolError;
    use crate::state::SourceRef;
    use crate::stub::{StubModel, StubReply};
    use crate::tools::{DynTool, Tool};

    struct Fixed;

    #[async_trait]
    impl Tool for Fixed {
        fn name(&self) -> &str {
            "web_search"
        }

        fn description(&self) -> &str {
            "Search the web."
        }

        async fn invoke(&self, _args: Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::new("same page")
                .with_source(SourceRef::new("Same", "https://same.example")))
        }
    }

    fn researcher(model: Arc<StubModel>, max_calls: usize) -> Researcher {
        Researcher::new(
            model,
            ModelSpec::new("stub", 128),
            ToolRegistry::new([Arc::new(Fixed) as DynTool]),
            2,
            max_calls,
            ResearcherTuning::default(),
            CancellationFlag::new(),
        )
    }

    fn tools_step(count: usize) -> StubReply {
        let calls: Vec<Value> = (0..count)
            .map(|i| json!({"tool": "web_search", "args": {"query": format!("q{i}")}}))
            .collect();
        StubReply::json(json!({"action": "use_tools", "calls": calls}))
    }

    #[tokio::test]
    async fn tool_calls_never_exceed_budget() {
        let model = Arc::new(
            StubModel::new()
                .with_reply(Purpose::Research, tools_step(5))
                .with_reply(Purpose::Research, StubReply::json(json!({"action": "finish"}))),
        );

        let finding = researcher(model, 3).run("r1-w1", "topic").await;
        assert_eq!(finding.tool_calls, 3);
        assert!(finding.has_results);
        assert_eq!(finding.citations.len(), 1);
    }

    #[tokio::test]
    async fn repeated_results_stop_the_loop() {
        let model = Arc::new(
            StubModel::new()
                .with_reply(Purpose::Research, tools_step(1))
                .with_reply(Purpose::Research, tools_step(1))
                .with_reply(
                    Purpose::Research,
                    StubReply::json(json!({"action": "reflect", "reflection": "same again"})),
                )
                .with_reply(Purpose::Research, tools_step(1)),
        );

        let finding = researcher(model.clone(), 10).run("r1-w1", "topic").await;

        // The second tool step was refused, the third repeated the first.
        assert_eq!(finding.tool_calls, 2);
        assert_eq!(model.calls(Purpose::Research), 4);
    }

    #[tokio::test]
    async fn unknown_tools_become_gaps() {
        let model = Arc::new(
            StubModel::new()
                .with_reply(
                    Purpose::Research,
                    StubReply::json(json!({"action": "use_tools", "calls": [{"tool": "crawl"}]})),
                )
                .with_reply(Purpose::Research, StubReply::json(json!({"action": "finish"}))),
        );

        let finding = researcher(model, 4).run("r1-w1", "topic").await;
        assert!(!finding.has_results);
        assert_eq!(finding.coverage_gaps, ["tool `crawl` is not available"]);
        assert!(finding.transcript.contains("**Coverage gap:**"));
    }

    #[test]
    fn jaccard_of_disjoint_sets_is_zero() {
        let a: HashSet<String> = ["x".to_string()].into();
        let b: HashSet<String> = ["y".to_string()].into();
        assert_eq!(jaccard(&a, &b), 0.0);
        assert_eq!(jaccard(&a, &a), 1.0);
    }
}
