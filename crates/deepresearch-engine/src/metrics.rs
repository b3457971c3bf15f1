use anyhow::Result;
use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

use crate::model::Purpose;

struct EngineMetrics {
    rounds: Counter<u64>,
    dispatched: Counter<u64>,
    round_duration_ms: Histogram<f64>,
    tool_calls: Counter<u64>,
    compression_fallbacks: Counter<u64>,
    structured_retries: Counter<u64>,
}

static METRICS: OnceCell<EngineMetrics> = OnceCell::new();

fn handles() -> &'static EngineMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("deepresearch.engine");
        EngineMetrics {
            rounds: meter
                .u64_counter("research_rounds_total")
                .with_description("Delegation rounds executed by the supervisor")
                .init(),
            dispatched: meter
                .u64_counter("research_tasks_total")
                .with_description("Researcher tasks dispatched")
                .init(),
            round_duration_ms: meter
                .f64_histogram("research_round_duration_ms")
                .with_description("Wall time of one delegation round in milliseconds")
                .init(),
            tool_calls: meter
                .u64_counter("tool_calls_total")
                .with_description("Tool invocations by tool and status")
                .init(),
            compression_fallbacks: meter
                .u64_counter("compression_fallbacks_total")
                .with_description("Findings passed through verbatim because compression failed")
                .init(),
            structured_retries: meter
                .u64_counter("structured_output_retries_total")
                .with_description("Structured-output attempts beyond the first, by stage")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) -> Result<()> {
    if std::env::var("DEEPRESEARCH_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "DEEPRESEARCH_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export engine metrics."
        );
    }
    Ok(())
}

/// Record one finished delegation round (no-op if no provider installed).
pub fn record_round(round: usize, tasks: usize, duration_ms: u64) {
    let metrics = handles();
    let attrs = [KeyValue::new("round", round as i64)];
    metrics.rounds.add(1, &attrs);
    metrics.dispatched.add(tasks as u64, &attrs);
    metrics.round_duration_ms.record(duration_ms as f64, &attrs);
}

pub fn record_tool_call(tool: &str, status: &'static str) {
    handles().tool_calls.add(
        1,
        &[
            KeyValue::new("tool", tool.to_string()),
            KeyValue::new("status", status),
        ],
    );
}

pub fn record_compression_fallback() {
    handles().compression_fallbacks.add(1, &[]);
}

pub fn record_structured_retry(purpose: Purpose) {
    handles()
        .structured_retries
        .add(1, &[KeyValue::new("stage", purpose.as_str())]);
}
