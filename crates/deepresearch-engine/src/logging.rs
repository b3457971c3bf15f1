//! JSONL session log with secret redaction and retention.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::warn;

const LOG_DIR_ENV: &str = "DEEPRESEARCH_LOG_DIR";
const RETENTION_ENV: &str = "DEEPRESEARCH_LOG_RETENTION_DAYS";
const DEFAULT_LOG_DIR: &str = "data/logs";
const DEFAULT_RETENTION_DAYS: u64 = 90;

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key",
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "secret",
            Regex::new(r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid secret regex"),
        ),
        (
            "bearer",
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
        (
            "sk_token",
            Regex::new(r"(sk-[A-Za-z0-9]{16,})").expect("invalid sk_token regex"),
        ),
        (
            "tavily_token",
            Regex::new(r"(tvly-[A-Za-z0-9\-]{16,})").expect("invalid tavily regex"),
        ),
    ]
});

/// What a finished session leaves behind in the log.
#[derive(Debug, Clone, Default)]
pub struct SessionLogInput {
    pub session_id: String,
    pub question: String,
    pub brief: Option<String>,
    pub rounds: usize,
    pub termination: Option<String>,
    pub sources: Vec<String>,
    pub coverage_gaps: Vec<String>,
    pub report_chars: usize,
    pub trace_path: Option<String>,
}

#[derive(Serialize)]
struct SessionLogRecord {
    timestamp: String,
    session_id: String,
    question: String,
    brief: Option<String>,
    rounds: usize,
    termination: Option<String>,
    sources: Vec<String>,
    coverage_gaps: Vec<String>,
    report_chars: usize,
    trace_path: Option<String>,
    redactions: Vec<String>,
}

#[derive(Serialize)]
struct AuditLogRecord {
    timestamp: String,
    session_id: String,
    redactions: Vec<String>,
}

fn log_base_dir() -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR))
}

fn retention_days() -> u64 {
    std::env::var(RETENTION_ENV)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", serde_json::to_string(value)?)
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn sanitize_text(input: &str, redactions: &mut BTreeSet<String>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .into_owned();
        if matched {
            redactions.insert((*name).to_string());
        }
    }
    output
}

/// Append a record for a finished session under `DEEPRESEARCH_LOG_DIR`.
pub fn log_session_completion(input: SessionLogInput) -> Result<PathBuf> {
    let base_dir = log_base_dir();
    let path = log_session_completion_in(&base_dir, input)?;
    enforce_retention(&base_dir, retention_days())?;
    Ok(path)
}

/// Append a record under `base_dir/YYYY/MM/session.jsonl`, returning the file
/// written to. Redactions are mirrored to `audit.jsonl` next to it.
pub fn log_session_completion_in(base_dir: &Path, input: SessionLogInput) -> Result<PathBuf> {
    let timestamp = Utc::now();
    let mut redactions = BTreeSet::new();

    let question = sanitize_text(&input.question, &mut redactions);
    let brief = input
        .brief
        .as_deref()
        .map(|value| sanitize_text(value, &mut redactions));
    let coverage_gaps = input
        .coverage_gaps
        .iter()
        .map(|gap| sanitize_text(gap, &mut redactions))
        .collect();
    let sources = input
        .sources
        .iter()
        .map(|source| sanitize_text(source, &mut redactions))
        .collect();

    let record = SessionLogRecord {
        timestamp: timestamp.to_rfc3339(),
        session_id: input.session_id.clone(),
        question,
        brief,
        rounds: input.rounds,
        termination: input.termination,
        sources,
        coverage_gaps,
        report_chars: input.report_chars,
        trace_path: input.trace_path,
        redactions: redactions.into_iter().collect(),
    };

    let month_dir = base_dir
        .join(format!("{:04}", timestamp.year()))
        .join(format!("{:02}", timestamp.month()));
    let session_log_path = month_dir.join("session.jsonl");
    append_json_line(&session_log_path, &record)?;

    if !record.redactions.is_empty() {
        let audit = AuditLogRecord {
            timestamp: record.timestamp.clone(),
            session_id: input.session_id.clone(),
            redactions: record.redactions.clone(),
        };
        append_json_line(&month_dir.join("audit.jsonl"), &audit)?;
        warn!(
            session_id = %input.session_id,
            fields = ?record.redactions,
            "redacted potential secrets from session log"
        );
    }

    Ok(session_log_path)
}

fn enforce_retention(base_dir: &Path, retention: u64) -> Result<()> {
    if retention == 0 || !base_dir.exists() {
        return Ok(());
    }
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention.saturating_mul(86_400)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    prune_directory(base_dir, cutoff)
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path).ok();
            }
        } else if metadata.is_file()
            && metadata
                .modified()
                .map(|time| time < cutoff)
                .unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn session_log_is_redacted_and_audited() -> Result<()> {
        let temp = tempfile::tempdir()?;

        let path = log_session_completion_in(
            temp.path(),
            SessionLogInput {
                session_id: "session-a".into(),
                question: "Research with api_key=abcd1234".into(),
                brief: Some("I want a comprehensive report".into()),
                rounds: 2,
                termination: Some("signalled".into()),
                sources: vec!["https://example.com/?token=sk-abcdef1234567890XYZ".into()],
                coverage_gaps: vec!["web_search failed: timeout".into()],
                report_chars: 1200,
                trace_path: None,
            },
        )?;

        let line = fs::read_to_string(&path)?;
        let record: Value = serde_json::from_str(line.trim())?;
        assert_eq!(record["session_id"], "session-a");
        assert_eq!(record["question"], "Research with api_key=[REDACTED]");
        assert_eq!(record["rounds"], 2);
        assert!(!record["sources"][0].as_str().unwrap().contains("sk-"));
        assert_eq!(record["redactions"], serde_json::json!(["api_key", "sk_token"]));

        let audit = path.with_file_name("audit.jsonl");
        assert!(audit.exists());
        Ok(())
    }

    #[test]
    fn retention_prunes_only_stale_files() -> Result<()> {
        let temp = tempfile::tempdir()?;
        log_session_completion_in(
            temp.path(),
            SessionLogInput {
                session_id: "fresh".into(),
                question: "q".into(),
                ..SessionLogInput::default()
            },
        )?;

        enforce_retention(temp.path(), 30)?;
        assert!(temp.path().read_dir()?.next().is_some());
        Ok(())
    }
}
