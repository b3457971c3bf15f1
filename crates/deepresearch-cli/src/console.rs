use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use deepresearch_engine::{
    ClarificationResponder, ProgressEvent, ProgressSink, ProgressStage, preview,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

const BRIEF_PREVIEW_CHARS: usize = 200;
const NOTE_PREVIEW_CHARS: usize = 150;

/// Prints one line per progress event to stderr.
#[derive(Debug, Default)]
pub struct ConsoleProgress;

impl ConsoleProgress {
    fn describe(event: &ProgressEvent) -> Option<String> {
        let state = &event.state;
        match event.stage {
            ProgressStage::Clarify => {
                if let Some(question) = &state.clarification_question {
                    return Some(format!("[clarify] question for you: {question}"));
                }
                Some(match &state.verification {
                    Some(verification) => format!("[clarify] {verification}"),
                    None => "[clarify] no clarification needed".to_string(),
                })
            }
            ProgressStage::Brief => state
                .research_brief
                .as_deref()
                .map(|brief| format!("[brief] {}", preview(brief, BRIEF_PREVIEW_CHARS))),
            ProgressStage::Research => {
                let mut line = String::from("[research]");
                if let Some(round) = state.round {
                    line.push_str(&format!(" round {round}"));
                }
                if let Some(phase) = &state.phase {
                    line.push_str(&format!(" {}", phase.replace('_', " ")));
                }
                if let Some(count) = state.notes_count {
                    line.push_str(&format!(", {count} note(s)"));
                }
                if let Some(note) = &state.latest_note {
                    line.push_str(&format!("\n           latest: {}", preview(note, NOTE_PREVIEW_CHARS)));
                }
                Some(line)
            }
            ProgressStage::Report => state
                .final_report
                .as_ref()
                .map(|report| format!("[report] {} characters written", report.chars().count())),
        }
    }
}

impl ProgressSink for ConsoleProgress {
    fn observe(&mut self, event: &ProgressEvent) {
        if let Some(line) = Self::describe(event) {
            eprintln!("{line}");
        }
    }
}

/// Asks the clarifying question on the terminal and reads one line.
#[derive(Debug, Default)]
pub struct StdinResponder;

#[async_trait]
impl ClarificationResponder for StdinResponder {
    async fn answer(&self, question: &str) -> Option<String> {
        eprintln!("\n{question}\n(press Enter to continue with the original question)");
        eprint!("> ");
        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(_) => Some(line.trim().to_string()).filter(|answer| !answer.is_empty()),
            Err(err) => {
                warn!(error = %err, "failed to read clarification answer; continuing");
                None
            }
        }
    }
}

/// Preset document directories offered by [`pick_documents`], relative to
/// the working directory.
const DOCUMENT_PRESETS: &[(&str, &str)] = &[
    ("docs", "documentation directory"),
    ("src", "source directory"),
    (".", "working directory"),
];

/// Let the user choose a local documents directory. Returns `None` when the
/// user opts out or input ends.
pub fn pick_documents<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    cwd: &Path,
) -> Result<Option<PathBuf>> {
    let custom = DOCUMENT_PRESETS.len() + 1;
    let none = custom + 1;

    writeln!(output, "Select a documents directory:")?;
    for (idx, (path, label)) in DOCUMENT_PRESETS.iter().enumerate() {
        let mark = if cwd.join(path).is_dir() { "" } else { " (missing)" };
        writeln!(output, "{}. {label} ({path}){mark}", idx + 1)?;
    }
    writeln!(output, "{custom}. custom path")?;
    writeln!(output, "{none}. no local documents")?;

    let mut line = String::new();
    loop {
        write!(output, "choice [1-{none}]: ")?;
        output.flush()?;
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        let choice = line.trim().parse::<usize>().unwrap_or(0);
        let candidate = match choice {
            n if (1..=DOCUMENT_PRESETS.len()).contains(&n) => cwd.join(DOCUMENT_PRESETS[n - 1].0),
            n if n == custom => {
                write!(output, "path: ")?;
                output.flush()?;
                line.clear();
                if input.read_line(&mut line)? == 0 {
                    return Ok(None);
                }
                cwd.join(line.trim())
            }
            n if n == none => return Ok(None),
            _ => {
                writeln!(output, "invalid choice")?;
                continue;
            }
        };

        if candidate.is_dir() {
            return Ok(Some(candidate));
        }
        writeln!(output, "not a directory: {}", candidate.display())?;
    }
}
