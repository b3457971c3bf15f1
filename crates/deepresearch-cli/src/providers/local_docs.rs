use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use deepresearch_engine::{DynTool, SourceRef, Tool, ToolError, ToolOutput};
use serde_json::{Value, json};
use walkdir::WalkDir;

/// Characters returned per file read.
const MAX_READ_CHARS: usize = 20_000;
const MAX_LISTED_ENTRIES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    ListDirectory,
    ReadTextFile,
    ReadFile,
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::ListDirectory => "list_directory",
            Operation::ReadTextFile => "read_text_file",
            Operation::ReadFile => "read_file",
        }
    }
}

/// Filesystem tool confined to one documents directory.
struct LocalDocsTool {
    operation: Operation,
    root: Arc<PathBuf>,
}

/// The local document tools over `root`.
pub fn local_docs_tools(root: &Path) -> Result<Vec<DynTool>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("documents directory {} is not accessible", root.display()))?;
    if !root.is_dir() {
        bail!("documents path {} is not a directory", root.display());
    }
    let root = Arc::new(root);
    Ok([
        Operation::ListDirectory,
        Operation::ReadTextFile,
        Operation::ReadFile,
    ]
    .into_iter()
    .map(|operation| {
        Arc::new(LocalDocsTool {
            operation,
            root: Arc::clone(&root),
        }) as DynTool
    })
    .collect())
}

impl LocalDocsTool {
    /// Resolve `relative` inside the root; anything escaping it is rejected.
    fn resolve(&self, relative: &str) -> Result<PathBuf, ToolError> {
        let name = self.operation.name();
        let candidate = Path::new(relative.trim_start_matches('/'));
        let joined = self.root.join(candidate);
        let resolved = joined
            .canonicalize()
            .map_err(|err| ToolError::failed(name, format!("{relative}: {err}")))?;
        if !resolved.starts_with(self.root.as_path()) {
            return Err(ToolError::invalid_arguments(
                name,
                format!("{relative} is outside the documents directory"),
            ));
        }
        Ok(resolved)
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(self.root.as_path()).unwrap_or(path)
    }

    fn list(&self, args: &Value) -> Result<ToolOutput, ToolError> {
        let dir = self.resolve(args.get("path").and_then(Value::as_str).unwrap_or("."))?;
        let recursive = args
            .get("recursive")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut listing = String::new();
        let walker = WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(if recursive { usize::MAX } else { 1 })
            .sort_by_file_name();
        for entry in walker
            .into_iter()
            .filter_map(|entry| entry.ok())
            .take(MAX_LISTED_ENTRIES)
        {
            let kind = if entry.file_type().is_dir() { "[DIR]" } else { "[FILE]" };
            let _ = writeln!(listing, "{kind} {}", self.relative(entry.path()).display());
        }
        if listing.is_empty() {
            listing.push_str("(empty directory)");
        }
        Ok(ToolOutput::new(listing.trim_end()))
    }

    fn read(&self, args: &Value, text_only: bool) -> Result<ToolOutput, ToolError> {
        let name = self.operation.name();
        let relative = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid_arguments(name, "missing string field `path`"))?;
        let path = self.resolve(relative)?;
        let bytes = fs::read(&path).map_err(|err| ToolError::failed(name, format!("{relative}: {err}")))?;

        let text = if text_only {
            String::from_utf8(bytes)
                .map_err(|_| ToolError::failed(name, format!("{relative} is not a UTF-8 text file")))?
        } else {
            String::from_utf8_lossy(&bytes).into_owned()
        };
        let mut text = select_lines(&text, args);
        if text.chars().count() > MAX_READ_CHARS {
            text = text.chars().take(MAX_READ_CHARS).collect();
            text.push_str("\n[truncated]");
        }

        let title = path
            .file_name()
            .map(|file| file.to_string_lossy().into_owned())
            .unwrap_or_else(|| relative.to_string());
        let url = format!("file://{}", path.display());
        Ok(ToolOutput::new(format!("Contents of {}:\n{text}", self.relative(&path).display()))
            .with_source(SourceRef::new(title, url)))
    }
}

/// Apply the optional `head` / `tail` line limits.
fn select_lines(text: &str, args: &Value) -> String {
    let head = args.get("head").and_then(Value::as_u64).map(|n| n as usize);
    let tail = args.get("tail").and_then(Value::as_u64).map(|n| n as usize);
    match (head, tail) {
        (Some(n), _) => text.lines().take(n).collect::<Vec<_>>().join("\n"),
        (None, Some(n)) => {
            let lines: Vec<&str> = text.lines().collect();
            lines[lines.len().saturating_sub(n)..].join("\n")
        }
        (None, None) => text.to_string(),
    }
}

#[async_trait]
impl Tool for LocalDocsTool {
    fn name(&self) -> &str {
        self.operation.name()
    }

    fn description(&self) -> &str {
        match self.operation {
            Operation::ListDirectory => {
                "List files in the local documents directory. Use this first to see what is available."
            }
            Operation::ReadTextFile => "Read a UTF-8 text file from the local documents directory.",
            Operation::ReadFile => "Read any file from the local documents directory as text.",
        }
    }

    fn parameters(&self) -> Value {
        match self.operation {
            Operation::ListDirectory => json!({
                "path": "string, optional: directory relative to the documents root",
                "recursive": "bool, optional"
            }),
            _ => json!({
                "path": "string: file path relative to the documents root",
                "head": "integer, optional: only the first N lines",
                "tail": "integer, optional: only the last N lines"
            }),
        }
    }

    async fn invoke(&self, args: Value) -> Result<ToolOutput, ToolError> {
        match self.operation {
            Operation::ListDirectory => self.list(&args),
            Operation::ReadTextFile => self.read(&args, true),
            Operation::ReadFile => self.read(&args, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(tools: &[DynTool], name: &str) -> DynTool {
        tools
            .iter()
            .find(|tool| tool.name() == name)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn reads_stay_inside_the_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("notes")).unwrap();
        fs::write(dir.path().join("notes/rust.md"), "line one\nline two\nline three").unwrap();
        fs::write(dir.path().join("secret.txt"), "outside").unwrap();
        let docs = dir.path().join("notes");

        let tools = local_docs_tools(&docs).unwrap();
        assert_eq!(tools.len(), 3);

        let listing = tool(&tools, "list_directory").invoke(json!({})).await.unwrap();
        assert_eq!(listing.content, "[FILE] rust.md");

        let read = tool(&tools, "read_text_file")
            .invoke(json!({"path": "rust.md", "tail": 1}))
            .await
            .unwrap();
        assert!(read.content.ends_with("line three"));
        assert!(read.sources[0].url.starts_with("file://"));

        let escape = tool(&tools, "read_file")
            .invoke(json!({"path": "../secret.txt"}))
            .await
            .unwrap_err();
        assert!(matches!(escape, ToolError::InvalidArguments { .. }));
    }

    #[test]
    fn head_wins_over_tail() {
        let args = json!({"head": 1, "tail": 1});
        assert_eq!(select_lines("a\nb\nc", &args), "a");
    }
}
