// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use similar::TextDiff;
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolContext, ToolError, ToolOutput};

/// Minimum similarity ratio (0–1) for a fuzzy window to be accepted.
const FUZZY_THRESHOLD: f64 = 0.85;

/// Exact-string (with fuzzy fallback) in-place file editing.
pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace 'old_string' with 'new_string' in a workspace file. \
         'old_string' must match exactly once unless replace_all is true; \
         include enough surrounding lines to make it unique. When the exact \
         text is not found, a whitespace-tolerant fuzzy match is attempted."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                },
                "old_string": {
                    "type": "string",
                    "description": "Text to replace (must be unique unless replace_all)"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default false)"
                }
            },
            "required": ["path", "old_string", "new_string"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let get = |key: &str| -> Result<&str, ToolError> {
            call.arguments
                .get(key)
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ToolError::InvalidArgument(format!("missing required parameter '{key}'"))
                })
        };
        let path = get("path")?;
        let old_string = get("old_string")?;
        let new_string = get("new_string")?;
        let replace_all = call
            .arguments
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if old_string.is_empty() {
            return Err(ToolError::InvalidArgument(
                "'old_string' must not be empty".into(),
            ));
        }
        if old_string == new_string {
            return Err(ToolError::InvalidArgument(
                "'old_string' and 'new_string' are identical".into(),
            ));
        }

        let content = ctx.workspace.read_text_file(path).await.map_err(|e| match e {
            otto_workspace::WorkspaceError::Io(io)
                if io.kind() == std::io::ErrorKind::NotFound =>
            {
                ToolError::ExecutionError(format!("file not found: {path}"))
            }
            other => other.into(),
        })?;

        let matches = content.matches(old_string).count();
        let updated = match (matches, replace_all) {
            (0, _) => fuzzy_replace(&content, old_string, new_string).ok_or_else(|| {
                ToolError::ExecutionError(format!(
                    "'old_string' not found in {path} (no fuzzy window above {FUZZY_THRESHOLD})"
                ))
            })?,
            (1, _) => content.replacen(old_string, new_string, 1),
            (_, true) => content.replace(old_string, new_string),
            (n, false) => {
                return Err(ToolError::ExecutionError(format!(
                    "'old_string' matches {n} times in {path}; add context or set replace_all"
                )))
            }
        };

        let abs = ctx.workspace.resolve(path)?;
        ctx.rollback
            .capture_file(&abs)
            .await
            .map_err(|e| ToolError::ExecutionError(e.to_string()))?;
        ctx.workspace.write_text_file(path, &updated).await?;

        let diff = TextDiff::from_lines(&content, &updated);
        let (mut added, mut removed) = (0usize, 0usize);
        for change in diff.iter_all_changes() {
            match change.tag() {
                similar::ChangeTag::Insert => added += 1,
                similar::ChangeTag::Delete => removed += 1,
                similar::ChangeTag::Equal => {}
            }
        }
        debug!(path = %path, added, removed, "edit tool applied");
        Ok(ToolOutput::ok(
            &call.id,
            format!("edited {path} (+{added} -{removed} lines)"),
        ))
    }
}

/// Whitespace-tolerant fallback: slide a window of the same line count as
/// `old_string` over the file and accept the best window whose similarity
/// clears [`FUZZY_THRESHOLD`].
fn fuzzy_replace(content: &str, old_string: &str, new_string: &str) -> Option<String> {
    let old_lines: Vec<&str> = old_string.lines().collect();
    if old_lines.is_empty() {
        return None;
    }
    let content_lines: Vec<&str> = content.lines().collect();
    if content_lines.len() < old_lines.len() {
        return None;
    }

    let normalized_old: Vec<String> = old_lines.iter().map(|l| l.trim().to_string()).collect();
    let mut best: Option<(usize, f64)> = None;
    for start in 0..=(content_lines.len() - old_lines.len()) {
        let window = &content_lines[start..start + old_lines.len()];
        let normalized_window: Vec<String> = window.iter().map(|l| l.trim().to_string()).collect();
        let normalized_old_refs: Vec<&str> = normalized_old.iter().map(|s| s.as_str()).collect();
        let normalized_window_refs: Vec<&str> = normalized_window.iter().map(|s| s.as_str()).collect();
        let ratio = TextDiff::from_slices(&normalized_old_refs, &normalized_window_refs).ratio() as f64;
        if ratio >= FUZZY_THRESHOLD && best.map(|(_, r)| ratio > r).unwrap_or(true) {
            best = Some((start, ratio));
        }
    }
    let (start, _) = best?;

    let mut out: Vec<String> = Vec::with_capacity(content_lines.len());
    out.extend(content_lines[..start].iter().map(|s| s.to_string()));
    out.extend(new_string.lines().map(|s| s.to_string()));
    out.extend(
        content_lines[start + old_lines.len()..]
            .iter()
            .map(|s| s.to_string()),
    );
    let mut joined = out.join("\n");
    if content.ends_with('\n') {
        joined.push('\n');
    }
    Some(joined)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;
    use std::sync::Arc;

    use super::*;
    use crate::WriteRollback;

    async fn ctx_with(content: &str) -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let ws = otto_workspace::WorkspaceManager::new(dir.path());
        ws.write_text_file("f.txt", content).await.unwrap();
        let ctx = ToolContext {
            workspace: Arc::new(ws),
            rollback: Arc::new(WriteRollback::new()),
        };
        (dir, ctx)
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "e1".into(),
            name: "edit".into(),
            arguments: args,
        }
    }

    async fn read(d: &tempfile::TempDir) -> String {
        std::fs::read_to_string(d.path().join("f.txt")).unwrap()
    }

    #[tokio::test]
    async fn exact_unique_replacement() {
        let (d, ctx) = ctx_with("alpha\nbeta\ngamma\n").await;
        EditTool
            .execute(
                &call(json!({"path": "f.txt", "old_string": "beta", "new_string": "BETA"})),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(read(&d).await, "alpha\nBETA\ngamma\n");
    }

    #[tokio::test]
    async fn ambiguous_match_requires_replace_all() {
        let (_d, ctx) = ctx_with("x\nx\n").await;
        let result = EditTool
            .execute(
                &call(json!({"path": "f.txt", "old_string": "x", "new_string": "y"})),
                &ctx,
            )
            .await;
        match result {
            Err(ToolError::ExecutionError(msg)) => assert!(msg.contains("matches 2 times")),
            other => panic!("expected ambiguity error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replace_all_replaces_every_occurrence() {
        let (d, ctx) = ctx_with("x\ny\nx\n").await;
        EditTool
            .execute(
                &call(json!({
                    "path": "f.txt", "old_string": "x", "new_string": "z",
                    "replace_all": true
                })),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(read(&d).await, "z\ny\nz\n");
    }

    #[tokio::test]
    async fn fuzzy_match_tolerates_indentation_drift() {
        let (d, ctx) = ctx_with("fn main() {\n    let a = 1;\n    let b = 2;\n}\n").await;
        // Model remembered the lines without the real indentation.
        EditTool
            .execute(
                &call(json!({
                    "path": "f.txt",
                    "old_string": "let a = 1;\nlet b = 2;",
                    "new_string": "    let a = 10;\n    let b = 2;"
                })),
                &ctx,
            )
            .await
            .unwrap();
        assert!(read(&d).await.contains("let a = 10;"));
    }

    #[tokio::test]
    async fn missing_text_is_execution_error() {
        let (_d, ctx) = ctx_with("alpha\n").await;
        let result = EditTool
            .execute(
                &call(json!({
                    "path": "f.txt",
                    "old_string": "completely unrelated text",
                    "new_string": "x"
                })),
                &ctx,
            )
            .await;
        assert!(matches!(result, Err(ToolError::ExecutionError(_))));
    }

    #[tokio::test]
    async fn edit_is_rollback_captured() {
        let (d, ctx) = ctx_with("keep me\n").await;
        EditTool
            .execute(
                &call(json!({"path": "f.txt", "old_string": "keep me", "new_string": "gone"})),
                &ctx,
            )
            .await
            .unwrap();
        ctx.rollback.restore().await.unwrap();
        assert_eq!(read(&d).await, "keep me\n");
    }

    #[tokio::test]
    async fn identical_strings_rejected() {
        let (_d, ctx) = ctx_with("a\n").await;
        let result = EditTool
            .execute(
                &call(json!({"path": "f.txt", "old_string": "a", "new_string": "a"})),
                &ctx,
            )
            .await;
        assert!(matches!(result, Err(ToolError::InvalidArgument(_))));
    }
}
