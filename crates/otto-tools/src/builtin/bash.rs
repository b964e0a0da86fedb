// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
#[cfg(unix)]
use libc;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolContext, ToolError, ToolOutput};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Number of lines kept from the head of oversized output.
const HEAD_LINES: usize = 100;

/// Number of lines kept from the tail of oversized output.  Errors and
/// summaries almost always appear at the end of build/test output, so the
/// tail matters at least as much as the head.
const TAIL_LINES: usize = 100;

/// Runs a shell command inside the workspace sandbox.
pub struct BashTool {
    pub timeout_secs: u64,
}

impl Default for BashTool {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command inside the workspace and return stdout + stderr.\n\
         The working directory is the workspace root (or 'workdir' relative to it).\n\
         Output is capped at ~20 KB; when larger, the first 100 and last 100 lines\n\
         are preserved with an omission marker in the middle.\n\
         Prefer non-interactive commands; avoid anything that needs a TTY.\n\
         Use the read/write/edit tools for file content instead of cat or sed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The complete bash one-liner to execute."
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory relative to the workspace root (optional)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let command = call
            .arguments
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgument("missing required parameter 'command'".into()))?
            .to_string();
        let workdir = match call.arguments.get("workdir").and_then(|v| v.as_str()) {
            Some(rel) => ctx.workspace.resolve(rel).map_err(ToolError::from)?,
            None => ctx.workspace.root().to_path_buf(),
        };
        let timeout = call
            .arguments
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.timeout_secs);

        debug!(cmd = %command, workdir = %workdir.display(), "executing bash tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        cmd.current_dir(&workdir);
        // Detach the subprocess from any controlling terminal: stdin from
        // /dev/null defeats isatty(0) checks, kill_on_drop reaps the child
        // when the timeout fires, and setsid() stops it from reopening
        // /dev/tty behind our backs.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()).await;

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);

                if !stdout.is_empty() {
                    content.push_str(&head_tail_truncate(&stdout));
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&head_tail_truncate(&stderr));
                }
                if content.is_empty() {
                    content = format!("[exit {}]", output.status.code().unwrap_or(-1));
                }

                let code = output.status.code().unwrap_or(-1);
                if code == 0 {
                    Ok(ToolOutput::ok(&call.id, content))
                } else if code == 1 {
                    // Exit code 1 is the Unix convention for "no matches"
                    // (grep/rg) and "condition false" (test) — not a hard
                    // failure the model should treat as an error.
                    Ok(ToolOutput::ok(&call.id, format!("[exit 1]\n{content}")))
                } else {
                    Ok(ToolOutput::err(&call.id, format!("[exit {code}]\n{content}")))
                }
            }
            Ok(Err(e)) => Err(ToolError::ExecutionError(format!("spawn error: {e}"))),
            Err(_) => Err(ToolError::Timeout(format!(
                "command exceeded {timeout}s: {command}"
            ))),
        }
    }
}

/// Truncate `s` to fit within `OUTPUT_LIMIT_BYTES`, keeping the first
/// `HEAD_LINES` and last `TAIL_LINES` with an omission marker between.
pub(crate) fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }

    let lines: Vec<&str> = s.lines().collect();
    let total = lines.len();

    if total <= HEAD_LINES + TAIL_LINES {
        // Byte budget exceeded by very long lines; fall back to byte windows.
        let tail_start = s.len().saturating_sub(OUTPUT_LIMIT_BYTES / 2);
        let tail_str = &s[tail_start..];
        let head_end = (OUTPUT_LIMIT_BYTES / 2).min(s.len());
        let head_str = &s[..head_end];
        let omitted = s.len() - head_str.len() - tail_str.len();
        return format!("{head_str}\n...[{omitted} bytes omitted]...\n{tail_str}");
    }

    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[total - TAIL_LINES..].join("\n");
    let omitted_lines = total - HEAD_LINES - TAIL_LINES;
    let omitted_bytes = s.len().saturating_sub(head.len() + tail.len());
    format!("{head}\n...[{omitted_lines} lines / ~{omitted_bytes} bytes omitted]...\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::WriteRollback;
    use std::sync::Arc;

    fn ctx() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext {
            workspace: Arc::new(otto_workspace::WorkspaceManager::new(dir.path())),
            rollback: Arc::new(WriteRollback::new()),
        };
        (dir, ctx)
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "bash".into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn executes_echo_and_returns_stdout() {
        let (_d, ctx) = ctx();
        let out = BashTool::default()
            .execute(&call(json!({"command": "echo hello"})), &ctx)
            .await
            .unwrap();
        assert!(!out.is_error, "{}", out.content);
        assert!(out.content.contains("hello"));
    }

    #[tokio::test]
    async fn runs_in_workspace_root_by_default() {
        let (d, ctx) = ctx();
        let out = BashTool::default()
            .execute(&call(json!({"command": "pwd"})), &ctx)
            .await
            .unwrap();
        let canonical = d.path().canonicalize().unwrap();
        assert!(
            out.content.trim().ends_with(canonical.file_name().unwrap().to_str().unwrap()),
            "pwd was {}",
            out.content
        );
    }

    #[tokio::test]
    async fn workdir_outside_sandbox_is_path_escape() {
        let (_d, ctx) = ctx();
        let result = BashTool::default()
            .execute(&call(json!({"command": "pwd", "workdir": "../.."})), &ctx)
            .await;
        assert!(matches!(result, Err(ToolError::PathEscape(_))));
    }

    #[tokio::test]
    async fn stderr_is_captured_and_labelled() {
        let (_d, ctx) = ctx();
        let out = BashTool::default()
            .execute(&call(json!({"command": "echo oops >&2"})), &ctx)
            .await
            .unwrap();
        assert!(out.content.contains("[stderr]"));
        assert!(out.content.contains("oops"));
    }

    #[tokio::test]
    async fn exit_1_is_not_an_error() {
        let (_d, ctx) = ctx();
        let out = BashTool::default()
            .execute(&call(json!({"command": "exit 1"})), &ctx)
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.content.contains("[exit 1]"));
    }

    #[tokio::test]
    async fn exit_2_is_a_tool_level_error() {
        let (_d, ctx) = ctx();
        let out = BashTool::default()
            .execute(&call(json!({"command": "exit 2"})), &ctx)
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("[exit 2]"));
    }

    #[tokio::test]
    async fn timeout_is_a_timeout_error() {
        let (_d, ctx) = ctx();
        let t = BashTool { timeout_secs: 1 };
        let result = t
            .execute(&call(json!({"command": "sleep 60"})), &ctx)
            .await;
        assert!(matches!(result, Err(ToolError::Timeout(_))));
    }

    // ── Head+tail truncation ──────────────────────────────────────────────────

    #[test]
    fn short_output_passes_through_unchanged() {
        let s = "hello\nworld\n";
        assert_eq!(head_tail_truncate(s), s);
    }

    #[test]
    fn head_and_tail_are_both_preserved() {
        let mut lines: Vec<String> = vec!["BUILD START".to_string()];
        for i in 0..800 {
            lines.push(format!("middle line {i} padding padding padding padding"));
        }
        lines.push("BUILD ERROR".to_string());
        let content = lines.join("\n");

        let result = head_tail_truncate(&content);
        assert!(result.contains("BUILD START"));
        assert!(result.contains("BUILD ERROR"));
        assert!(result.contains("omitted"));
        assert!(result.len() < content.len());
    }
}
