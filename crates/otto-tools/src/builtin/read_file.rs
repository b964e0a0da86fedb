// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolContext, ToolError, ToolOutput};

/// Byte ceiling for file content returned to the model.
const READ_LIMIT_BYTES: usize = 24_000;

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. Optional 'offset' (1-based line) \
         and 'limit' (line count) select a window of a large file. Output is \
         line-numbered so edits can reference exact locations."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                },
                "offset": {
                    "type": "integer",
                    "description": "First line to read, 1-based (optional)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Number of lines to read (optional)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let path = call
            .arguments
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgument("missing required parameter 'path'".into()))?;
        let offset = call
            .arguments
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|v| v.max(1) as usize)
            .unwrap_or(1);
        let limit = call
            .arguments
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);

        let content = ctx.workspace.read_text_file(path).await.map_err(|e| match e {
            otto_workspace::WorkspaceError::Io(io)
                if io.kind() == std::io::ErrorKind::NotFound =>
            {
                ToolError::ExecutionError(format!("file not found: {path}"))
            }
            other => other.into(),
        })?;

        let total_lines = content.lines().count();
        let mut out = String::new();
        let mut bytes = 0usize;
        let mut truncated = false;
        for (i, line) in content
            .lines()
            .enumerate()
            .skip(offset - 1)
            .take(limit.unwrap_or(usize::MAX))
        {
            let numbered = format!("{:>6}\t{line}\n", i + 1);
            bytes += numbered.len();
            if bytes > READ_LIMIT_BYTES {
                truncated = true;
                break;
            }
            out.push_str(&numbered);
        }
        if truncated {
            out.push_str("...[output truncated; re-read with offset/limit]...\n");
        }
        if out.is_empty() {
            out = format!("[empty selection; file has {total_lines} lines]");
        }
        Ok(ToolOutput::ok(&call.id, out))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
