// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolContext, ToolError, ToolOutput};

pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write a text file in the workspace, overwriting any existing content. \
         ALWAYS prefer the edit tool for existing files. Parent directories \
         are created automatically. When intentionally replacing a file \
         wholesale, state the reason for the rewrite in your final answer."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Full content to write"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let path = call
            .arguments
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgument("missing required parameter 'path'".into()))?;
        let content = call
            .arguments
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ToolError::InvalidArgument("missing required parameter 'content'".into())
            })?;

        let abs = ctx.workspace.resolve(path)?;
        ctx.rollback
            .capture_file(&abs)
            .await
            .map_err(|e| ToolError::ExecutionError(e.to_string()))?;

        debug!(path = %abs.display(), bytes = content.len(), "write tool");
        ctx.workspace.write_text_file(path, content).await?;
        Ok(ToolOutput::ok(
            &call.id,
            format!("wrote {} bytes to {path}", content.len()),
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;
    use std::sync::Arc;

    use super::*;
    use crate::WriteRollback;

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
            id: "w1".into(),
            name: "write".into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn write_creates_file_and_parents() {
        let (d, ctx) = ctx();
        let out = WriteTool
            .execute(&call(json!({"path": "sub/f.txt", "content": "hello"})), &ctx)
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(
            std::fs::read_to_string(d.path().join("sub/f.txt")).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn write_captures_rollback_before_mutation() {
        let (d, ctx) = ctx();
        let path = d.path().join("f.txt");
        std::fs::write(&path, "original").unwrap();

        WriteTool
            .execute(&call(json!({"path": "f.txt", "content": "mutated"})), &ctx)
            .await
            .unwrap();
        assert_eq!(
            ctx.rollback.original_content(&path).as_deref(),
            Some("original")
        );

        ctx.rollback.restore().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");
    }

    #[tokio::test]
    async fn new_file_rolls_back_to_absent() {
        let (d, ctx) = ctx();
        WriteTool
            .execute(&call(json!({"path": "fresh.txt", "content": "x"})), &ctx)
            .await
            .unwrap();
        ctx.rollback.restore().await.unwrap();
        assert!(!d.path().join("fresh.txt").exists());
    }

    #[tokio::test]
    async fn escape_is_rejected_before_any_write() {
        let (_d, ctx) = ctx();
        let result = WriteTool
            .execute(&call(json!({"path": "../evil.txt", "content": "x"})), &ctx)
            .await;
        assert!(matches!(result, Err(ToolError::PathEscape(_))));
        assert_eq!(ctx.rollback.captured_count(), 0);
    }
}
