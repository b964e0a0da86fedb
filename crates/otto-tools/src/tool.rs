// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use otto_workspace::WorkspaceManager;

use crate::rollback::WriteRollback;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// Parsed JSON argument object.
    pub arguments: Value,
}

/// The result of a successful tool execution.
///
/// `is_error` marks a *tool-level* failure the model should see and react to
/// (non-zero exit code, no matches).  Infrastructure failures — timeouts,
/// sandbox escapes, spawn errors — are [`ToolError`]s instead and feed the
/// turn loop's retry machinery.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Tagged tool failure kinds.  `InvalidArgument` feeds the validation-retry
/// path; the rest feed the tool-execution-retry path.  `PathEscape` is
/// terminal for the offending call but the turn may still retry with a
/// corrected path.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArgument(String),
    #[error("path escapes the sandbox: {0}")]
    PathEscape(String),
    #[error("tool timed out: {0}")]
    Timeout(String),
    #[error("tool execution failed: {0}")]
    ExecutionError(String),
}

impl From<otto_workspace::WorkspaceError> for ToolError {
    fn from(e: otto_workspace::WorkspaceError) -> Self {
        match e {
            otto_workspace::WorkspaceError::PathEscape { path } => Self::PathEscape(path),
            otto_workspace::WorkspaceError::Io(io) => Self::ExecutionError(io.to_string()),
        }
    }
}

/// Per-call execution context: the sandbox and the turn's rollback journal.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: Arc<WorkspaceManager>,
    pub rollback: Arc<WriteRollback>,
}

/// Trait every builtin implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the argument object.
    fn parameters_schema(&self) -> Value;
    /// Execute the call.  Mutating tools MUST capture affected paths through
    /// `ctx.rollback` before touching them.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
