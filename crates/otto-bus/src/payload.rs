// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Type-specific content payloads for each [`EventType`](crate::EventType).
//!
//! `Event.content` stays a dynamic `serde_json::Value` on the wire; these
//! structs recover static safety at the edges.  Construct with
//! `serde_json::to_value(payload)?`, read with `event.content_as::<T>()?`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `user:input` — an operator turn, or an answer to a parked workflow prompt.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserInput {
    pub text: String,
    /// Correlation id echoed back on the terminal `agent:response`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// `agent:response` — the single terminal message of a turn.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentResponse {
    pub text: String,
    pub finish_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `agent:status` — progress updates streamed during a turn.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentStatus {
    /// "generating", "parse:retry", "tool:start", "tool:complete",
    /// "tool:retry", "verify:retry", "continue", "tool:rollback",
    /// "tool:rollback_failed".
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

/// `schedule:trigger` — a persisted schedule fired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTrigger {
    pub schedule_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub args: Value,
}

/// `workflow:run:start` — request to start a run of a loaded workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStart {
    pub workflow_id: String,
    #[serde(default)]
    pub args: Value,
}

/// `workflow:run:queued` — acknowledgement carrying the allocated run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunQueued {
    pub run_id: u64,
    pub workflow_id: String,
}

/// `workflow:step:start` — dispatched for `agent` steps; the turn loop
/// consumes this and answers with `workflow:step:complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStart {
    pub run_id: u64,
    pub step_id: String,
    pub instruction: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub load_skills: Vec<String>,
    /// Compressed `{step_id, output}` pairs of already-completed steps.
    #[serde(default)]
    pub prior_steps: Vec<PriorStep>,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorStep {
    pub step_id: String,
    pub output: String,
}

/// `workflow:step:complete` — emitted by the turn loop for `agent` steps,
/// and by the engine itself for `system_*` steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepComplete {
    pub run_id: u64,
    pub step_id: String,
    /// "completed" or "failed".
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `workflow:needs_approval` — a parked step awaiting operator input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeedsApproval {
    pub run_id: u64,
    pub step_id: String,
    pub prompt: String,
    /// "approval" for `approval: true` gates, "input" for wait_for_input.
    pub kind: String,
}

/// `workflow:run:complete` — the single terminal event of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunComplete {
    pub run_id: u64,
    pub workflow_id: String,
    /// "completed", "failed", or "cancelled".
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `workflow:lint` / `workflow:dry-run` — validation requests and replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintRequest {
    pub workflow_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintReport {
    pub workflow_id: String,
    pub ok: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Topologically ordered step ids (present when ok).
    #[serde(default)]
    pub plan: Vec<PlanEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub step_id: String,
    /// Number of successor steps unblocked when this one finishes.
    pub done_when_count: usize,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_response_omits_empty_options() {
        let p = AgentResponse {
            text: "hi".into(),
            finish_reason: "stop".into(),
            ..Default::default()
        };
        let v = serde_json::to_value(&p).unwrap();
        assert!(v.get("request_id").is_none());
        assert!(v.get("error").is_none());
    }

    #[test]
    fn step_start_round_trips() {
        let p = StepStart {
            run_id: 3,
            step_id: "build".into(),
            instruction: "compile it".into(),
            tools: vec!["bash".into()],
            load_skills: vec![],
            prior_steps: vec![PriorStep {
                step_id: "prepare".into(),
                output: "done".into(),
            }],
            args: serde_json::json!({"target": "debug"}),
            response_key: None,
            timeout_secs: Some(60),
        };
        let v = serde_json::to_value(&p).unwrap();
        let back: StepStart = serde_json::from_value(v).unwrap();
        assert_eq!(back.run_id, 3);
        assert_eq!(back.prior_steps.len(), 1);
        assert_eq!(back.timeout_secs, Some(60));
    }

    #[test]
    fn user_input_defaults_are_lenient() {
        let p: UserInput = serde_json::from_str(r#"{"text":"hello"}"#).unwrap();
        assert!(p.request_id.is_none());
        assert!(p.client_id.is_none());
    }
}
