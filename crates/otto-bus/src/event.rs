// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of event types the bus accepts.
///
/// Anything not representable here cannot enter the system — the IPC server
/// drops inbound lines whose `type` fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "user:input")]
    UserInput,
    #[serde(rename = "schedule:trigger")]
    ScheduleTrigger,
    #[serde(rename = "agent:response")]
    AgentResponse,
    #[serde(rename = "agent:status")]
    AgentStatus,
    #[serde(rename = "workflow:run:start")]
    WorkflowRunStart,
    #[serde(rename = "workflow:run:queued")]
    WorkflowRunQueued,
    #[serde(rename = "workflow:step:start")]
    WorkflowStepStart,
    #[serde(rename = "workflow:step:complete")]
    WorkflowStepComplete,
    #[serde(rename = "workflow:needs_approval")]
    WorkflowNeedsApproval,
    #[serde(rename = "workflow:run:complete")]
    WorkflowRunComplete,
    #[serde(rename = "workflow:lint")]
    WorkflowLint,
    #[serde(rename = "workflow:dry-run")]
    WorkflowDryRun,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserInput => "user:input",
            Self::ScheduleTrigger => "schedule:trigger",
            Self::AgentResponse => "agent:response",
            Self::AgentStatus => "agent:status",
            Self::WorkflowRunStart => "workflow:run:start",
            Self::WorkflowRunQueued => "workflow:run:queued",
            Self::WorkflowStepStart => "workflow:step:start",
            Self::WorkflowStepComplete => "workflow:step:complete",
            Self::WorkflowNeedsApproval => "workflow:needs_approval",
            Self::WorkflowRunComplete => "workflow:run:complete",
            Self::WorkflowLint => "workflow:lint",
            Self::WorkflowDryRun => "workflow:dry-run",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event types the IPC server is allowed to forward to clients.
pub const OUTBOUND_ALLOWLIST: &[EventType] = &[
    EventType::AgentResponse,
    EventType::AgentStatus,
    EventType::WorkflowRunQueued,
    EventType::WorkflowStepStart,
    EventType::WorkflowStepComplete,
    EventType::WorkflowNeedsApproval,
    EventType::WorkflowRunComplete,
];

/// Logical origin of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Tui,
    Ipc,
    #[default]
    System,
}

/// A single bus event.  Immutable after emission — the dispatcher hands each
/// handler its own clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub channel: Channel,
    #[serde(default = "default_session")]
    pub session_id: String,
    pub content: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Dispatcher-assigned sequence number, unique per process.  Used for
    /// input-claim correlation; never serialized onto the wire.
    #[serde(skip)]
    pub seq: u64,
}

fn default_session() -> String {
    "main".to_string()
}

impl Event {
    pub fn new(event_type: EventType, content: Value) -> Self {
        Self {
            event_type,
            channel: Channel::System,
            session_id: default_session(),
            content,
            timestamp: Utc::now(),
            seq: 0,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    /// Deserialize the content payload into its type-specific struct.
    pub fn content_as<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.content.clone())?)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
