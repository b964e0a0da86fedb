// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Completion, Message};

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
}

/// A chat-completion backend.
///
/// Cancellation is by future drop: the turn loop wraps `chat_completion` in
/// its timeout/abort select, and dropping the future aborts the HTTP request.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider id for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// One full completion (no streaming).
    async fn chat_completion(&self, req: ChatRequest) -> anyhow::Result<Completion>;

    /// Exact token count for `text`, when a provider-matched tokenizer is
    /// available locally.
    ///
    /// The context builder prefers this over its character estimate and
    /// falls back silently when it returns `None`.
    fn count_tokens(&self, _text: &str) -> Option<usize> {
        None
    }

    /// Reachability / capability check run once at startup.  Returns the
    /// model ids the endpoint reports.
    async fn preflight(&self) -> anyhow::Result<Vec<String>>;
}
