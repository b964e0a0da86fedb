// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    provider::{ChatRequest, ModelProvider},
    Completion, Role,
};

/// Deterministic mock provider.  Echoes the last user message back as the
/// assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn chat_completion(&self, req: ChatRequest) -> anyhow::Result<Completion> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("[no input]");
        Ok(Completion::text(format!("MOCK: {reply}")))
    }

    async fn preflight(&self) -> anyhow::Result<Vec<String>> {
        Ok(vec!["mock-model".into()])
    }
}

/// A pre-scripted provider for tests.  Each `chat_completion` call pops the
/// next script entry; requests are recorded so tests can inspect what was
/// sent.  When the script runs dry the provider waits forever — useful for
/// timeout tests, and a loud failure mode for scripts that are too short.
pub struct ScriptedProvider {
    script: Mutex<Vec<anyhow::Result<Completion>>>,
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<anyhow::Result<Completion>>) -> Self {
        // Stored reversed so pop() yields them in submission order.
        let mut script = script;
        script.reverse();
        Self {
            script: Mutex::new(script),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Provider whose every scripted entry is a successful completion.
    pub fn completions(list: Vec<Completion>) -> Self {
        Self::new(list.into_iter().map(Ok).collect())
    }

    /// Provider that never answers — every call parks forever.
    pub fn never() -> Self {
        Self::new(Vec::new())
    }

    pub fn calls_made(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn chat_completion(&self, req: ChatRequest) -> anyhow::Result<Completion> {
        self.requests.lock().unwrap().push(req);
        let next = self.script.lock().unwrap().pop();
        match next {
            Some(result) => result,
            None => {
                // Script exhausted: park forever so timeout paths trigger.
                futures_pending().await;
                unreachable!()
            }
        }
    }

    async fn preflight(&self) -> anyhow::Result<Vec<String>> {
        Ok(vec!["scripted".into()])
    }
}

async fn futures_pending() {
    std::future::pending::<()>().await
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
