// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion client.
//!
//! LM Studio, llama.cpp's server, Ollama, and the hosted OpenAI API all
//! speak the same `/chat/completions` + `/models` wire format; this single
//! client covers them, configured per driver with its endpoint and optional
//! bearer key.

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::{ChatRequest, ToolSchema},
    Completion, FinishReason, Message, ModelProvider, Role, ToolCallRequest, Usage,
};

pub struct LmStudioProvider {
    driver_name: &'static str,
    model: String,
    chat_url: String,
    models_url: String,
    api_key: Option<String>,
    temperature: f32,
    client: reqwest::Client,
}

impl LmStudioProvider {
    pub fn new(
        driver_name: &'static str,
        model: String,
        base_url: String,
        api_key: Option<String>,
        temperature: Option<f32>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            chat_url: format!("{base}/chat/completions"),
            models_url: format!("{base}/models"),
            api_key,
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }

    fn serialize_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::Tool => json!({
                    "role": "tool",
                    "content": m.content,
                    "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
                    "name": m.name.clone().unwrap_or_default(),
                }),
                Role::System => json!({"role": "system", "content": m.content}),
                Role::User => json!({"role": "user", "content": m.content}),
                Role::Assistant => json!({"role": "assistant", "content": m.content}),
            })
            .collect()
    }

    fn serialize_tools(tools: &[ToolSchema]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    fn parse_completion(body: &Value) -> anyhow::Result<Completion> {
        let choice = body["choices"]
            .get(0)
            .context("response has no choices")?;
        let message = &choice["message"];
        let text = message["content"].as_str().unwrap_or_default().to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for (i, call) in calls.iter().enumerate() {
                let name = match call["function"]["name"].as_str() {
                    Some(n) if !n.is_empty() => n.to_string(),
                    // A nameless call cannot be dispatched; forwarding it
                    // would corrupt the history sent back on the next turn.
                    _ => {
                        debug!(index = i, "dropping tool call with empty name");
                        continue;
                    }
                };
                let id = call["id"]
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("call_synthetic_{i}"));
                // Arguments arrive as a JSON-encoded string; empty or broken
                // argument text degrades to {} so the registry's validation
                // produces a correctable error instead of a hard failure.
                let arguments = call["function"]["arguments"]
                    .as_str()
                    .and_then(|s| serde_json::from_str::<Value>(s).ok())
                    .unwrap_or_else(|| json!({}));
                tool_calls.push(ToolCallRequest {
                    id,
                    name,
                    arguments,
                });
            }
        }

        let finish_reason = choice["finish_reason"]
            .as_str()
            .map(FinishReason::parse)
            .unwrap_or(FinishReason::Stop);

        let usage = Usage {
            prompt_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: body["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(Completion {
            text,
            tool_calls,
            finish_reason,
            usage,
        })
    }
}

#[async_trait]
impl ModelProvider for LmStudioProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat_completion(&self, req: ChatRequest) -> anyhow::Result<Completion> {
        let mut body = json!({
            "model": self.model,
            "messages": Self::serialize_messages(&req.messages),
            "max_tokens": req.max_output_tokens,
            "temperature": req.temperature.unwrap_or(self.temperature),
            "stream": false,
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(Self::serialize_tools(&req.tools));
        }

        debug!(url = %self.chat_url, model = %self.model, "chat completion request");

        let mut http = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        let resp = http.send().await.context("model endpoint unreachable")?;
        let status = resp.status();
        let body: Value = resp.json().await.context("invalid completion response")?;
        if !status.is_success() {
            bail!("model endpoint returned {status}: {body}");
        }
        Self::parse_completion(&body)
    }

    async fn preflight(&self) -> anyhow::Result<Vec<String>> {
        let mut http = self.client.get(&self.models_url);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        let resp = http
            .send()
            .await
            .context("provider preflight: endpoint unreachable")?;
        if !resp.status().is_success() {
            bail!("provider preflight: endpoint returned {}", resp.status());
        }
        let body: Value = resp
            .json()
            .await
            .context("provider preflight: invalid /models response")?;
        let ids = body["data"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_text_completion() {
        let body = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        });
        let c = LmStudioProvider::parse_completion(&body).unwrap();
        assert_eq!(c.text, "hello");
        assert_eq!(c.finish_reason, FinishReason::Stop);
        assert!(c.tool_calls.is_empty());
        assert_eq!(c.usage.prompt_tokens, 12);
    }

    #[test]
    fn parse_native_tool_call() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "bash", "arguments": "{\"command\":\"pwd\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let c = LmStudioProvider::parse_completion(&body).unwrap();
        assert_eq!(c.finish_reason, FinishReason::ToolCalls);
        assert_eq!(c.tool_calls.len(), 1);
        assert_eq!(c.tool_calls[0].name, "bash");
        assert_eq!(c.tool_calls[0].arguments["command"], "pwd");
    }

    #[test]
    fn empty_tool_call_id_gets_synthetic_fallback() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "",
                        "function": {"name": "read", "arguments": "{}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let c = LmStudioProvider::parse_completion(&body).unwrap();
        assert_eq!(c.tool_calls[0].id, "call_synthetic_0");
    }

    #[test]
    fn nameless_tool_call_is_dropped() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"id": "x", "function": {"name": "", "arguments": "{}"}}]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let c = LmStudioProvider::parse_completion(&body).unwrap();
        assert!(c.tool_calls.is_empty());
    }

    #[test]
    fn invalid_argument_json_degrades_to_empty_object() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "c",
                        "function": {"name": "bash", "arguments": "{broken"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let c = LmStudioProvider::parse_completion(&body).unwrap();
        assert_eq!(c.tool_calls[0].arguments, json!({}));
    }

    #[test]
    fn missing_choices_is_an_error() {
        assert!(LmStudioProvider::parse_completion(&json!({"choices": []})).is_err());
    }

    #[test]
    fn tool_message_serialization_carries_call_id() {
        let msgs = vec![Message::tool("c9", "bash", "output")];
        let v = LmStudioProvider::serialize_messages(&msgs);
        assert_eq!(v[0]["tool_call_id"], "c9");
        assert_eq!(v[0]["role"], "tool");
    }
}
