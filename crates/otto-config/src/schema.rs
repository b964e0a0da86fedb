// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should default to enabled need a named
/// function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Provider identifier: "lmstudio" (any OpenAI-compatible local server),
    /// "openai", or "mock" (tests / offline dry-runs).
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Base URL of the OpenAI-compatible endpoint, ending before
    /// `/chat/completions`.
    pub base_url: Option<String>,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in version-controlled files.
    pub api_key: Option<String>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Fail startup when the provider preflight cannot reach the endpoint.
    /// When false, an unreachable provider surfaces per-turn instead.
    #[serde(default = "default_true")]
    pub preflight_required: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "lmstudio".into(),
            name: "local-model".into(),
            base_url: Some("http://127.0.0.1:1234/v1".into()),
            api_key_env: None,
            api_key: None,
            temperature: None,
            preflight_required: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Correction retries per turn for parse and validation failures.
    pub retry_limit: u32,
    /// Independent retry budget for final-verification re-prompts.
    pub verification_retry_limit: u32,
    /// Hard ceiling on tool calls within one turn.
    pub max_tool_calls_per_step: u32,
    /// Maximum number of truncated-generation continuations per turn.
    pub max_continuations: u32,
    /// Wall-clock budget for one turn, in milliseconds.
    pub turn_timeout_ms: u64,
    /// Bound on bus queue draining at shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Render tool JSON schemas into the step layer of the prompt (needed
    /// for models without native tool-call support).
    #[serde(default = "default_true")]
    pub include_tool_schemas_in_prompt: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            retry_limit: 2,
            verification_retry_limit: 2,
            max_tool_calls_per_step: 16,
            max_continuations: 3,
            turn_timeout_ms: 120_000,
            shutdown_timeout_ms: 5_000,
            include_tool_schemas_in_prompt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    /// Total input + output token window of the target model.
    pub context_limit: usize,
    /// Tokens reserved for the completion before layer allocation.
    pub output_reserve: usize,
    /// Extra guard subtracted when computing max_output_tokens.
    pub completion_safety_buffer: usize,
    /// Characters per token for the estimator.
    pub chars_per_token: f64,
    /// Multiplier applied to estimates to stay under real tokenizer counts.
    pub safety_margin: f64,
    #[serde(default)]
    pub layers: LayerBudgetsConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_limit: 32_768,
            output_reserve: 2_048,
            completion_safety_buffer: 256,
            chars_per_token: 4.0,
            safety_margin: 1.1,
            layers: LayerBudgetsConfig::default(),
        }
    }
}

/// Per-layer token caps.  The fixed layers are scaled proportionally when
/// their sum exceeds the input budget; `conversation` is allocated from
/// whatever remains after the fixed layers render.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerBudgetsConfig {
    pub system: usize,
    pub step: usize,
    pub skills: usize,
    pub identity: usize,
    pub soul: usize,
    pub user: usize,
    pub boot: usize,
    pub memory: usize,
    pub bootstrap: usize,
    pub prior: usize,
    pub conversation: usize,
}

impl Default for LayerBudgetsConfig {
    fn default() -> Self {
        Self {
            system: 2_048,
            step: 2_048,
            skills: 1_536,
            identity: 512,
            soul: 512,
            user: 512,
            boot: 512,
            memory: 1_024,
            bootstrap: 512,
            prior: 1_536,
            conversation: 4_096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    /// Glob patterns for bash commands that are always rejected.
    pub deny_patterns: Vec<String>,
    /// Default timeout for bash tool invocations, in seconds.
    pub bash_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            deny_patterns: vec![
                "rm -rf /*".into(),
                "rm -rf ~*".into(),
                "find / *".into(),
                "cat /dev/*".into(),
                "dd *of=/dev/*".into(),
                "* > /dev/sd*".into(),
            ],
            bash_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Character bound for the rolling session summary.
    pub summary_max_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            summary_max_chars: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IpcTransport {
    #[default]
    Unix,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpcConfig {
    #[serde(default)]
    pub transport: IpcTransport,
    /// Unix socket path override.  Defaults to `<agent_dir>/agent.sock`.
    pub socket_path: Option<String>,
    /// TCP loopback address used when transport = tcp.
    pub tcp_addr: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            transport: IpcTransport::Unix,
            socket_path: None,
            tcp_addr: "127.0.0.1:7877".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Root for runtime state.  Defaults to `~/.otto`.
    pub agent_dir: Option<String>,
    /// Session transcript directory.  Defaults to `<agent_dir>/sessions`.
    pub sessions_dir: Option<String>,
    /// Workflow definition directory.  Defaults to `<agent_dir>/workflows`.
    pub workflows_dir: Option<String>,
    /// Run snapshot directory.  Defaults to `<agent_dir>/runs`.
    pub runs_dir: Option<String>,
    /// Sandbox root for tool and workflow file operations.
    /// Defaults to `<agent_dir>/workspace`.
    pub workspace_root: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
