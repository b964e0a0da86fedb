// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod lmstudio;
pub mod mock;
mod provider;
mod types;

use std::sync::Arc;

pub use lmstudio::LmStudioProvider;
pub use mock::{MockProvider, ScriptedProvider};
pub use provider::{ChatRequest, ModelProvider, ToolSchema};
pub use types::{Completion, FinishReason, Message, Role, ToolCallRequest, Usage};

/// Build a provider from configuration.
///
/// "lmstudio" and "openai" both speak the OpenAI-compatible wire format; the
/// difference is only the default endpoint and whether an API key is sent.
/// "mock" yields the deterministic echo provider for offline runs and tests.
pub fn from_config(cfg: &otto_config::ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    let api_key = cfg.api_key.clone().or_else(|| {
        cfg.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    });
    match cfg.provider.as_str() {
        "lmstudio" => Ok(Arc::new(LmStudioProvider::new(
            "lmstudio",
            cfg.name.clone(),
            cfg.base_url
                .clone()
                .unwrap_or_else(|| "http://127.0.0.1:1234/v1".into()),
            api_key,
            cfg.temperature,
        ))),
        "openai" => Ok(Arc::new(LmStudioProvider::new(
            "openai",
            cfg.name.clone(),
            cfg.base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
            api_key,
            cfg.temperature,
        ))),
        "mock" => Ok(Arc::new(MockProvider)),
        other => anyhow::bail!("unknown model provider: {other}"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_builds_lmstudio() {
        let cfg = otto_config::ModelConfig::default();
        let p = from_config(&cfg).unwrap();
        assert_eq!(p.name(), "lmstudio");
    }

    #[test]
    fn from_config_builds_mock() {
        let cfg = otto_config::ModelConfig {
            provider: "mock".into(),
            ..otto_config::ModelConfig::default()
        };
        let p = from_config(&cfg).unwrap();
        assert_eq!(p.name(), "mock");
    }

    #[test]
    fn from_config_rejects_unknown_provider() {
        let cfg = otto_config::ModelConfig {
            provider: "martian".into(),
            ..otto_config::ModelConfig::default()
        };
        assert!(from_config(&cfg).is_err());
    }
}
