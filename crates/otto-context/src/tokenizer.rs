// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use otto_model::ModelProvider;

/// Approximate token costing.
///
/// The default is the character-ratio heuristic (`len / chars_per_token`)
/// inflated by a safety margin so the estimate errs high.  When the provider
/// carries a real tokenizer, it is preferred and the heuristic is the silent
/// fallback.
#[derive(Clone)]
pub struct TokenEstimator {
    chars_per_token: f64,
    safety_margin: f64,
    provider: Option<Arc<dyn ModelProvider>>,
}

impl TokenEstimator {
    pub fn new(chars_per_token: f64, safety_margin: f64) -> Self {
        Self {
            chars_per_token: if chars_per_token <= 0.0 { 4.0 } else { chars_per_token },
            safety_margin: if safety_margin <= 0.0 { 1.0 } else { safety_margin },
            provider: None,
        }
    }

    pub fn from_config(cfg: &otto_config::ContextConfig) -> Self {
        Self::new(cfg.chars_per_token, cfg.safety_margin)
    }

    /// Prefer `provider.count_tokens` over the heuristic.
    pub fn with_provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn estimate(&self, text: &str) -> usize {
        if let Some(p) = &self.provider {
            if let Some(n) = p.count_tokens(text) {
                return n;
            }
        }
        self.heuristic(text)
    }

    fn heuristic(&self, text: &str) -> usize {
        ((text.len() as f64 / self.chars_per_token) * self.safety_margin).ceil() as usize
    }

    /// Character count that fits within `tokens` under the heuristic.
    pub fn chars_for_tokens(&self, tokens: usize) -> usize {
        ((tokens as f64 * self.chars_per_token) / self.safety_margin).floor() as usize
    }

    /// Truncate `text` to fit `budget` tokens, ending with a three-character
    /// ellipsis marker when anything was cut.  A zero budget yields an empty
    /// string.
    pub fn truncate(&self, text: &str, budget: usize) -> String {
        if budget == 0 {
            return String::new();
        }
        if self.estimate(text) <= budget {
            return text.to_string();
        }
        let mut keep = self.chars_for_tokens(budget).saturating_sub(3);
        loop {
            let truncated: String = text.chars().take(keep).chain("...".chars()).collect();
            if self.estimate(&truncated) <= budget || keep == 0 {
                return truncated;
            }
            keep = keep.saturating_sub((keep / 10).max(1));
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
