// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use otto_model::{Message, Role};
use tracing::debug;

use crate::builder::{BuiltContext, ContextBuilder};

/// Instruction appended when asking the model to resume a truncated answer.
const CONTINUATION_INSTRUCTION: &str = "Your previous response was cut off by \
the output limit. Continue EXACTLY where you stopped. Do not repeat anything \
already written; do not restart the answer.";

/// Re-pack the prompt for a continuation call after a `length`/`max_tokens`
/// finish.
///
/// The pinned material — system rules and the tail of the assistant's
/// truncated text — survives verbatim; everything earlier is compacted into
/// a single summary block sized to whatever input budget remains.
pub fn build_continuation(
    builder: &ContextBuilder,
    system_rules: &str,
    earlier_messages: &[Message],
    last_assistant_text: &str,
) -> BuiltContext {
    let est = builder.estimator();
    let input_budget = builder.input_budget();

    // Keep only the tail of a very long partial answer; the model needs the
    // break point, not the whole accumulation.
    let assistant_tail = tail_chars(last_assistant_text, est.chars_for_tokens(input_budget / 4));

    const SUMMARY_HEADER: &str = "Compacted context of the conversation so far:\n";
    let pinned_cost = est.estimate(system_rules)
        + est.estimate(&assistant_tail)
        + est.estimate(CONTINUATION_INSTRUCTION)
        + est.estimate(SUMMARY_HEADER);
    let summary_budget = input_budget.saturating_sub(pinned_cost);

    let raw_summary = earlier_messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
                Role::System => "system",
            };
            format!("{role}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n");
    let summary = est.truncate(&raw_summary, summary_budget);

    let mut messages = vec![Message::system(system_rules)];
    if !summary.is_empty() {
        messages.push(Message::system(format!("{SUMMARY_HEADER}{summary}")));
    }
    if !assistant_tail.is_empty() {
        messages.push(Message::assistant(assistant_tail));
    }
    messages.push(Message::user(CONTINUATION_INSTRUCTION));

    let used_input_tokens: usize = messages.iter().map(|m| est.estimate(&m.content)).sum();
    let max_output_tokens = builder
        .config()
        .context_limit
        .saturating_sub(used_input_tokens)
        .saturating_sub(builder.config().completion_safety_buffer)
        .max(1) as u32;

    debug!(
        used_input_tokens,
        max_output_tokens, "continuation context packed"
    );

    BuiltContext {
        messages,
        max_output_tokens,
        compacted: true,
        used_input_tokens,
    }
}

fn tail_chars(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
