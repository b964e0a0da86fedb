// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use otto_config::ContextConfig;
use otto_model::{Message, Role, ToolSchema};
use tracing::debug;

use crate::{
    layers::{Layer, LayerBudgets, FIXED_LAYER_ORDER},
    tokenizer::TokenEstimator,
};

/// Stable identity and tool-protocol rules rendered into every system layer.
const CORE_IDENTITY: &str = "You are otto, a local coding agent. You operate \
inside a sandboxed workspace and complete the operator's request end to end.";

const TOOL_CALL_FORMAT: &str = "To call a tool, respond with ONLY a JSON \
object of the form {\"tool_call\": {\"name\": \"<tool>\", \"arguments\": \
{...}}} and nothing else. To answer, respond with plain text. Never mix the \
two in one response.";

/// Scope details of the workflow step a turn is executing for.
#[derive(Debug, Clone, Default)]
pub struct StepScope {
    pub step_id: String,
    pub instruction: String,
}

/// On-disk prompt layer texts (identity/soul/user/boot/memory/bootstrap).
#[derive(Debug, Clone, Default)]
pub struct LayerTexts {
    pub identity: String,
    pub soul: String,
    pub user: String,
    pub boot: String,
    pub memory: String,
    pub bootstrap: String,
}

/// One conversation turn offered to the builder.  Only `user` and
/// `assistant` roles survive into the output.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct BuildInputs {
    pub step: Option<StepScope>,
    pub tools: Vec<ToolSchema>,
    pub include_tool_schemas_in_prompt: bool,
    pub layers: LayerTexts,
    pub skill_content: String,
    /// `(step_id, output)` pairs of completed workflow steps.
    pub prior_steps: Vec<(String, String)>,
    pub conversation: Vec<ConversationTurn>,
    pub conversation_summary: Option<String>,
    pub user_input: String,
    /// Extra system rules appended after the tool protocol.
    pub extra_rules: Option<String>,
}

/// The bounded message list for one model call.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub messages: Vec<Message>,
    pub max_output_tokens: u32,
    pub compacted: bool,
    /// Estimated input tokens actually used.
    pub used_input_tokens: usize,
}

pub struct ContextBuilder {
    cfg: ContextConfig,
    budgets: LayerBudgets,
    estimator: TokenEstimator,
}

impl ContextBuilder {
    pub fn new(cfg: ContextConfig, estimator: TokenEstimator) -> Self {
        let budgets = LayerBudgets::from_config(&cfg.layers);
        Self {
            cfg,
            budgets,
            estimator,
        }
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    pub fn config(&self) -> &ContextConfig {
        &self.cfg
    }

    /// Tokens available for input after the output reserve and safety buffer.
    pub fn input_budget(&self) -> usize {
        self.cfg
            .context_limit
            .saturating_sub(self.cfg.output_reserve)
            .saturating_sub(self.cfg.completion_safety_buffer)
    }

    /// Compose the bounded message list.
    ///
    /// Fixed layers render in [`FIXED_LAYER_ORDER`], each capped at
    /// `min(budget, remaining)` and truncated with a `...` marker; the
    /// conversation tail is selected newest-backward from whatever remains;
    /// the user input lands last as its own `user` message.
    pub fn build(&self, inputs: &BuildInputs) -> BuiltContext {
        let input_budget = self.input_budget();
        let budgets = self.budgets.scale_to_fit(input_budget);

        let mut remaining = input_budget;

        // The trailing user message is mandatory; reserve it up front so
        // layer allocation cannot squeeze it out.
        let user_cost = self.estimator.estimate(&inputs.user_input);
        remaining = remaining.saturating_sub(user_cost);

        let mut rendered: Vec<(Layer, String)> = Vec::new();
        for layer in FIXED_LAYER_ORDER {
            let text = self.render_layer(*layer, inputs);
            if text.trim().is_empty() {
                continue;
            }
            let cap = budgets.budget(*layer).min(remaining);
            let truncated = self.estimator.truncate(&text, cap);
            if truncated.is_empty() {
                continue;
            }
            let cost = self.estimator.estimate(&truncated);
            remaining = remaining.saturating_sub(cost);
            rendered.push((*layer, truncated));
        }

        // Conversation tail: newest backward within its cap, emitted in
        // original order, user/assistant roles only.
        let conversation_cap = budgets.conversation.min(remaining);
        let mut selected: Vec<&ConversationTurn> = Vec::new();
        let mut conv_budget = conversation_cap;
        for turn in inputs
            .conversation
            .iter()
            .rev()
            .filter(|t| matches!(t.role, Role::User | Role::Assistant))
        {
            let cost = self.estimator.estimate(&turn.content);
            if cost > conv_budget {
                break;
            }
            conv_budget -= cost;
            selected.push(turn);
        }
        selected.reverse();
        remaining = remaining.saturating_sub(conversation_cap - conv_budget);

        // Assemble: one system message carrying the fixed layers, then the
        // conversation tail, then the current input.
        let system_text = rendered
            .iter()
            .map(|(layer, text)| format!("## {}\n{}", layer.as_str(), text))
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut messages = Vec::with_capacity(selected.len() + 2);
        if !system_text.is_empty() {
            messages.push(Message::system(system_text));
        }
        for turn in selected {
            messages.push(Message {
                role: turn.role,
                content: turn.content.clone(),
                tool_call_id: None,
                name: None,
            });
        }
        messages.push(Message::user(inputs.user_input.clone()));

        let used_input_tokens = input_budget - remaining;
        let max_output_tokens = self
            .cfg
            .context_limit
            .saturating_sub(used_input_tokens)
            .saturating_sub(self.cfg.completion_safety_buffer)
            .max(1) as u32;

        debug!(
            used_input_tokens,
            max_output_tokens,
            messages = messages.len(),
            "context built"
        );

        BuiltContext {
            messages,
            max_output_tokens,
            compacted: false,
            used_input_tokens,
        }
    }

    fn render_layer(&self, layer: Layer, inputs: &BuildInputs) -> String {
        match layer {
            Layer::System => {
                let mut parts = vec![CORE_IDENTITY.to_string(), TOOL_CALL_FORMAT.to_string()];
                if let Some(step) = &inputs.step {
                    parts.push(format!(
                        "You are executing workflow step '{}'. Stay within its scope.",
                        step.step_id
                    ));
                }
                if let Some(rules) = &inputs.extra_rules {
                    parts.push(rules.clone());
                }
                parts.join("\n\n")
            }
            Layer::Step => {
                let mut parts = Vec::new();
                if let Some(step) = &inputs.step {
                    parts.push(step.instruction.clone());
                }
                if inputs.include_tool_schemas_in_prompt && !inputs.tools.is_empty() {
                    parts.push(render_tool_schemas(&inputs.tools));
                }
                parts.join("\n\n")
            }
            Layer::Skills => inputs.skill_content.clone(),
            Layer::Identity => inputs.layers.identity.clone(),
            Layer::Soul => inputs.layers.soul.clone(),
            Layer::User => inputs.layers.user.clone(),
            Layer::Boot => inputs.layers.boot.clone(),
            Layer::Memory => inputs.layers.memory.clone(),
            Layer::Bootstrap => inputs.layers.bootstrap.clone(),
            Layer::Prior => {
                let mut parts: Vec<String> = inputs
                    .prior_steps
                    .iter()
                    .map(|(id, output)| format!("[{id}] {output}"))
                    .collect();
                if let Some(summary) = &inputs.conversation_summary {
                    parts.push(format!("Earlier conversation: {summary}"));
                }
                parts.join("\n")
            }
            Layer::Conversation => String::new(),
        }
    }
}

fn render_tool_schemas(tools: &[ToolSchema]) -> String {
    let rendered: Vec<String> = tools
        .iter()
        .map(|t| {
            format!(
                "- {}: {}\n  parameters: {}",
                t.name, t.description, t.parameters
            )
        })
        .collect();
    format!("Available tools:\n{}", rendered.join("\n"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use otto_config::ContextConfig;

    fn builder() -> ContextBuilder {
        let cfg = ContextConfig::default();
        let est = TokenEstimator::from_config(&cfg);
        ContextBuilder::new(cfg, est)
    }

    fn small_builder(context_limit: usize) -> ContextBuilder {
        let cfg = ContextConfig {
            context_limit,
            output_reserve: context_limit / 8,
            completion_safety_buffer: 16,
            ..ContextConfig::default()
        };
        let est = TokenEstimator::from_config(&cfg);
        ContextBuilder::new(cfg, est)
    }

    fn turn(role: Role, content: &str) -> ConversationTurn {
        ConversationTurn {
            role,
            content: content.into(),
        }
    }

    #[test]
    fn minimal_build_has_system_and_user() {
        let b = builder();
        let ctx = b.build(&BuildInputs {
            user_input: "hello".into(),
            ..BuildInputs::default()
        });
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.messages[0].role, Role::System);
        assert_eq!(ctx.messages.last().unwrap().content, "hello");
        assert!(!ctx.compacted);
    }

    #[test]
    fn budget_invariant_holds() {
        let b = builder();
        let ctx = b.build(&BuildInputs {
            user_input: "input ".repeat(50),
            layers: LayerTexts {
                identity: "i".repeat(4_000),
                memory: "m".repeat(8_000),
                ..LayerTexts::default()
            },
            conversation: (0..50)
                .map(|i| turn(Role::User, &format!("conversation message {i}")))
                .collect(),
            ..BuildInputs::default()
        });
        let cfg = b.config();
        assert!(
            ctx.used_input_tokens + cfg.output_reserve + cfg.completion_safety_buffer
                <= cfg.context_limit,
            "used {} + reserve {} + buffer {} > limit {}",
            ctx.used_input_tokens,
            cfg.output_reserve,
            cfg.completion_safety_buffer,
            cfg.context_limit
        );
    }

    #[test]
    fn oversized_layer_is_truncated_with_marker() {
        let b = small_builder(2_000);
        let ctx = b.build(&BuildInputs {
            user_input: "q".into(),
            layers: LayerTexts {
                identity: "identity ".repeat(2_000),
                ..LayerTexts::default()
            },
            ..BuildInputs::default()
        });
        let system = &ctx.messages[0].content;
        assert!(system.contains("identity"));
        assert!(system.contains("..."), "truncation marker missing");
    }

    #[test]
    fn conversation_keeps_newest_in_original_order() {
        let b = small_builder(4_000);
        let conv: Vec<ConversationTurn> = (0..40)
            .map(|i| {
                turn(
                    if i % 2 == 0 { Role::User } else { Role::Assistant },
                    &format!("message number {i} with padding text to cost tokens"),
                )
            })
            .collect();
        let ctx = b.build(&BuildInputs {
            user_input: "now".into(),
            conversation: conv,
            ..BuildInputs::default()
        });
        let conv_msgs: Vec<&Message> = ctx.messages[1..ctx.messages.len() - 1].iter().collect();
        assert!(!conv_msgs.is_empty());
        // Newest survive.
        assert!(conv_msgs
            .last()
            .unwrap()
            .content
            .contains("message number 39"));
        // Original order preserved.
        let indices: Vec<usize> = conv_msgs
            .iter()
            .map(|m| {
                m.content
                    .split_whitespace()
                    .nth(2)
                    .unwrap()
                    .parse::<usize>()
                    .unwrap()
            })
            .collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }

    #[test]
    fn tool_roles_never_enter_conversation() {
        let b = builder();
        let ctx = b.build(&BuildInputs {
            user_input: "x".into(),
            conversation: vec![
                turn(Role::Tool, "tool output"),
                turn(Role::System, "system junk"),
                turn(Role::User, "real question"),
            ],
            ..BuildInputs::default()
        });
        assert!(ctx.messages.iter().all(|m| m.role != Role::Tool));
        assert!(!ctx
            .messages
            .iter()
            .any(|m| m.content.contains("system junk")));
    }

    #[test]
    fn tool_schemas_render_into_step_layer_when_enabled() {
        let b = builder();
        let tools = vec![ToolSchema {
            name: "bash".into(),
            description: "run a command".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let with = b.build(&BuildInputs {
            user_input: "x".into(),
            step: Some(StepScope {
                step_id: "build".into(),
                instruction: "compile the project".into(),
            }),
            tools: tools.clone(),
            include_tool_schemas_in_prompt: true,
            ..BuildInputs::default()
        });
        assert!(with.messages[0].content.contains("Available tools"));

        let without = b.build(&BuildInputs {
            user_input: "x".into(),
            tools,
            include_tool_schemas_in_prompt: false,
            ..BuildInputs::default()
        });
        assert!(!without.messages[0].content.contains("Available tools"));
    }

    #[test]
    fn prior_layer_carries_steps_and_summary() {
        let b = builder();
        let ctx = b.build(&BuildInputs {
            user_input: "x".into(),
            prior_steps: vec![("prepare".into(), "fetched sources".into())],
            conversation_summary: Some("we discussed the build".into()),
            ..BuildInputs::default()
        });
        let system = &ctx.messages[0].content;
        assert!(system.contains("[prepare] fetched sources"));
        assert!(system.contains("we discussed the build"));
    }

    #[test]
    fn max_output_tokens_is_positive_even_when_squeezed() {
        let b = small_builder(256);
        let ctx = b.build(&BuildInputs {
            user_input: "word ".repeat(500),
            ..BuildInputs::default()
        });
        assert!(ctx.max_output_tokens >= 1);
    }
}
