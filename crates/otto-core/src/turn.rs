// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use otto_bus::{payload, Event, EventBus, EventType, InputClaims};
use otto_config::AgentConfig;
use otto_context::{build_continuation, BuildInputs, ContextBuilder, ConversationTurn, LayerTexts, StepScope};
use otto_memory::{SessionMemory, SessionTurn, TurnType};
use otto_model::{ChatRequest, FinishReason, Message, ModelProvider, Role, ToolCallRequest};
use otto_tools::{ToolCall, ToolContext, ToolError, ToolRegistry, WriteRollback};
use otto_workspace::{PromptLayers, WorkspaceManager};

use crate::contract::{derive_contract, verify, WriteCheck};
use crate::parser::{parse_completion, ParseResult};

/// Everything the turn loop needs, injected by the lifecycle.
pub struct TurnLoopDeps {
    pub bus: EventBus,
    pub provider: Arc<dyn ModelProvider>,
    pub tools: Arc<ToolRegistry>,
    pub workspace: Arc<WorkspaceManager>,
    pub memory: Arc<SessionMemory>,
    pub builder: Arc<ContextBuilder>,
    pub claims: Arc<InputClaims>,
    pub agent: AgentConfig,
    pub shutdown: watch::Receiver<bool>,
}

/// The per-event agent state machine.
///
/// Consumes `user:input` and agent-typed `workflow:step:start`; always emits
/// exactly one terminal `agent:response` per consumed event, rolling back
/// filesystem mutations on failure.
pub struct TurnLoop {
    deps: TurnLoopDeps,
}

/// Where a turn ended up.  `failed` turns trigger rollback before the
/// terminal response goes out.
#[derive(Debug, Clone)]
struct TurnOutcome {
    text: String,
    finish_reason: FinishReason,
    error: Option<String>,
    failed: bool,
}

impl TurnOutcome {
    fn ok(text: String, finish_reason: FinishReason) -> Self {
        Self {
            text,
            finish_reason,
            error: None,
            failed: false,
        }
    }

    fn tool_limit(max: u32) -> Self {
        Self {
            text: format!("Tool call limit reached ({max} calls); stopping here."),
            finish_reason: FinishReason::ToolLimit,
            error: None,
            failed: false,
        }
    }

    fn fail(text: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: FinishReason::InternalError,
            error: Some(error.into()),
            failed: true,
        }
    }
}

/// Mutable state of one in-flight turn.
struct TurnState {
    messages: Vec<Message>,
    max_output_tokens: u32,
    tool_call_count: u32,
    tool_call_history: Vec<ToolCall>,
    tool_result_history: Vec<String>,
    correction_retries: u32,
    tool_retries: u32,
    verify_retries: u32,
    continuation_count: u32,
    accumulated_text_parts: Vec<String>,
}

/// What one tool call did to the control flow.
enum ToolStep {
    /// Result (or retryable failure) recorded; make another model call.
    Continue,
    /// The turn is over.
    Terminal(TurnOutcome),
}

impl TurnLoop {
    pub fn new(deps: TurnLoopDeps) -> Arc<Self> {
        Arc::new(Self { deps })
    }

    /// Subscribe the loop's handlers.  Must be called after the workflow
    /// engine subscribed, so parked `wait_for_input` claims are honoured.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.deps.bus.subscribe(
            Some(EventType::UserInput),
            Arc::new(move |event| {
                let this = Arc::clone(&this);
                Box::pin(async move {
                    this.on_user_input(event).await;
                    Ok(())
                })
            }),
        );

        let this = Arc::clone(self);
        self.deps.bus.subscribe(
            Some(EventType::WorkflowStepStart),
            Arc::new(move |event| {
                let this = Arc::clone(&this);
                Box::pin(async move {
                    this.on_step_start(event).await;
                    Ok(())
                })
            }),
        );
    }

    async fn on_user_input(&self, event: Event) {
        // A parked workflow step already consumed this input.
        if self.deps.claims.is_consumed(&event) {
            debug!(session = %event.session_id, "user:input consumed by workflow claim");
            return;
        }
        let payload: payload::UserInput = match event.content_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed user:input payload");
                return;
            }
        };
        self.persist(
            &event.session_id,
            SessionTurn::new("user", TurnType::UserInput, payload.text.clone()),
        )
        .await;

        let outcome = self
            .drive_turn(&event.session_id, &payload.text, None)
            .await;

        self.persist(
            &event.session_id,
            SessionTurn::new("assistant", TurnType::AgentResponse, outcome.text.clone()),
        )
        .await;

        let _ = self.deps.bus.publish(
            Event::new(
                EventType::AgentResponse,
                serde_json::to_value(payload::AgentResponse {
                    text: outcome.text,
                    finish_reason: outcome.finish_reason.as_str().to_string(),
                    request_id: payload.request_id,
                    run_id: None,
                    step_id: None,
                    error: outcome.error,
                })
                .unwrap_or_default(),
            )
            .with_session(&event.session_id),
        );
    }

    async fn on_step_start(&self, event: Event) {
        let step: payload::StepStart = match event.content_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed workflow:step:start payload");
                return;
            }
        };

        let outcome = self
            .drive_turn(&event.session_id, &step.instruction, Some(&step))
            .await;

        let completed = !outcome.failed;
        let _ = self.deps.bus.publish(
            Event::new(
                EventType::AgentResponse,
                serde_json::to_value(payload::AgentResponse {
                    text: outcome.text.clone(),
                    finish_reason: outcome.finish_reason.as_str().to_string(),
                    request_id: None,
                    run_id: Some(step.run_id),
                    step_id: Some(step.step_id.clone()),
                    error: outcome.error.clone(),
                })
                .unwrap_or_default(),
            )
            .with_session(&event.session_id),
        );
        let _ = self.deps.bus.publish(
            Event::new(
                EventType::WorkflowStepComplete,
                serde_json::to_value(payload::StepComplete {
                    run_id: step.run_id,
                    step_id: step.step_id,
                    status: if completed { "completed" } else { "failed" }.to_string(),
                    output: completed.then(|| outcome.text.clone()),
                    error: outcome.error,
                })
                .unwrap_or_default(),
            )
            .with_session(&event.session_id),
        );
    }

    /// Wrap one turn in its timeout and abort signal, roll back on failure,
    /// and return the single terminal outcome.
    async fn drive_turn(
        &self,
        session_id: &str,
        text: &str,
        step: Option<&payload::StepStart>,
    ) -> TurnOutcome {
        let rollback = Arc::new(WriteRollback::new());
        let timeout = Duration::from_millis(self.deps.agent.turn_timeout_ms);
        let mut shutdown = self.deps.shutdown.clone();

        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                TurnOutcome::fail("Turn aborted: otto is shutting down.", "shutdown")
            }
            result = tokio::time::timeout(timeout, self.run_turn(session_id, text, step, &rollback)) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => TurnOutcome::fail(
                        format!("Turn timed out after {}ms.", self.deps.agent.turn_timeout_ms),
                        "turn timeout",
                    ),
                }
            }
        };

        if outcome.failed && rollback.captured_count() > 0 {
            match rollback.restore().await {
                Ok(n) => {
                    self.status(session_id, "tool:rollback", Some(format!("{n} file(s) restored")), None);
                }
                Err(e) => {
                    self.status(session_id, "tool:rollback_failed", Some(e.to_string()), None);
                }
            }
        }
        outcome
    }

    /// The model-call / tool-call loop proper.
    async fn run_turn(
        &self,
        session_id: &str,
        text: &str,
        step: Option<&payload::StepStart>,
        rollback: &Arc<WriteRollback>,
    ) -> TurnOutcome {
        let contract = derive_contract(text);
        let built = self.build_context(session_id, text, step).await;
        let system_rules = built
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let mut state = TurnState {
            messages: built.messages,
            max_output_tokens: built.max_output_tokens,
            tool_call_count: 0,
            tool_call_history: Vec::new(),
            tool_result_history: Vec::new(),
            correction_retries: 0,
            tool_retries: 0,
            verify_retries: 0,
            continuation_count: 0,
            accumulated_text_parts: Vec::new(),
        };

        let tool_schemas = match step {
            Some(s) if !s.tools.is_empty() => self.deps.tools.schemas_for(&s.tools),
            _ => self.deps.tools.schemas(),
        };
        let tool_ctx = ToolContext {
            workspace: Arc::clone(&self.deps.workspace),
            rollback: Arc::clone(rollback),
        };

        loop {
            self.status(session_id, "generating", None, None);
            let completion = match self
                .deps
                .provider
                .chat_completion(ChatRequest {
                    messages: state.messages.clone(),
                    tools: tool_schemas
                        .iter()
                        .map(|s| otto_model::ToolSchema {
                            name: s.name.clone(),
                            description: s.description.clone(),
                            parameters: s.parameters.clone(),
                        })
                        .collect(),
                    max_output_tokens: state.max_output_tokens,
                    temperature: None,
                })
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    return TurnOutcome::fail(
                        "The model endpoint could not be reached.",
                        format!("model call failed: {e}"),
                    )
                }
            };

            // Native tool calls bypass the parser.
            if completion.has_tool_calls() {
                if let Some(outcome) = self
                    .run_native_batch(session_id, &completion.tool_calls, &mut state, &tool_ctx)
                    .await
                {
                    return outcome;
                }
                continue;
            }

            match parse_completion(&completion) {
                ParseResult::ToolCall { name, arguments } => {
                    let call = ToolCall {
                        id: format!("call_{}", state.tool_call_count + 1),
                        name,
                        arguments,
                    };
                    match self
                        .execute_tool_call(session_id, call, &mut state, &tool_ctx)
                        .await
                    {
                        ToolStep::Continue => continue,
                        ToolStep::Terminal(outcome) => return outcome,
                    }
                }
                ParseResult::ParseError { error } => {
                    if state.correction_retries >= self.deps.agent.retry_limit {
                        return TurnOutcome::fail(
                            "The model kept producing malformed tool calls.",
                            format!("parse error after retries: {error}"),
                        );
                    }
                    state.correction_retries += 1;
                    self.status(session_id, "parse:retry", Some(error.clone()), None);
                    state.messages.push(Message::assistant(&completion.text));
                    state.messages.push(Message::system(format!(
                        "Your last response was not interpretable: {error}. Reply with \
                         EITHER plain text OR a single JSON object \
                         {{\"tool_call\": {{\"name\": \"<tool>\", \"arguments\": {{...}}}}}}."
                    )));
                    continue;
                }
                ParseResult::Final { text: final_text } => {
                    if completion.finish_reason.is_truncated()
                        && state.continuation_count < self.deps.agent.max_continuations
                    {
                        state.continuation_count += 1;
                        state.accumulated_text_parts.push(final_text);
                        self.status(
                            session_id,
                            "continue",
                            Some(format!("continuation {}", state.continuation_count)),
                            None,
                        );
                        let accumulated = state.accumulated_text_parts.concat();
                        let packed = build_continuation(
                            &self.deps.builder,
                            &system_rules,
                            &state.messages,
                            &accumulated,
                        );
                        state.messages = packed.messages;
                        state.max_output_tokens = packed.max_output_tokens;
                        continue;
                    }

                    let mut full = state.accumulated_text_parts.concat();
                    full.push_str(&final_text);

                    let writes = self.write_checks(rollback).await;
                    match verify(&contract, &full, &writes) {
                        Ok(()) => return TurnOutcome::ok(full, completion.finish_reason),
                        Err(f) if f.retryable
                            && state.verify_retries < self.deps.agent.verification_retry_limit =>
                        {
                            state.verify_retries += 1;
                            self.status(session_id, "verify:retry", Some(f.reason.clone()), None);
                            state.messages.push(Message::assistant(&full));
                            state.messages.push(Message::system(format!(
                                "Your answer failed a safety check: {}. Address the problem \
                                 and answer again.",
                                f.reason
                            )));
                            state.accumulated_text_parts.clear();
                            continue;
                        }
                        Err(f) => {
                            return TurnOutcome::fail(
                                "The response failed final verification.",
                                format!("verification failed ({:?}): {}", f.verifier, f.reason),
                            )
                        }
                    }
                }
            }
        }
    }

    /// Execute a batch of native tool calls in order.  Returns a terminal
    /// outcome as soon as one call produces one.
    async fn run_native_batch(
        &self,
        session_id: &str,
        calls: &[ToolCallRequest],
        state: &mut TurnState,
        ctx: &ToolContext,
    ) -> Option<TurnOutcome> {
        for native in calls {
            let call = ToolCall {
                id: native.id.clone(),
                name: native.name.clone(),
                arguments: native.arguments.clone(),
            };
            match self.execute_tool_call(session_id, call, state, ctx).await {
                ToolStep::Continue => {}
                ToolStep::Terminal(outcome) => return Some(outcome),
            }
        }
        None
    }

    async fn execute_tool_call(
        &self,
        session_id: &str,
        call: ToolCall,
        state: &mut TurnState,
        ctx: &ToolContext,
    ) -> ToolStep {
        if state.tool_call_count >= self.deps.agent.max_tool_calls_per_step {
            return ToolStep::Terminal(TurnOutcome::tool_limit(
                self.deps.agent.max_tool_calls_per_step,
            ));
        }
        state.tool_call_count += 1;

        let call_json = json!({
            "tool_call": {"name": call.name, "arguments": call.arguments}
        })
        .to_string();

        self.status(
            session_id,
            "tool:start",
            None,
            Some(payload::ToolRef {
                name: call.name.clone(),
                call_id: Some(call.id.clone()),
            }),
        );

        match self.deps.tools.execute(&call, ctx).await {
            Ok(output) => {
                self.status(
                    session_id,
                    "tool:complete",
                    output.is_error.then(|| output.content.clone()),
                    Some(payload::ToolRef {
                        name: call.name.clone(),
                        call_id: Some(call.id.clone()),
                    }),
                );
                state.messages.push(Message::assistant(&call_json));
                state
                    .messages
                    .push(Message::tool(&call.id, &call.name, &output.content));
                state.tool_result_history.push(output.content.clone());
                self.persist(
                    session_id,
                    SessionTurn::new("assistant", TurnType::ToolCall, call_json),
                )
                .await;
                self.persist(
                    session_id,
                    SessionTurn::new("tool", TurnType::ToolResult, output.content),
                )
                .await;
                state.tool_call_history.push(call);
                ToolStep::Continue
            }
            Err(ToolError::InvalidArgument(msg)) => {
                if state.correction_retries >= self.deps.agent.retry_limit {
                    return ToolStep::Terminal(TurnOutcome::fail(
                        "The model kept producing invalid tool arguments.",
                        format!("validation failed after retries: {msg}"),
                    ));
                }
                state.correction_retries += 1;
                self.status(
                    session_id,
                    "tool:retry",
                    Some(msg.clone()),
                    Some(payload::ToolRef {
                        name: call.name.clone(),
                        call_id: Some(call.id.clone()),
                    }),
                );
                state.messages.push(Message::assistant(&call_json));
                state.messages.push(Message::system(format!(
                    "The tool call was rejected: {msg}. Correct the arguments and try again."
                )));
                ToolStep::Continue
            }
            Err(e) => {
                // PathEscape / Timeout / ExecutionError: the call is dead,
                // but the model gets the failure and may try another way.
                let msg = e.to_string();
                if state.tool_retries >= self.deps.agent.retry_limit {
                    return ToolStep::Terminal(TurnOutcome::fail(
                        "A tool kept failing.",
                        format!("tool execution failed after retries: {msg}"),
                    ));
                }
                state.tool_retries += 1;
                self.status(
                    session_id,
                    "tool:retry",
                    Some(msg.clone()),
                    Some(payload::ToolRef {
                        name: call.name.clone(),
                        call_id: Some(call.id.clone()),
                    }),
                );
                state.messages.push(Message::assistant(&call_json));
                state
                    .messages
                    .push(Message::tool(&call.id, &call.name, format!("error: {msg}")));
                ToolStep::Continue
            }
        }
    }

    async fn build_context(
        &self,
        session_id: &str,
        text: &str,
        step: Option<&payload::StepStart>,
    ) -> otto_context::BuiltContext {
        let layers = PromptLayers::load(&self.deps.workspace).await;
        let skill_content = match step {
            Some(s) if !s.load_skills.is_empty() => {
                PromptLayers::load_skills(&self.deps.workspace, &s.load_skills).await
            }
            _ => String::new(),
        };

        let estimator = self.deps.builder.estimator().clone();
        let conversation = self
            .deps
            .memory
            .collect_conversation(
                session_id,
                self.deps.builder.config().layers.conversation,
                move |t| estimator.estimate(t),
            )
            .await
            .unwrap_or_default();

        let inputs = BuildInputs {
            step: step.map(|s| StepScope {
                step_id: s.step_id.clone(),
                instruction: s.instruction.clone(),
            }),
            tools: match step {
                Some(s) if !s.tools.is_empty() => self
                    .deps
                    .tools
                    .schemas_for(&s.tools)
                    .into_iter()
                    .map(|t| otto_model::ToolSchema {
                        name: t.name,
                        description: t.description,
                        parameters: t.parameters,
                    })
                    .collect(),
                _ => self
                    .deps
                    .tools
                    .schemas()
                    .into_iter()
                    .map(|t| otto_model::ToolSchema {
                        name: t.name,
                        description: t.description,
                        parameters: t.parameters,
                    })
                    .collect(),
            },
            include_tool_schemas_in_prompt: self.deps.agent.include_tool_schemas_in_prompt,
            layers: LayerTexts {
                identity: layers.identity,
                soul: layers.soul,
                user: layers.user,
                boot: layers.boot,
                memory: layers.memory,
                bootstrap: layers.bootstrap,
            },
            skill_content,
            prior_steps: step
                .map(|s| {
                    s.prior_steps
                        .iter()
                        .map(|p| (p.step_id.clone(), p.output.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            conversation: conversation
                .turns
                .iter()
                .map(|t| ConversationTurn {
                    role: if t.role == "assistant" {
                        Role::Assistant
                    } else {
                        Role::User
                    },
                    content: t.content.clone(),
                })
                .collect(),
            conversation_summary: conversation.summary,
            user_input: text.to_string(),
            extra_rules: None,
        };
        self.deps.builder.build(&inputs)
    }

    async fn write_checks(&self, rollback: &WriteRollback) -> Vec<WriteCheck> {
        let mut checks = Vec::new();
        for path in rollback.captured_paths() {
            let new_len = tokio::fs::metadata(&path)
                .await
                .map(|m| m.len() as usize)
                .unwrap_or(0);
            checks.push(WriteCheck {
                path: path.display().to_string(),
                existed_before: rollback.existed_before(&path).unwrap_or(false),
                old_len: rollback
                    .original_content(&path)
                    .map(|c| c.len())
                    .unwrap_or(0),
                new_len,
            });
        }
        checks
    }

    fn status(
        &self,
        session_id: &str,
        phase: &str,
        detail: Option<String>,
        tool: Option<payload::ToolRef>,
    ) {
        let _ = self.deps.bus.publish(
            Event::new(
                EventType::AgentStatus,
                serde_json::to_value(payload::AgentStatus {
                    phase: phase.to_string(),
                    detail,
                    tool,
                })
                .unwrap_or_default(),
            )
            .with_session(session_id),
        );
    }

    async fn persist(&self, session_id: &str, turn: SessionTurn) {
        if let Err(e) = self.deps.memory.append_turn(session_id, &turn).await {
            warn!(session = session_id, error = %e, "session memory append failed");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
