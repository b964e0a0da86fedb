// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock, Weak};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use otto_bus::{payload, Channel, Event, EventBus, EventType, InputClaims};
use otto_workspace::WorkspaceManager;

use crate::condition::Condition;
use crate::registry::WorkflowRegistry;
use crate::run::{Run, RunState, RunStore, StepState};
use crate::schema::{plan, validate, Step, StepType, Workflow};
use crate::template::substitute_args;

/// Dependencies injected at construction.
pub struct EngineDeps {
    pub bus: EventBus,
    pub store: RunStore,
    pub workspace: Arc<WorkspaceManager>,
    pub claims: Arc<InputClaims>,
}

struct ActiveRun {
    run: Run,
    workflow: Workflow,
    timer: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Default)]
struct EngineState {
    active: Option<ActiveRun>,
    queued: VecDeque<Run>,
}

/// Outcome of one scheduling pass over the active run.
enum Pass {
    /// Waiting on a step:complete, operator input, or approval.
    Parked,
    /// The active run reached a terminal state and was cleared.
    RunFinished,
}

/// Dependency-ordered step scheduler.
///
/// Purely event-driven: handlers never block the bus waiting for other bus
/// events.  Dispatching an `agent` step parks the run until the turn loop's
/// `workflow:step:complete` arrives; `wait_for_input` parks it until a
/// claimed `user:input` arrives; `system_*` steps apply inline and the
/// scheduler advances immediately.  One run is active at a time — further
/// `workflow:run:start` events queue FIFO.
pub struct WorkflowEngine {
    inner: Arc<Inner>,
}

struct Inner {
    deps: EngineDeps,
    registry: Arc<WorkflowRegistry>,
    state: Mutex<EngineState>,
    /// Self-handle for timer tasks; set once right after construction.
    weak_self: OnceLock<Weak<Inner>>,
}

impl WorkflowEngine {
    pub fn new(deps: EngineDeps, registry: Arc<WorkflowRegistry>) -> Self {
        let inner = Arc::new(Inner {
            deps,
            registry,
            state: Mutex::new(EngineState::default()),
            weak_self: OnceLock::new(),
        });
        let _ = inner.weak_self.set(Arc::downgrade(&inner));
        Self { inner }
    }

    /// Subscribe the engine's handlers.  Must run before the turn loop
    /// subscribes so parked input claims are honoured first.
    pub fn start(&self) {
        macro_rules! handle {
            ($ty:expr, $method:ident) => {{
                let inner = Arc::clone(&self.inner);
                self.inner.deps.bus.subscribe(
                    Some($ty),
                    Arc::new(move |event| {
                        let inner = Arc::clone(&inner);
                        Box::pin(async move {
                            inner.$method(event).await;
                            Ok(())
                        })
                    }),
                );
            }};
        }
        handle!(EventType::WorkflowRunStart, on_run_start);
        handle!(EventType::WorkflowStepComplete, on_step_complete);
        handle!(EventType::UserInput, on_user_input);
        handle!(EventType::ScheduleTrigger, on_schedule_trigger);
        handle!(EventType::WorkflowLint, on_lint);
        handle!(EventType::WorkflowDryRun, on_dry_run);
    }

    /// Re-queue non-terminal runs found on disk (crash recovery).
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let runs = self.inner.deps.store.load_all().await?;
        let mut restored = 0;
        {
            let mut state = self.inner.state.lock().await;
            for mut run in runs {
                if run.state.is_terminal() {
                    continue;
                }
                // A step that was mid-flight when the process died restarts.
                for step in &mut run.steps {
                    if step.state == StepState::Active {
                        step.state = StepState::Pending;
                    }
                }
                run.state = RunState::Queued;
                run.current_step_id = None;
                self.inner.persist(&mut run).await;
                state.queued.push_back(run);
                restored += 1;
            }
        }
        self.inner.pump().await;
        Ok(restored)
    }

    /// Abort the active run's timer.  Runs themselves persist across stops.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(active) = state.active.as_mut() {
            if let Some(timer) = active.timer.take() {
                timer.abort();
            }
        }
    }

    /// Cancel a queued or active run.
    pub async fn cancel_run(&self, run_id: u64) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            let is_active = state
                .active
                .as_ref()
                .map(|a| a.run.id == run_id)
                .unwrap_or(false);
            if is_active {
                self.inner
                    .finalize(&mut state, RunState::Cancelled, None)
                    .await;
            } else if let Some(pos) = state.queued.iter().position(|r| r.id == run_id) {
                let mut run = state.queued.remove(pos).unwrap();
                run.state = RunState::Cancelled;
                self.inner.persist(&mut run).await;
                self.inner.publish_run_complete(&run, None);
                return true;
            } else {
                return false;
            }
        }
        self.inner.pump().await;
        true
    }

    #[cfg(test)]
    pub(crate) async fn active_run_id(&self) -> Option<u64> {
        self.inner
            .state
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.run.id)
    }
}

impl Inner {
    // ── Event handlers ────────────────────────────────────────────────────────

    async fn on_run_start(&self, event: Event) {
        let payload: payload::RunStart = match event.content_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed workflow:run:start payload");
                return;
            }
        };

        let workflow = match self.registry.get(&payload.workflow_id) {
            Some(w) => w.clone(),
            None => {
                self.publish_status(
                    &event.session_id,
                    "workflow:rejected",
                    format!("unknown workflow: {}", payload.workflow_id),
                );
                return;
            }
        };

        let missing: Vec<&str> = workflow
            .inputs
            .iter()
            .filter(|i| i.required && payload.args.get(&i.name).is_none())
            .map(|i| i.name.as_str())
            .collect();
        if !missing.is_empty() {
            self.publish_status(
                &event.session_id,
                "workflow:rejected",
                format!(
                    "workflow '{}' is missing required input(s): {}",
                    workflow.id,
                    missing.join(", ")
                ),
            );
            return;
        }

        let id = match self.deps.store.next_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "could not allocate run id");
                return;
            }
        };

        let mut run = Run::new(id, &workflow, payload.args, event.session_id.clone());
        self.persist(&mut run).await;

        let _ = self.deps.bus.publish(
            Event::new(
                EventType::WorkflowRunQueued,
                serde_json::to_value(payload::RunQueued {
                    run_id: run.id,
                    workflow_id: run.workflow_id.clone(),
                })
                .unwrap_or_default(),
            )
            .with_session(&run.session_id),
        );

        self.state.lock().await.queued.push_back(run);
        self.pump().await;
    }

    async fn on_step_complete(&self, event: Event) {
        let payload: payload::StepComplete = match event.content_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed workflow:step:complete payload");
                return;
            }
        };

        {
            let mut state = self.state.lock().await;
            let active = match state.active.as_mut() {
                Some(a) if a.run.id == payload.run_id => a,
                _ => return,
            };
            if active.run.current_step_id.as_deref() != Some(payload.step_id.as_str()) {
                debug!(step = %payload.step_id, "step:complete for a non-current step; ignoring");
                return;
            }
            if let Some(timer) = active.timer.take() {
                timer.abort();
            }

            let step = match active
                .workflow
                .steps
                .iter()
                .find(|s| s.id == payload.step_id)
                .cloned()
            {
                Some(s) => s,
                None => return,
            };

            let output = payload.output.clone().unwrap_or_default();
            let failure = if payload.status != "completed" {
                Some(
                    payload
                        .error
                        .clone()
                        .unwrap_or_else(|| "step failed".to_string()),
                )
            } else {
                check_success(&step, &output).err()
            };

            match failure {
                None => {
                    if let Some(rec) = active.run.step_mut(&payload.step_id) {
                        rec.state = StepState::Completed;
                        rec.output = payload.output.clone();
                        rec.error = None;
                    }
                    active.run.current_step_id = None;
                    let run = &mut active.run;
                    self.persist(run).await;
                }
                Some(reason) => {
                    self.handle_step_failure(&mut state, &step, reason).await;
                }
            }
        }
        self.pump().await;
    }

    async fn on_user_input(&self, event: Event) {
        let claim = match self.deps.claims.take_for(&event) {
            Some(c) => c,
            None => return,
        };
        let payload: payload::UserInput = match event.content_as() {
            Ok(p) => p,
            Err(_) => return,
        };

        {
            let mut state = self.state.lock().await;
            let active = match state.active.as_mut() {
                Some(a) if a.run.id == claim.run_id => a,
                _ => return,
            };
            let step = match active
                .workflow
                .steps
                .iter()
                .find(|s| s.id == claim.step_id)
                .cloned()
            {
                Some(s) => s,
                None => return,
            };

            match active.run.state {
                RunState::WaitingApproval => {
                    if is_approval(&payload.text) {
                        if let Some(rec) = active.run.step_mut(&claim.step_id) {
                            rec.approved = true;
                        }
                        active.run.state = RunState::Running;
                        active.run.current_step_id = None;
                        let run = &mut active.run;
                        self.persist(run).await;
                    } else {
                        self.finalize(
                            &mut state,
                            RunState::Failed,
                            Some(format!("approval denied for step '{}'", claim.step_id)),
                        )
                        .await;
                    }
                }
                RunState::WaitingInput => {
                    if let Some(rec) = active.run.step_mut(&claim.step_id) {
                        rec.state = StepState::Completed;
                        rec.output = Some(payload.text.clone());
                    }
                    if let Some(key) = &step.response_key {
                        if let Value::Object(map) = &mut active.run.args {
                            map.insert(key.clone(), Value::String(payload.text.clone()));
                        }
                    }
                    active.run.current_step_id = None;
                    active.run.state = RunState::Running;
                    let run = &mut active.run;
                    self.persist(run).await;
                }
                _ => {
                    debug!(run = claim.run_id, "claimed input for a run that is not waiting");
                }
            }
        }
        self.pump().await;
    }

    async fn on_schedule_trigger(&self, event: Event) {
        let payload: payload::ScheduleTrigger = match event.content_as() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed schedule:trigger payload");
                return;
            }
        };
        let _ = self.deps.bus.publish(
            Event::new(
                EventType::WorkflowRunStart,
                serde_json::to_value(payload::RunStart {
                    workflow_id: payload.workflow_id,
                    args: payload.args,
                })
                .unwrap_or_default(),
            )
            .with_channel(Channel::System)
            .with_session(&event.session_id),
        );
    }

    async fn on_lint(&self, event: Event) {
        self.lint_report(event, "workflow:lint").await;
    }

    async fn on_dry_run(&self, event: Event) {
        self.lint_report(event, "workflow:dry-run").await;
    }

    async fn lint_report(&self, event: Event, phase: &str) {
        let payload: payload::LintRequest = match event.content_as() {
            Ok(p) => p,
            Err(_) => return,
        };
        let report = match self.registry.get(&payload.workflow_id) {
            None => payload::LintReport {
                workflow_id: payload.workflow_id.clone(),
                ok: false,
                errors: vec![format!("unknown workflow: {}", payload.workflow_id)],
                plan: vec![],
            },
            Some(w) => match validate(w).and_then(|_| plan(w)) {
                Ok(entries) => payload::LintReport {
                    workflow_id: payload.workflow_id.clone(),
                    ok: true,
                    errors: vec![],
                    plan: entries
                        .into_iter()
                        .map(|(step_id, done_when_count)| payload::PlanEntry {
                            step_id,
                            done_when_count,
                        })
                        .collect(),
                },
                Err(e) => payload::LintReport {
                    workflow_id: payload.workflow_id.clone(),
                    ok: false,
                    errors: vec![e.to_string()],
                    plan: vec![],
                },
            },
        };
        self.publish_status(
            &event.session_id,
            phase,
            serde_json::to_string(&report).unwrap_or_default(),
        );
    }

    async fn on_step_timeout(&self, run_id: u64, step_id: String, attempt: u32) {
        {
            let mut state = self.state.lock().await;
            let active = match state.active.as_mut() {
                Some(a) if a.run.id == run_id => a,
                _ => return,
            };
            let still_current = active.run.current_step_id.as_deref() == Some(step_id.as_str());
            let same_attempt = active
                .run
                .step(&step_id)
                .map(|r| r.attempts == attempt && r.state == StepState::Active)
                .unwrap_or(false);
            if !still_current || !same_attempt {
                return;
            }
            let step = match active.workflow.steps.iter().find(|s| s.id == step_id) {
                Some(s) => s.clone(),
                None => return,
            };
            warn!(run = run_id, step = %step_id, "step timed out");
            self.handle_step_failure(&mut state, &step, format!("step '{step_id}' timed out"))
                .await;
        }
        self.pump().await;
    }

    // ── Scheduling core ───────────────────────────────────────────────────────

    /// Activate queued runs and drive the active one until it parks or
    /// finishes.
    async fn pump(&self) {
        let mut state = self.state.lock().await;
        loop {
            if state.active.is_none() {
                let run = match state.queued.pop_front() {
                    Some(r) => r,
                    None => return,
                };
                let workflow = match self.registry.get(&run.workflow_id) {
                    Some(w) => w.clone(),
                    None => {
                        let mut run = run;
                        run.state = RunState::Failed;
                        self.persist(&mut run).await;
                        self.publish_run_complete(
                            &run,
                            Some(format!("unknown workflow: {}", run.workflow_id)),
                        );
                        continue;
                    }
                };
                let mut run = run;
                run.state = RunState::Running;
                self.persist(&mut run).await;
                state.active = Some(ActiveRun {
                    run,
                    workflow,
                    timer: None,
                });
            }

            match self.schedule_pass(&mut state).await {
                Pass::Parked => return,
                Pass::RunFinished => continue,
            }
        }
    }

    /// Drive the active run: skip false-condition steps, apply system steps
    /// inline, dispatch at most one agent/input step, or finish the run.
    async fn schedule_pass(&self, state: &mut EngineState) -> Pass {
        'scan: loop {
            let active = state
                .active
                .as_mut()
                .expect("schedule_pass without active run");
            let outputs: HashMap<String, String> = active
                .run
                .steps
                .iter()
                .filter(|s| s.state == StepState::Completed)
                .map(|s| (s.id.clone(), s.output.clone().unwrap_or_default()))
                .collect();

            let mut candidate: Option<Step> = None;
            for step in &active.workflow.steps {
                let rec = match active.run.step(&step.id) {
                    Some(r) => r,
                    None => continue,
                };
                if rec.state != StepState::Pending {
                    continue;
                }
                let deps_ready = step.depends_on.iter().all(|d| {
                    active
                        .run
                        .step(d)
                        .map(|r| matches!(r.state, StepState::Completed | StepState::Skipped))
                        .unwrap_or(false)
                });
                if !deps_ready {
                    continue;
                }
                if let Some(cond_src) = &step.condition {
                    // Validated at load time; a parse failure here means the
                    // definition changed under us — treat as false.
                    let holds = Condition::parse(cond_src)
                        .map(|c| c.eval(&outputs, &active.run.args))
                        .unwrap_or(false);
                    if !holds {
                        if let Some(rec) = active.run.step_mut(&step.id) {
                            rec.state = StepState::Skipped;
                        }
                        self.persist(&mut active.run).await;
                        continue 'scan;
                    }
                }
                candidate = Some(step.clone());
                break;
            }

            let step = match candidate {
                Some(s) => s,
                None => {
                    let all_settled = active
                        .run
                        .steps
                        .iter()
                        .all(|s| matches!(s.state, StepState::Completed | StepState::Skipped));
                    let (next_state, error) = if all_settled {
                        (RunState::Completed, None)
                    } else {
                        (
                            RunState::Failed,
                            Some("unschedulable steps remain".to_string()),
                        )
                    };
                    self.finalize(state, next_state, error).await;
                    return Pass::RunFinished;
                }
            };

            // Approval gate parks the run before the step itself dispatches.
            let approved = active
                .run
                .step(&step.id)
                .map(|r| r.approved)
                .unwrap_or(false);
            if step.approval && !approved {
                active.run.state = RunState::WaitingApproval;
                active.run.current_step_id = Some(step.id.clone());
                self.register_claim(&active.run, &step.id);
                self.publish_needs_approval(&active.run, &step, "approval");
                self.persist(&mut active.run).await;
                return Pass::Parked;
            }

            match step.step_type {
                StepType::Agent => {
                    self.dispatch_agent_step(active, &step).await;
                    return Pass::Parked;
                }
                StepType::WaitForInput => {
                    if let Some(rec) = active.run.step_mut(&step.id) {
                        rec.state = StepState::Active;
                        rec.attempts += 1;
                    }
                    active.run.state = RunState::WaitingInput;
                    active.run.current_step_id = Some(step.id.clone());
                    self.register_claim(&active.run, &step.id);
                    self.publish_needs_approval(&active.run, &step, "input");
                    self.persist(&mut active.run).await;
                    return Pass::Parked;
                }
                StepType::SystemWriteFile | StepType::SystemDeleteFile => {
                    match self.apply_system_step(&active.run, &step).await {
                        Ok(summary) => {
                            if let Some(rec) = active.run.step_mut(&step.id) {
                                rec.state = StepState::Completed;
                                rec.attempts += 1;
                                rec.output = Some(summary.clone());
                            }
                            self.persist(&mut active.run).await;
                            let _ = self.deps.bus.publish(
                                Event::new(
                                    EventType::WorkflowStepComplete,
                                    serde_json::to_value(payload::StepComplete {
                                        run_id: active.run.id,
                                        step_id: step.id.clone(),
                                        status: "completed".into(),
                                        output: Some(summary),
                                        error: None,
                                    })
                                    .unwrap_or_default(),
                                )
                                .with_session(&active.run.session_id),
                            );
                            continue 'scan;
                        }
                        Err(e) => {
                            if let Some(rec) = active.run.step_mut(&step.id) {
                                rec.attempts += 1;
                            }
                            let attempts =
                                active.run.step(&step.id).map(|r| r.attempts).unwrap_or(0);
                            if attempts <= step.retries {
                                warn!(step = %step.id, error = %e, "system step failed; retrying");
                                continue 'scan;
                            }
                            self.fail_step_and_run(state, &step.id, e.to_string()).await;
                            return Pass::RunFinished;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch_agent_step(&self, active: &mut ActiveRun, step: &Step) {
        if let Some(rec) = active.run.step_mut(&step.id) {
            rec.state = StepState::Active;
            rec.attempts += 1;
        }
        active.run.state = RunState::Running;
        active.run.current_step_id = Some(step.id.clone());

        let prior_steps: Vec<payload::PriorStep> = active
            .run
            .steps
            .iter()
            .filter(|s| s.state == StepState::Completed)
            .map(|s| payload::PriorStep {
                step_id: s.id.clone(),
                output: s.output.clone().unwrap_or_default(),
            })
            .collect();

        let instruction = substitute_args(
            step.instruction.as_deref().unwrap_or_default(),
            &active.run.args,
        );

        let _ = self.deps.bus.publish(
            Event::new(
                EventType::WorkflowStepStart,
                serde_json::to_value(payload::StepStart {
                    run_id: active.run.id,
                    step_id: step.id.clone(),
                    instruction,
                    tools: step.tools.clone(),
                    load_skills: step.load_skills.clone(),
                    prior_steps,
                    args: active.run.args.clone(),
                    response_key: step.response_key.clone(),
                    timeout_secs: step.timeout,
                })
                .unwrap_or_default(),
            )
            .with_session(&active.run.session_id),
        );

        // Per-step timeout: expiry counts as a retriable failure.
        if let Some(secs) = step.timeout {
            if let Some(inner) = self.self_arc() {
                let attempt = active.run.step(&step.id).map(|r| r.attempts).unwrap_or(0);
                let run_id = active.run.id;
                let step_id = step.id.clone();
                active.timer = Some(spawn_step_timeout(inner, run_id, step_id, attempt, secs));
            }
        }

        self.persist(&mut active.run).await;
    }

    async fn apply_system_step(&self, run: &Run, step: &Step) -> anyhow::Result<String> {
        let path = substitute_args(step.path.as_deref().unwrap_or_default(), &run.args);
        match step.step_type {
            StepType::SystemWriteFile => {
                let content =
                    substitute_args(step.content.as_deref().unwrap_or_default(), &run.args);
                self.deps.workspace.write_text_file(&path, &content).await?;
                Ok(format!("wrote {} bytes to {path}", content.len()))
            }
            StepType::SystemDeleteFile => {
                self.deps.workspace.remove_path(&path).await?;
                Ok(format!("deleted {path}"))
            }
            _ => anyhow::bail!("not a system step"),
        }
    }

    /// Shared failure path: retry when the budget allows, otherwise fail the
    /// step and the run.
    async fn handle_step_failure(&self, state: &mut EngineState, step: &Step, reason: String) {
        let active = match state.active.as_mut() {
            Some(a) => a,
            None => return,
        };
        let attempts = active.run.step(&step.id).map(|r| r.attempts).unwrap_or(0);
        if attempts <= step.retries {
            debug!(step = %step.id, attempts, "step failed; re-dispatching");
            if let Some(rec) = active.run.step_mut(&step.id) {
                rec.state = StepState::Pending;
                rec.error = Some(reason);
            }
            active.run.current_step_id = None;
            self.persist(&mut active.run).await;
        } else {
            self.fail_step_and_run(state, &step.id, reason).await;
        }
    }

    async fn fail_step_and_run(&self, state: &mut EngineState, step_id: &str, reason: String) {
        if let Some(active) = state.active.as_mut() {
            if let Some(rec) = active.run.step_mut(step_id) {
                rec.state = StepState::Failed;
                rec.error = Some(reason.clone());
            }
        }
        self.finalize(state, RunState::Failed, Some(reason)).await;
    }

    /// Move the active run to a terminal state, persist, announce, clear.
    async fn finalize(&self, state: &mut EngineState, run_state: RunState, error: Option<String>) {
        let mut active = match state.active.take() {
            Some(a) => a,
            None => return,
        };
        if let Some(timer) = active.timer.take() {
            timer.abort();
        }
        active.run.state = run_state;
        active.run.current_step_id = None;
        self.deps.claims.withdraw(active.run.id);
        self.persist(&mut active.run).await;
        self.publish_run_complete(&active.run, error);
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn register_claim(&self, run: &Run, step_id: &str) {
        self.deps.claims.register(otto_bus::Claim {
            run_id: run.id,
            step_id: step_id.to_string(),
            session_filter: (run.session_id != "main").then(|| run.session_id.clone()),
        });
    }

    fn publish_needs_approval(&self, run: &Run, step: &Step, kind: &str) {
        let prompt = step
            .prompt
            .clone()
            .or_else(|| step.instruction.clone())
            .unwrap_or_else(|| format!("Step '{}' needs input.", step.id));
        let _ = self.deps.bus.publish(
            Event::new(
                EventType::WorkflowNeedsApproval,
                serde_json::to_value(payload::NeedsApproval {
                    run_id: run.id,
                    step_id: step.id.clone(),
                    prompt: substitute_args(&prompt, &run.args),
                    kind: kind.to_string(),
                })
                .unwrap_or_default(),
            )
            .with_session(&run.session_id),
        );
    }

    fn publish_run_complete(&self, run: &Run, error: Option<String>) {
        let _ = self.deps.bus.publish(
            Event::new(
                EventType::WorkflowRunComplete,
                serde_json::to_value(payload::RunComplete {
                    run_id: run.id,
                    workflow_id: run.workflow_id.clone(),
                    state: run.state.as_str().to_string(),
                    error,
                })
                .unwrap_or_default(),
            )
            .with_session(&run.session_id),
        );
    }

    fn publish_status(&self, session_id: &str, phase: &str, detail: String) {
        let _ = self.deps.bus.publish(
            Event::new(
                EventType::AgentStatus,
                json!({"phase": phase, "detail": detail}),
            )
            .with_session(session_id),
        );
    }

    async fn persist(&self, run: &mut Run) {
        run.updated_at = chrono::Utc::now();
        if let Err(e) = self.deps.store.save(run).await {
            warn!(run = run.id, error = %e, "run persistence failed");
        }
    }

    fn self_arc(&self) -> Option<Arc<Inner>> {
        self.weak_self.get().and_then(Weak::upgrade)
    }
}

/// Spawned separately (not inlined) so the task's future type isn't folded
/// into `dispatch_agent_step`'s own future — that would create a cyclic
/// opaque type through `on_step_timeout` -> `pump` -> `schedule_pass` ->
/// `dispatch_agent_step` and the compiler cannot prove `Send` for it.
fn spawn_step_timeout(
    inner: Arc<Inner>,
    run_id: u64,
    step_id: String,
    attempt: u32,
    secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
        inner.on_step_timeout(run_id, step_id, attempt).await;
    })
}

fn is_approval(text: &str) -> bool {
    let t = text.trim().to_lowercase();
    t == "y" || t.starts_with("yes") || t.starts_with("approve") || t.starts_with("ok")
}

/// Evaluate a step's success checks against its output.
fn check_success(step: &Step, output: &str) -> Result<(), String> {
    for check in &step.success_checks {
        match check.check_type.as_str() {
            "non_empty" => {
                if output.trim().is_empty() {
                    return Err(format!(
                        "success check failed: step '{}' output is empty",
                        step.id
                    ));
                }
            }
            "contains" => {
                let needle = check
                    .value
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if !output.contains(needle) {
                    return Err(format!(
                        "success check failed: step '{}' output does not contain '{needle}'",
                        step.id
                    ));
                }
            }
            other => {
                // Unknown check types were accepted by the schema; advisory.
                debug!(check = other, "unknown success check type ignored");
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
