// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Startup and shutdown orchestration.
//!
//! Subsystems are wired bottom-up in a fixed order and torn down in reverse.
//! Ordering that matters:
//!   - the provider preflight runs before anything stateful is created, so
//!     a dead endpoint fails fast with a non-zero exit;
//!   - the workflow engine subscribes to the bus BEFORE the turn loop, so
//!     parked `wait_for_input` claims see `user:input` events first;
//!   - shutdown stops accepting IPC, drains the bus under a deadline, and
//!     only then cancels in-flight turns.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use otto_bus::{EventBus, InputClaims};
use otto_config::{Config, IpcTransport, Paths};
use otto_context::{ContextBuilder, TokenEstimator};
use otto_core::{TurnLoop, TurnLoopDeps};
use otto_ipc::IpcServer;
use otto_memory::{ModelSummarizer, SessionMemory};
use otto_tools::{ToolPolicy, ToolRegistry};
use otto_workflow::{EngineDeps, RunStore, WorkflowEngine, WorkflowRegistry};
use otto_workspace::{ensure_workspace, BootstrapState, WorkspaceManager};

use crate::scheduler::Scheduler;

/// Run the daemon until SIGINT/SIGTERM, then shut down cleanly.
pub async fn run(config: Config, paths: Paths) -> anyhow::Result<()> {
    // ── Startup ──────────────────────────────────────────────────────────────
    let bus = EventBus::new();

    let provider = otto_model::from_config(&config.model)?;
    match provider.preflight().await {
        Ok(models) => {
            info!(provider = provider.name(), models = models.len(), "provider preflight ok")
        }
        Err(e) if config.model.preflight_required => {
            return Err(e).context("provider preflight failed");
        }
        Err(e) => warn!(error = %e, "provider unreachable; turns will fail until it returns"),
    }

    for dir in [&paths.agent_dir, &paths.sessions_dir, &paths.workflows_dir, &paths.runs_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let memory = Arc::new(
        SessionMemory::new(&paths.sessions_dir, config.memory.summary_max_chars)
            .with_summarizer(Arc::new(ModelSummarizer::new(Arc::clone(&provider)))),
    );

    let workspace = Arc::new(WorkspaceManager::new(&paths.workspace_root));
    tokio::fs::create_dir_all(workspace.root()).await?;
    match ensure_workspace(&workspace).await {
        BootstrapState::Failed => warn!("workspace bootstrap failed; prompt layers degraded"),
        state => info!(?state, "workspace ready"),
    }

    let mut registry = WorkflowRegistry::new();
    let loaded = registry.load_all(&paths.workflows_dir).await?;
    info!(workflows = loaded, "workflow registry loaded");
    let registry = Arc::new(registry);

    let claims = Arc::new(InputClaims::new());

    let engine = WorkflowEngine::new(
        EngineDeps {
            bus: bus.clone(),
            store: RunStore::new(&paths.runs_dir),
            workspace: Arc::clone(&workspace),
            claims: Arc::clone(&claims),
        },
        Arc::clone(&registry),
    );
    engine.start();
    let restored = engine.restore().await?;
    if restored > 0 {
        info!(runs = restored, "requeued interrupted runs");
    }

    let mut tools = ToolRegistry::new(ToolPolicy::from_config(&config.tools));
    otto_tools::register_builtins(&mut tools, &config.tools);
    let tools = Arc::new(tools);

    let estimator =
        TokenEstimator::from_config(&config.context).with_provider(Arc::clone(&provider));
    let builder = Arc::new(ContextBuilder::new(config.context.clone(), estimator));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let turn_loop = TurnLoop::new(TurnLoopDeps {
        bus: bus.clone(),
        provider,
        tools,
        workspace,
        memory,
        builder,
        claims,
        agent: config.agent.clone(),
        shutdown: shutdown_rx,
    });
    turn_loop.start();

    let ipc = match config.ipc.transport {
        IpcTransport::Unix => {
            let server = IpcServer::start_unix(bus.clone(), paths.socket_path.clone()).await?;
            info!(socket = %paths.socket_path.display(), "ipc listening");
            server
        }
        IpcTransport::Tcp => {
            let (server, addr) = IpcServer::start_tcp(bus.clone(), &config.ipc.tcp_addr).await?;
            info!(addr = %addr, "ipc listening");
            server
        }
    };

    let mut scheduler = Scheduler::restore(paths.schedules_file.clone(), bus.clone()).await;
    scheduler.start();
    info!(schedules = scheduler.schedule_count(), "scheduler started");

    // ── Wait for a shutdown signal (at most one shutdown) ────────────────────
    wait_for_signal().await;
    info!("shutdown signal received");

    // ── Shutdown, reverse order ──────────────────────────────────────────────
    ipc.stop_accepting();
    let drained = bus
        .drain(Duration::from_millis(config.agent.shutdown_timeout_ms))
        .await;
    if !drained {
        warn!(
            pending = bus.queue_depth(),
            "bus queue did not drain within the shutdown budget"
        );
    }
    if let Err(e) = scheduler.persist().await {
        warn!(error = %e, "could not persist schedules");
    }
    ipc.shutdown().await;
    scheduler.stop();
    engine.stop().await;
    let _ = shutdown_tx.send(true);
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
