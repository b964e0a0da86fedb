// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod lifecycle;
mod scheduler;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::filter::EnvFilter;

use cli::{Cli, Commands};
use otto_config::Paths;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = otto_config::load(cli.config.as_deref())?;
    let paths = Paths::resolve(&config.paths, config.ipc.socket_path.as_deref());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => lifecycle::run(config, paths).await,
        Commands::Send { text, socket } => {
            let socket = socket.unwrap_or_else(|| paths.socket_path.clone());
            send_input(&socket, &text).await
        }
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Lint { workflow_id } => lint_workflow(&paths, &workflow_id, "lint").await,
        Commands::DryRun { workflow_id } => lint_workflow(&paths, &workflow_id, "dry-run").await,
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Validate one workflow.yaml and print its plan.  Exit code 2 on invalid.
fn validate_workflow(file: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let workflow: otto_workflow::Workflow =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
    match otto_workflow::plan(&workflow) {
        Ok(plan) => {
            println!("workflow '{}' is valid; {} step(s):", workflow.id, plan.len());
            for (step_id, done_when_count) in plan {
                println!("  {step_id} (unblocks {done_when_count})");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    }
}

/// Load the workflows directory and lint one workflow by id.
async fn lint_workflow(paths: &Paths, workflow_id: &str, label: &str) -> anyhow::Result<()> {
    let mut registry = otto_workflow::WorkflowRegistry::new();
    registry.load_all(&paths.workflows_dir).await?;
    let workflow = match registry.get(workflow_id) {
        Some(w) => w,
        None => {
            eprintln!(
                "unknown workflow '{workflow_id}' (looked in {})",
                paths.workflows_dir.display()
            );
            std::process::exit(2);
        }
    };
    match otto_workflow::plan(workflow) {
        Ok(plan) => {
            println!("[{label}] workflow '{workflow_id}': {} step(s)", plan.len());
            for (step_id, done_when_count) in plan {
                println!("  {step_id} (unblocks {done_when_count})");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    }
}

/// Connect to a running daemon, send one `user:input`, print the response.
async fn send_input(socket: &PathBuf, text: &str) -> anyhow::Result<()> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let stream = tokio::net::UnixStream::connect(socket)
        .await
        .with_context(|| format!("connecting to {}", socket.display()))?;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let line = serde_json::json!({
        "type": "user:input",
        "content": {"text": text, "request_id": request_id},
    })
    .to_string();
    write.write_all(line.as_bytes()).await?;
    write.write_all(b"\n").await?;
    write.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };
        match value["type"].as_str() {
            Some("agent:response")
                if value["content"]["request_id"].as_str() == Some(request_id.as_str()) =>
            {
                println!("{}", value["content"]["text"].as_str().unwrap_or_default());
                if value["content"]["finish_reason"].as_str() == Some("internal_error") {
                    std::process::exit(1);
                }
                return Ok(());
            }
            Some("agent:status") => {
                if let Some(phase) = value["content"]["phase"].as_str() {
                    eprintln!("[otto] {phase}");
                }
            }
            _ => {}
        }
    }
    anyhow::bail!("connection closed before a response arrived")
}
