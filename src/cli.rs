// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "otto", about = "A local-first coding agent runtime", version)]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase stderr log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the agent daemon (default when no subcommand is given).
    Run,
    /// Send one input line to a running agent and print its response.
    Send {
        /// The operator text to send.
        text: String,
        /// Socket path override.
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Validate a workflow.yaml file without loading the runtime.
    Validate {
        /// Path to a workflow.yaml.
        file: PathBuf,
    },
    /// Validate a loaded workflow and print its execution plan.
    Lint {
        /// Workflow id under the workflows directory.
        workflow_id: String,
    },
    /// Like lint, but framed as "what would run".
    DryRun {
        /// Workflow id under the workflows directory.
        workflow_id: String,
    },
    /// Print the effective merged configuration.
    ShowConfig,
}
