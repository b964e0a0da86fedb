// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::schema::Workflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    WaitingInput,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingInput => "waiting_input",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub state: StepState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One execution instance of a workflow, persisted as a whole on every
/// state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: u64,
    pub workflow_id: String,
    pub workflow_version: String,
    pub state: RunState,
    pub steps: Vec<StepRecord>,
    pub args: Value,
    /// Session that started the run; approval/input correlation scope.
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(id: u64, workflow: &Workflow, args: Value, session_id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version.clone(),
            state: RunState::Queued,
            steps: workflow
                .steps
                .iter()
                .map(|s| StepRecord {
                    id: s.id.clone(),
                    state: StepState::Pending,
                    attempts: 0,
                    approved: false,
                    output: None,
                    error: None,
                })
                .collect(),
            args,
            session_id,
            current_step_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

/// One JSON file per run under the runs directory, written atomically.
#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    fn path_for(&self, id: u64) -> PathBuf {
        self.runs_dir.join(format!("run-{id}.json"))
    }

    /// Next monotonic run id: one past the highest id on disk.
    pub async fn next_id(&self) -> anyhow::Result<u64> {
        let max = self
            .existing_ids()
            .await?
            .into_iter()
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    async fn existing_ids(&self) -> anyhow::Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.runs_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name
                .strip_prefix("run-")
                .and_then(|r| r.strip_suffix(".json"))
                .and_then(|r| r.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Persist the full run snapshot, write-then-rename.
    pub async fn save(&self, run: &Run) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.runs_dir).await?;
        let path = self.path_for(run.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(run)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, id: u64) -> anyhow::Result<Run> {
        let text = tokio::fs::read_to_string(self.path_for(id)).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// All runs on disk; unreadable files are skipped with a warning.
    pub async fn load_all(&self) -> anyhow::Result<Vec<Run>> {
        let mut runs = Vec::new();
        for id in self.existing_ids().await? {
            match self.load(id).await {
                Ok(run) => runs.push(run),
                Err(e) => warn!(run_id = id, error = %e, "skipping unreadable run file"),
            }
        }
        runs.sort_by_key(|r| r.id);
        Ok(runs)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
