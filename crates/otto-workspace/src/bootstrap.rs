// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::WorkspaceManager;

/// First-run workspace initialization state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapState {
    Pending,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Serialize, Deserialize)]
struct BootstrapMarker {
    state: BootstrapState,
    updated_at: DateTime<Utc>,
}

const MARKER_FILE: &str = ".bootstrap.json";

// Seed templates for the prompt-context files.  Deliberately short — the
// operator is expected to grow these; otto only guarantees they exist.
const IDENTITY_SEED: &str = "You are otto, a local coding agent.\n";
const SOUL_SEED: &str = "Be direct. Prefer small verifiable changes.\n";
const USER_SEED: &str = "# Operator notes\n";
const BOOT_SEED: &str = "# Boot context\n";
const MEMORY_SYSTEM_SEED: &str = "# Long-term notes\n";
const MEMORY_DAILY_SEED: &str = "# Daily notes\n";
const BOOTSTRAP_SEED: &str = "# First-run checklist\n";

/// Files seeded on first run, relative to the workspace root.
const SEED_FILES: &[(&str, &str)] = &[
    ("identity.md", IDENTITY_SEED),
    ("soul.md", SOUL_SEED),
    ("user.md", USER_SEED),
    ("boot.md", BOOT_SEED),
    ("memory/system.md", MEMORY_SYSTEM_SEED),
    ("memory/daily.md", MEMORY_DAILY_SEED),
    ("bootstrap.md", BOOTSTRAP_SEED),
];

/// Ensure the workspace is bootstrapped: `pending → active → completed`
/// on first run, short-circuit to `completed` on every run after.  Seeding
/// failures land in `failed` and are reported; the caller decides whether
/// a degraded workspace is acceptable.
pub async fn ensure_workspace(ws: &WorkspaceManager) -> BootstrapState {
    // Prior completed bootstrap wins, even if the operator since deleted
    // individual seed files on purpose.
    if let Ok(text) = ws.read_text_file(MARKER_FILE).await {
        if let Ok(marker) = serde_json::from_str::<BootstrapMarker>(&text) {
            if marker.state == BootstrapState::Completed {
                return BootstrapState::Completed;
            }
        }
    }

    debug!(root = %ws.root().display(), "bootstrapping workspace");
    let state = match seed(ws).await {
        Ok(()) => BootstrapState::Completed,
        Err(e) => {
            warn!(error = %e, "workspace bootstrap failed");
            BootstrapState::Failed
        }
    };

    let marker = BootstrapMarker {
        state,
        updated_at: Utc::now(),
    };
    if let Ok(json) = serde_json::to_string_pretty(&marker) {
        if let Err(e) = ws.write_text_file(MARKER_FILE, &json).await {
            warn!(error = %e, "could not persist bootstrap marker");
        }
    }
    state
}

async fn seed(ws: &WorkspaceManager) -> anyhow::Result<()> {
    for (path, content) in SEED_FILES {
        ws.ensure_text_file(path, content).await?;
    }
    // Empty skills directory so skill lookups have a stable location.
    ws.ensure_text_file("skills/.keep", "").await?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_run_seeds_files_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(dir.path());
        let state = ensure_workspace(&ws).await;
        assert_eq!(state, BootstrapState::Completed);
        for (path, _) in SEED_FILES {
            assert!(ws.exists(path).await.unwrap(), "missing seed {path}");
        }
        assert!(ws.exists(MARKER_FILE).await.unwrap());
    }

    #[tokio::test]
    async fn second_run_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(dir.path());
        ensure_workspace(&ws).await;

        // Operator customizes a seed file; re-running must not clobber it.
        ws.write_text_file("identity.md", "custom identity")
            .await
            .unwrap();
        let state = ensure_workspace(&ws).await;
        assert_eq!(state, BootstrapState::Completed);
        assert_eq!(
            ws.read_text_file("identity.md").await.unwrap(),
            "custom identity"
        );
    }

    #[tokio::test]
    async fn deleted_seed_is_not_recreated_after_completion() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(dir.path());
        ensure_workspace(&ws).await;
        ws.remove_path("soul.md").await.unwrap();
        ensure_workspace(&ws).await;
        assert!(!ws.exists("soul.md").await.unwrap());
    }

    #[test]
    fn state_serializes_snake_case() {
        let v = serde_json::to_value(BootstrapState::Completed).unwrap();
        assert_eq!(v, "completed");
    }
}
