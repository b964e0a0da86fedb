// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Snapshot {
    path: PathBuf,
    existed: bool,
    content: Option<String>,
}

/// Per-turn journal of pre-mutation file states.
///
/// Tools call [`capture_file`](Self::capture_file) before the first mutation
/// of each path; on turn failure [`restore`](Self::restore) replays the
/// snapshots in reverse capture order — files that did not exist are deleted,
/// everything else gets its original bytes back.
#[derive(Default)]
pub struct WriteRollback {
    snapshots: Mutex<Vec<Snapshot>>,
    seen: Mutex<HashSet<PathBuf>>,
}

impl WriteRollback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot `path` unless it was already captured this turn.
    pub async fn capture_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref().to_path_buf();
        if !self.seen.lock().unwrap().insert(path.clone()) {
            return Ok(());
        }
        let snapshot = match tokio::fs::read_to_string(&path).await {
            Ok(content) => Snapshot {
                path,
                existed: true,
                content: Some(content),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot {
                path,
                existed: false,
                content: None,
            },
            Err(e) => return Err(e.into()),
        };
        debug!(path = %snapshot.path.display(), existed = snapshot.existed, "rollback capture");
        self.snapshots.lock().unwrap().push(snapshot);
        Ok(())
    }

    pub fn captured_count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    /// Paths captured so far, in capture order.
    pub fn captured_paths(&self) -> Vec<PathBuf> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.path.clone())
            .collect()
    }

    /// Pre-mutation content of a captured path, when it existed.
    pub fn original_content(&self, path: impl AsRef<Path>) -> Option<String> {
        let path = path.as_ref();
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.path == path)
            .and_then(|s| s.content.clone())
    }

    /// True when a captured path existed before the turn.
    pub fn existed_before(&self, path: impl AsRef<Path>) -> Option<bool> {
        let path = path.as_ref();
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.path == path)
            .map(|s| s.existed)
    }

    /// Restore every captured file in reverse capture order.  Returns the
    /// number of paths restored; accumulates rather than aborts on partial
    /// failure so one unwritable file cannot block the rest.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let snapshots: Vec<Snapshot> = {
            let mut guard = self.snapshots.lock().unwrap();
            guard.drain(..).rev().collect()
        };
        self.seen.lock().unwrap().clear();

        let mut restored = 0;
        let mut first_error: Option<anyhow::Error> = None;
        for snap in snapshots {
            let result = if snap.existed {
                tokio::fs::write(&snap.path, snap.content.as_deref().unwrap_or_default())
                    .await
                    .map_err(anyhow::Error::from)
            } else {
                match tokio::fs::remove_file(&snap.path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            };
            match result {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(path = %snap.path.display(), error = %e, "rollback restore failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            None => Ok(restored),
            Some(e) => Err(e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
