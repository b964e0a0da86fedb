// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("path escapes the workspace root: {path}")]
    PathEscape { path: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sole mediator for files under the sandbox root.
///
/// Every path handed to tools or workflow `system_*` steps goes through
/// [`resolve`](Self::resolve); nothing outside the root is reachable.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative (or root-prefixed absolute) path against the
    /// sandbox root.  The resolution is lexical — `..` components are
    /// folded without touching the filesystem, so not-yet-existing targets
    /// resolve too.  Anything that would land outside the root is rejected.
    pub fn resolve(&self, rel: impl AsRef<Path>) -> Result<PathBuf, WorkspaceError> {
        let rel = rel.as_ref();
        let escape = || WorkspaceError::PathEscape {
            path: rel.display().to_string(),
        };

        if rel.is_absolute() {
            // Absolute paths are accepted only when they already point into
            // the root (after folding any `..`).
            let folded = fold_components(rel).ok_or_else(escape)?;
            return if folded.starts_with(&self.root) {
                Ok(folded)
            } else {
                Err(escape())
            };
        }

        let mut out = self.root.clone();
        let mut depth: usize = 0;
        for comp in rel.components() {
            match comp {
                Component::Normal(c) => {
                    out.push(c);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(escape());
                    }
                    out.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }
        Ok(out)
    }

    pub async fn read_text_file(&self, rel: impl AsRef<Path>) -> Result<String, WorkspaceError> {
        let path = self.resolve(rel)?;
        Ok(tokio::fs::read_to_string(&path).await?)
    }

    pub async fn write_text_file(
        &self,
        rel: impl AsRef<Path>,
        content: &str,
    ) -> Result<(), WorkspaceError> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(path = %path.display(), bytes = content.len(), "workspace write");
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    /// Create the file with `content` only when it does not exist yet.
    /// Returns `true` when the file was created.
    pub async fn ensure_text_file(
        &self,
        rel: impl AsRef<Path>,
        content: &str,
    ) -> Result<bool, WorkspaceError> {
        let path = self.resolve(&rel)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        self.write_text_file(rel, content).await?;
        Ok(true)
    }

    /// Remove a file or directory tree.  Missing targets are a no-op.
    pub async fn remove_path(&self, rel: impl AsRef<Path>) -> Result<(), WorkspaceError> {
        let path = self.resolve(rel)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await?,
            Ok(_) => tokio::fs::remove_file(&path).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub async fn exists(&self, rel: impl AsRef<Path>) -> Result<bool, WorkspaceError> {
        let path = self.resolve(rel)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Names of the direct children of a directory, sorted.
    pub async fn list_contents(&self, rel: impl AsRef<Path>) -> Result<Vec<String>, WorkspaceError> {
        let path = self.resolve(rel)?;
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Delete top-level entries whose mtime is older than `threshold`.
    /// Returns the number of entries removed.
    pub async fn cleanup(&self, threshold: Duration) -> Result<usize, WorkspaceError> {
        let cutoff = std::time::SystemTime::now() - threshold;
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            let mtime = meta.modified()?;
            if mtime < cutoff {
                let path = entry.path();
                debug!(path = %path.display(), "cleanup: removing stale entry");
                if meta.is_dir() {
                    tokio::fs::remove_dir_all(&path).await?;
                } else {
                    tokio::fs::remove_file(&path).await?;
                }
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Lexically fold `.` and `..` components of an absolute path.
/// Returns `None` when `..` would climb above the filesystem root.
fn fold_components(p: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) => out.push(comp.as_os_str()),
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
        }
    }
    Some(out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
