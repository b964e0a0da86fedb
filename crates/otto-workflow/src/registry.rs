// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::schema::{validate, Workflow, WorkflowError};

/// Loads and serves workflow definitions.
///
/// Workflows are directories under the workflows root, each containing a
/// `workflow.yaml`.  Invalid definitions are skipped with a warning so one
/// broken workflow cannot take the runtime down.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Workflow>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `dir` and load every valid workflow.  Returns the number loaded.
    pub async fn load_all(&mut self, dir: &Path) -> anyhow::Result<usize> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let yaml_path = entry.path().join("workflow.yaml");
            match self.load_one(&yaml_path).await {
                Ok(w) => {
                    debug!(workflow = %w.id, path = %yaml_path.display(), "workflow loaded");
                    self.workflows.insert(w.id.clone(), w);
                    loaded += 1;
                }
                Err(WorkflowError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Directory without a workflow.yaml — not a workflow.
                }
                Err(e) => {
                    warn!(path = %yaml_path.display(), error = %e, "skipping invalid workflow");
                }
            }
        }
        Ok(loaded)
    }

    async fn load_one(&self, path: &Path) -> Result<Workflow, WorkflowError> {
        let text = tokio::fs::read_to_string(path).await?;
        let workflow: Workflow = serde_yaml::from_str(&text)?;
        validate(&workflow)?;
        Ok(workflow)
    }

    pub fn get(&self, id: &str) -> Option<&Workflow> {
        self.workflows.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Insert a pre-validated workflow (tests, programmatic registration).
    pub fn insert(&mut self, workflow: Workflow) -> Result<(), WorkflowError> {
        validate(&workflow)?;
        self.workflows.insert(workflow.id.clone(), workflow);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"
id: good
version: "1"
steps:
  - { id: a, instruction: do it, tools: [bash] }
"#;

    const BAD: &str = r#"
id: bad
version: "1"
steps:
  - { id: a, instruction: x, tools: [bash], depends_on: [ghost] }
"#;

    async fn write_workflow(dir: &Path, id: &str, yaml: &str) {
        let wdir = dir.join(id);
        tokio::fs::create_dir_all(&wdir).await.unwrap();
        tokio::fs::write(wdir.join("workflow.yaml"), yaml)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn loads_valid_workflows() {
        let dir = tempfile::tempdir().unwrap();
        write_workflow(dir.path(), "good", GOOD).await;
        let mut reg = WorkflowRegistry::new();
        assert_eq!(reg.load_all(dir.path()).await.unwrap(), 1);
        assert!(reg.get("good").is_some());
    }

    #[tokio::test]
    async fn invalid_workflow_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_workflow(dir.path(), "good", GOOD).await;
        write_workflow(dir.path(), "bad", BAD).await;
        let mut reg = WorkflowRegistry::new();
        assert_eq!(reg.load_all(dir.path()).await.unwrap(), 1);
        assert!(reg.get("bad").is_none());
    }

    #[tokio::test]
    async fn directories_without_yaml_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("not-a-workflow"))
            .await
            .unwrap();
        let mut reg = WorkflowRegistry::new();
        assert_eq!(reg.load_all(dir.path()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_root_dir_is_empty_not_error() {
        let mut reg = WorkflowRegistry::new();
        let n = reg
            .load_all(Path::new("/tmp/otto-definitely-missing-dir-xyz"))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn insert_validates() {
        let mut reg = WorkflowRegistry::new();
        let bad: Workflow = serde_yaml::from_str(BAD).unwrap();
        assert!(reg.insert(bad).is_err());
    }
}
