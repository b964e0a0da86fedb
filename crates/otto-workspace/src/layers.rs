// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crate::WorkspaceManager;

/// Text of the on-disk prompt-context layers.
///
/// Missing files read as empty strings — a half-seeded workspace degrades
/// to a thinner prompt rather than a failed turn.
#[derive(Debug, Clone, Default)]
pub struct PromptLayers {
    pub identity: String,
    pub soul: String,
    pub user: String,
    pub boot: String,
    /// `memory/system.md` and `memory/daily.md`, joined.
    pub memory: String,
    pub bootstrap: String,
}

impl PromptLayers {
    pub async fn load(ws: &WorkspaceManager) -> Self {
        let read = |p: &'static str| async move { ws.read_text_file(p).await.unwrap_or_default() };

        let system_memory = read("memory/system.md").await;
        let daily_memory = read("memory/daily.md").await;
        let memory = match (system_memory.trim(), daily_memory.trim()) {
            ("", "") => String::new(),
            (s, "") => s.to_string(),
            ("", d) => d.to_string(),
            (s, d) => format!("{s}\n\n{d}"),
        };

        Self {
            identity: read("identity.md").await,
            soul: read("soul.md").await,
            user: read("user.md").await,
            boot: read("boot.md").await,
            memory,
            bootstrap: read("bootstrap.md").await,
        }
    }

    /// Load one skill file per name from `skills/<name>.md`, concatenated.
    /// Unknown skills are skipped.
    pub async fn load_skills(ws: &WorkspaceManager, names: &[String]) -> String {
        let mut parts = Vec::new();
        for name in names {
            let rel = format!("skills/{name}.md");
            match ws.read_text_file(&rel).await {
                Ok(text) => parts.push(text),
                Err(_) => tracing::debug!(skill = %name, "skill file not found"),
            }
        }
        parts.join("\n\n")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_files_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(dir.path());
        let layers = PromptLayers::load(&ws).await;
        assert!(layers.identity.is_empty());
        assert!(layers.memory.is_empty());
    }

    #[tokio::test]
    async fn memory_joins_system_and_daily() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(dir.path());
        ws.write_text_file("memory/system.md", "facts").await.unwrap();
        ws.write_text_file("memory/daily.md", "today").await.unwrap();
        let layers = PromptLayers::load(&ws).await;
        assert!(layers.memory.contains("facts"));
        assert!(layers.memory.contains("today"));
    }

    #[tokio::test]
    async fn skills_concatenate_known_names_only() {
        let dir = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(dir.path());
        ws.write_text_file("skills/review.md", "review skill")
            .await
            .unwrap();
        let text = PromptLayers::load_skills(
            &ws,
            &["review".to_string(), "missing".to_string()],
        )
        .await;
        assert_eq!(text, "review skill");
    }
}
