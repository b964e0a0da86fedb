// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::transcript::{sanitize_session_id, SessionTurn};

pub const SUMMARY_VERSION: u32 = 2;

/// Persisted rolling summary, one file per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub summary: String,
}

/// Produces a replacement summary from the prior one plus the transcript of
/// turns being dropped from the context window.
#[async_trait]
pub trait ConversationSummarizer: Send + Sync {
    async fn summarize(
        &self,
        prior_summary: Option<&str>,
        dropped_transcript: &str,
    ) -> anyhow::Result<String>;
}

/// LLM-backed summarizer running a single tool-free completion.
pub struct ModelSummarizer {
    provider: Arc<dyn otto_model::ModelProvider>,
}

impl ModelSummarizer {
    pub fn new(provider: Arc<dyn otto_model::ModelProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ConversationSummarizer for ModelSummarizer {
    async fn summarize(
        &self,
        prior_summary: Option<&str>,
        dropped_transcript: &str,
    ) -> anyhow::Result<String> {
        let mut prompt = String::from(
            "Update the running conversation summary. Keep it under two \
             sentences; carry forward anything still relevant.\n",
        );
        if let Some(prior) = prior_summary {
            prompt.push_str(&format!("\nCurrent summary:\n{prior}\n"));
        }
        prompt.push_str(&format!("\nTurns being dropped:\n{dropped_transcript}\n"));

        let completion = self
            .provider
            .chat_completion(otto_model::ChatRequest {
                messages: vec![
                    otto_model::Message::system(
                        "You maintain terse rolling summaries of conversations.",
                    ),
                    otto_model::Message::user(prompt),
                ],
                max_output_tokens: 200,
                ..otto_model::ChatRequest::default()
            })
            .await?;
        Ok(completion.text.trim().to_string())
    }
}

fn summary_path(sessions_dir: &Path, session_id: &str) -> PathBuf {
    sessions_dir.join(format!("{}.summary.json", sanitize_session_id(session_id)))
}

/// Read the stored summary; v2 records only.
pub(crate) async fn read(sessions_dir: &Path, session_id: &str) -> Option<SummaryRecord> {
    let text = tokio::fs::read_to_string(summary_path(sessions_dir, session_id))
        .await
        .ok()?;
    let record: SummaryRecord = serde_json::from_str(&text).ok()?;
    (record.version == SUMMARY_VERSION).then_some(record)
}

/// Re-summarize after turns were dropped, persist, and return the new text.
pub(crate) async fn update(
    sessions_dir: &Path,
    session_id: &str,
    dropped: &[SessionTurn],
    summarizer: Option<&dyn ConversationSummarizer>,
    max_chars: usize,
) -> anyhow::Result<String> {
    let prior = read(sessions_dir, session_id).await.map(|r| r.summary);
    let transcript = render_transcript(dropped);

    let mut text = match summarizer {
        Some(s) => match s.summarize(prior.as_deref(), &transcript).await {
            Ok(t) if !t.trim().is_empty() => t,
            Ok(_) => fallback_summary(dropped),
            Err(e) => {
                warn!(error = %e, "conversation summarizer failed; using fallback");
                fallback_summary(dropped)
            }
        },
        None => fallback_summary(dropped),
    };
    truncate_chars(&mut text, max_chars);

    let record = SummaryRecord {
        version: SUMMARY_VERSION,
        updated_at: Utc::now(),
        summary: text.clone(),
    };

    // Write-then-rename so an interrupted rewrite never leaves a torn file.
    tokio::fs::create_dir_all(sessions_dir).await?;
    let path = summary_path(sessions_dir, session_id);
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(&record)?).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(text)
}

fn render_transcript(turns: &[SessionTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("{}: {}", t.role, t.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deterministic fallback: short snippets of the most recent dropped turns.
fn fallback_summary(dropped: &[SessionTurn]) -> String {
    const SNIPPET_CHARS: usize = 60;
    const SNIPPET_COUNT: usize = 4;
    dropped
        .iter()
        .rev()
        .take(SNIPPET_COUNT)
        .map(|t| {
            let mut s = t.content.clone();
            truncate_chars(&mut s, SNIPPET_CHARS);
            format!("{}: {}", t.role, s)
        })
        .rev()
        .collect::<Vec<_>>()
        .join(" | ")
}

fn truncate_chars(s: &mut String, max_chars: usize) {
    if s.chars().count() > max_chars {
        *s = s.chars().take(max_chars).collect();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::TurnType;

    fn turn(role: &str, content: &str) -> SessionTurn {
        SessionTurn::new(role, TurnType::UserInput, content)
    }

    struct FixedSummarizer(&'static str);

    #[async_trait]
    impl ConversationSummarizer for FixedSummarizer {
        async fn summarize(&self, _: Option<&str>, _: &str) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl ConversationSummarizer for FailingSummarizer {
        async fn summarize(&self, _: Option<&str>, _: &str) -> anyhow::Result<String> {
            anyhow::bail!("model offline")
        }
    }

    #[tokio::test]
    async fn update_persists_v2_record() {
        let dir = tempfile::tempdir().unwrap();
        let text = update(
            dir.path(),
            "s1",
            &[turn("user", "old message")],
            None,
            300,
        )
        .await
        .unwrap();
        assert!(!text.is_empty());
        let stored = read(dir.path(), "s1").await.unwrap();
        assert_eq!(stored.version, SUMMARY_VERSION);
        assert_eq!(stored.summary, text);
    }

    #[tokio::test]
    async fn summarizer_output_replaces_stored_summary() {
        let dir = tempfile::tempdir().unwrap();
        let s = FixedSummarizer("condensed history");
        let text = update(dir.path(), "s1", &[turn("user", "x")], Some(&s), 300)
            .await
            .unwrap();
        assert_eq!(text, "condensed history");
    }

    #[tokio::test]
    async fn failing_summarizer_falls_back_deterministically() {
        let dir = tempfile::tempdir().unwrap();
        let text = update(
            dir.path(),
            "s1",
            &[turn("user", "first"), turn("assistant", "second")],
            Some(&FailingSummarizer),
            300,
        )
        .await
        .unwrap();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }

    #[tokio::test]
    async fn summary_is_truncated_to_char_bound() {
        let dir = tempfile::tempdir().unwrap();
        let long = "x".repeat(2_000);
        let s = FixedSummarizer(Box::leak(long.into_boxed_str()));
        let text = update(dir.path(), "s1", &[turn("user", "a")], Some(&s), 100)
            .await
            .unwrap();
        assert_eq!(text.chars().count(), 100);
    }

    #[tokio::test]
    async fn read_rejects_other_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.summary.json");
        std::fs::write(
            &path,
            r#"{"version":1,"updated_at":"2025-01-01T00:00:00Z","summary":"old"}"#,
        )
        .unwrap();
        assert!(read(dir.path(), "s1").await.is_none());
    }

    #[test]
    fn fallback_keeps_newest_snippets_in_order() {
        let turns: Vec<SessionTurn> = (0..6)
            .map(|i| turn("user", &format!("message {i}")))
            .collect();
        let s = fallback_summary(&turns);
        assert!(s.contains("message 5"));
        assert!(!s.contains("message 0"));
        let pos2 = s.find("message 2").unwrap();
        let pos5 = s.find("message 5").unwrap();
        assert!(pos2 < pos5, "snippets keep chronological order");
    }
}
