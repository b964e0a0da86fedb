// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::summary::{self, ConversationSummarizer};

/// One saved turn in a session transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTurn {
    pub timestamp: DateTime<Utc>,
    pub role: String,
    #[serde(rename = "type")]
    pub turn_type: TurnType,
    pub content: String,
    #[serde(default)]
    pub meta: Value,
}

impl SessionTurn {
    pub fn new(role: impl Into<String>, turn_type: TurnType, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role: role.into(),
            turn_type,
            content: content.into(),
            meta: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnType {
    UserInput,
    AgentResponse,
    ToolCall,
    ToolResult,
}

impl TurnType {
    fn is_tool(&self) -> bool {
        matches!(self, Self::ToolCall | Self::ToolResult)
    }
}

/// Conversation slice handed to the context builder.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    /// Newest turns within the token limit, original order, tool turns
    /// excluded.
    pub turns: Vec<SessionTurn>,
    /// Rolling summary of everything older.
    pub summary: Option<String>,
}

/// Append-only per-session JSONL storage.
///
/// One file per sanitized session id; every write is a single appended line
/// so abrupt termination can lose at most the line being written.
pub struct SessionMemory {
    sessions_dir: PathBuf,
    summary_max_chars: usize,
    summarizer: Option<Arc<dyn ConversationSummarizer>>,
}

impl SessionMemory {
    pub fn new(sessions_dir: impl Into<PathBuf>, summary_max_chars: usize) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            summary_max_chars,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, s: Arc<dyn ConversationSummarizer>) -> Self {
        self.summarizer = Some(s);
        self
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    fn transcript_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.jsonl", sanitize_session_id(session_id)))
    }

    /// Append one turn.  Callers treat failures as best-effort (log and
    /// continue) — persistence must never fail a turn.
    pub async fn append_turn(&self, session_id: &str, turn: &SessionTurn) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.sessions_dir).await?;
        let line = serde_json::to_string(turn)?;
        let mut f = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.transcript_path(session_id))
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.write_all(b"\n").await?;
        f.flush().await?;
        Ok(())
    }

    /// All well-formed turns, sorted by timestamp.  Malformed lines are
    /// skipped with a warning.
    pub async fn read_turns(&self, session_id: &str) -> anyhow::Result<Vec<SessionTurn>> {
        let path = self.transcript_path(session_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut turns = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionTurn>(line) {
                Ok(t) => turns.push(t),
                Err(e) => warn!(
                    session = session_id,
                    line = i + 1,
                    error = %e,
                    "skipping malformed transcript line"
                ),
            }
        }
        turns.sort_by_key(|t| t.timestamp);
        Ok(turns)
    }

    /// Select the newest turns whose cumulative estimated cost fits within
    /// `token_limit`; everything older is summarized into the rolling
    /// summary.  Tool turns never appear in the returned list.
    pub async fn collect_conversation(
        &self,
        session_id: &str,
        token_limit: usize,
        estimate: impl Fn(&str) -> usize,
    ) -> anyhow::Result<Conversation> {
        let turns = self.read_turns(session_id).await?;

        // Walk newest → oldest until the budget is spent.
        let mut budget = token_limit;
        let mut split = turns.len();
        for (i, turn) in turns.iter().enumerate().rev() {
            let cost = estimate(&turn.content);
            if cost > budget {
                break;
            }
            budget -= cost;
            split = i;
        }

        let (dropped, kept) = turns.split_at(split);

        let summary = if dropped.is_empty() {
            summary::read(&self.sessions_dir, session_id)
                .await
                .map(|r| r.summary)
        } else {
            let updated = summary::update(
                &self.sessions_dir,
                session_id,
                dropped,
                self.summarizer.as_deref(),
                self.summary_max_chars,
            )
            .await;
            match updated {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(session = session_id, error = %e, "summary update failed");
                    summary::read(&self.sessions_dir, session_id)
                        .await
                        .map(|r| r.summary)
                }
            }
        };

        Ok(Conversation {
            turns: kept
                .iter()
                .filter(|t| !t.turn_type.is_tool())
                .cloned()
                .collect(),
            summary: summary.filter(|s| !s.is_empty()),
        })
    }
}

/// Restrict a session id to a safe filename alphabet.
pub fn sanitize_session_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(dir: &tempfile::TempDir) -> SessionMemory {
        SessionMemory::new(dir.path(), 300)
    }

    fn est(text: &str) -> usize {
        (text.len() / 4).max(1)
    }

    // ── Append / read ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(&dir);
        mem.append_turn("s1", &SessionTurn::new("user", TurnType::UserInput, "hi"))
            .await
            .unwrap();
        mem.append_turn(
            "s1",
            &SessionTurn::new("assistant", TurnType::AgentResponse, "hello"),
        )
        .await
        .unwrap();
        let turns = mem.read_turns("s1").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "hi");
        assert_eq!(turns[1].content, "hello");
    }

    #[tokio::test]
    async fn read_missing_session_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(memory(&dir).read_turns("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(&dir);
        mem.append_turn("s1", &SessionTurn::new("user", TurnType::UserInput, "ok"))
            .await
            .unwrap();
        // Corrupt the file with a half-written line.
        let path = dir.path().join("s1.jsonl");
        let mut existing = std::fs::read_to_string(&path).unwrap();
        existing.push_str("{\"timestamp\": broken\n");
        std::fs::write(&path, existing).unwrap();

        let turns = mem.read_turns("s1").await.unwrap();
        assert_eq!(turns.len(), 1);
    }

    #[tokio::test]
    async fn transcript_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(&dir);
        mem.append_turn("s1", &SessionTurn::new("user", TurnType::UserInput, "one"))
            .await
            .unwrap();
        let first = mem.read_turns("s1").await.unwrap();
        mem.append_turn("s1", &SessionTurn::new("user", TurnType::UserInput, "two"))
            .await
            .unwrap();
        let second = mem.read_turns("s1").await.unwrap();
        assert!(second.len() > first.len());
        assert_eq!(second[0].content, first[0].content);
    }

    // ── Conversation collection ───────────────────────────────────────────────

    #[tokio::test]
    async fn collect_excludes_tool_turns() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(&dir);
        for (role, ty, text) in [
            ("user", TurnType::UserInput, "question"),
            ("assistant", TurnType::ToolCall, "{\"name\":\"bash\"}"),
            ("tool", TurnType::ToolResult, "output"),
            ("assistant", TurnType::AgentResponse, "answer"),
        ] {
            mem.append_turn("s1", &SessionTurn::new(role, ty, text))
                .await
                .unwrap();
        }
        let conv = mem.collect_conversation("s1", 10_000, est).await.unwrap();
        assert_eq!(conv.turns.len(), 2);
        assert!(conv
            .turns
            .iter()
            .all(|t| !matches!(t.turn_type, TurnType::ToolCall | TurnType::ToolResult)));
    }

    #[tokio::test]
    async fn collect_respects_token_limit_keeping_newest() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(&dir);
        for i in 0..10 {
            mem.append_turn(
                "s1",
                &SessionTurn::new(
                    "user",
                    TurnType::UserInput,
                    format!("message number {i} padded to cost something"),
                ),
            )
            .await
            .unwrap();
        }
        // Each message is ~10 tokens; a 25-token budget keeps only the tail.
        let conv = mem.collect_conversation("s1", 25, est).await.unwrap();
        assert!(conv.turns.len() < 10);
        assert!(conv
            .turns
            .last()
            .unwrap()
            .content
            .contains("message number 9"));
    }

    #[tokio::test]
    async fn dropped_turns_produce_fallback_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mem = memory(&dir);
        for i in 0..8 {
            mem.append_turn(
                "s1",
                &SessionTurn::new(
                    "user",
                    TurnType::UserInput,
                    format!("long early message {i} with plenty of padding text"),
                ),
            )
            .await
            .unwrap();
        }
        let conv = mem.collect_conversation("s1", 20, est).await.unwrap();
        assert!(conv.summary.is_some(), "dropped turns must be summarized");
        // Summary file persisted for the next collection.
        assert!(dir.path().join("s1.summary.json").exists());
    }

    // ── Sanitization ──────────────────────────────────────────────────────────

    #[test]
    fn sanitize_replaces_path_characters() {
        assert_eq!(sanitize_session_id("../../etc"), "______etc");
        assert_eq!(sanitize_session_id("client-3"), "client-3");
        assert_eq!(sanitize_session_id(""), "default");
    }
}
