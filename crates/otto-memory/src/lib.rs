// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod summary;
mod transcript;

pub use summary::{ConversationSummarizer, ModelSummarizer, SummaryRecord, SUMMARY_VERSION};
pub use transcript::{sanitize_session_id, Conversation, SessionMemory, SessionTurn, TurnType};
