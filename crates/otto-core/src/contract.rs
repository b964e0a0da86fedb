// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Final-response verification.
//!
//! Before the terminal `agent:response` leaves the turn loop, the derived
//! task contract gates it through a set of verifiers.  The contract is
//! derived once per turn from the requesting event's text.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Mutate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verifier {
    /// The response must carry non-whitespace content.
    NonEmpty,
    /// Overwrites that gut an existing file need an explicit rewrite reason.
    DiffSanity,
    /// External-scope responses must contain machine-readable JSON.
    Schema,
}

/// The derived `{intent, scope, verifiers}` that gates final verification.
#[derive(Debug, Clone)]
pub struct TaskContract {
    pub intent: Intent,
    pub scope: Scope,
    pub verifiers: Vec<Verifier>,
}

/// One failed verifier.  `retryable` failures re-prompt the model; the rest
/// terminate the turn as a guardrail failure.
#[derive(Debug, Clone)]
pub struct VerificationFailure {
    pub verifier: Verifier,
    pub reason: String,
    pub retryable: bool,
}

/// Post-turn facts about one mutated path, fed to `diff_sanity`.
#[derive(Debug, Clone)]
pub struct WriteCheck {
    pub path: String,
    pub existed_before: bool,
    pub old_len: usize,
    pub new_len: usize,
}

fn mutate_verbs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(write|create|delete|remove|update|edit|fix|change|modify|refactor|rename|install|add|patch|overwrite|rewrite|generate)\b",
        )
        .unwrap()
    })
}

fn external_verbs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(send|post|publish|deploy|upload|email|submit|push)\b").unwrap()
    })
}

/// Derive the contract by scanning the event text for verbs.
pub fn derive_contract(event_text: &str) -> TaskContract {
    let intent = if mutate_verbs().is_match(event_text) {
        Intent::Mutate
    } else {
        Intent::Read
    };
    let scope = if external_verbs().is_match(event_text) {
        Scope::External
    } else {
        Scope::Local
    };

    let mut verifiers = vec![Verifier::NonEmpty];
    if intent == Intent::Mutate {
        verifiers.push(Verifier::DiffSanity);
    }
    if scope == Scope::External {
        verifiers.push(Verifier::Schema);
    }

    TaskContract {
        intent,
        scope,
        verifiers,
    }
}

/// Run every verifier of the contract; first failure wins.
pub fn verify(
    contract: &TaskContract,
    response_text: &str,
    writes: &[WriteCheck],
) -> Result<(), VerificationFailure> {
    for verifier in &contract.verifiers {
        match verifier {
            Verifier::NonEmpty => {
                if response_text.trim().is_empty() {
                    return Err(VerificationFailure {
                        verifier: Verifier::NonEmpty,
                        reason: "response is empty".into(),
                        retryable: true,
                    });
                }
            }
            Verifier::DiffSanity => {
                if let Some(check) = writes.iter().find(|w| is_unsafe_overwrite(w)) {
                    if !mentions_rewrite(response_text) {
                        return Err(VerificationFailure {
                            verifier: Verifier::DiffSanity,
                            reason: format!(
                                "{} shrank from {} to {} bytes without a stated rewrite reason",
                                check.path, check.old_len, check.new_len
                            ),
                            retryable: true,
                        });
                    }
                }
            }
            Verifier::Schema => {
                if extract_json(response_text).is_none() {
                    return Err(VerificationFailure {
                        verifier: Verifier::Schema,
                        reason: "external-scope response carries no valid JSON".into(),
                        retryable: true,
                    });
                }
            }
        }
    }
    Ok(())
}

/// An overwrite is unsafe when it guts a non-trivial existing file.
fn is_unsafe_overwrite(w: &WriteCheck) -> bool {
    w.existed_before && w.old_len >= 64 && w.new_len * 2 < w.old_len
}

fn mentions_rewrite(text: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(rewrite|rewrote|rewritten|replaced? the (entire|whole) file|from scratch)\b").unwrap())
        .is_match(text)
}

/// Valid JSON anywhere in the response: the whole text, or a fenced block.
fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    if let Some(open) = text.find("```json") {
        let body = &text[open + 7..];
        if let Some(close) = body.find("```") {
            return serde_json::from_str::<Value>(body[..close].trim()).ok();
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
