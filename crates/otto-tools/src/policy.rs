// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;

use otto_config::ToolsConfig;

use crate::tool::{ToolCall, ToolError};

/// Deny-list policy applied after schema validation.
///
/// The schema cannot express "this command is dangerous"; this layer can.
/// Patterns are simple shell globs matched against the bash command string;
/// a few built-in guards catch argument shapes that are never legitimate in
/// a sandboxed agent regardless of configuration.
#[derive(Debug)]
pub struct ToolPolicy {
    deny_patterns: Vec<Regex>,
}

impl ToolPolicy {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        Self {
            deny_patterns: cfg
                .deny_patterns
                .iter()
                .filter_map(|p| glob_to_regex(p))
                .collect(),
        }
    }

    /// Reject the call when it matches a denied pattern.
    pub fn check_call(&self, call: &ToolCall) -> Result<(), ToolError> {
        if call.name != "bash" {
            return Ok(());
        }
        let command = call
            .arguments
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if is_recursive_dump(command) {
            return Err(ToolError::InvalidArgument(format!(
                "command rejected by policy (recursive directory dump): {command}"
            )));
        }
        for re in &self.deny_patterns {
            if re.is_match(command) {
                return Err(ToolError::InvalidArgument(format!(
                    "command rejected by policy: {command}"
                )));
            }
        }
        Ok(())
    }
}

/// Recursive dumps of broad roots flood the context window and leak paths
/// outside the sandbox; they are rejected even when no pattern matches.
fn is_recursive_dump(command: &str) -> bool {
    let c = command.trim();
    c.starts_with("find /") && !c.starts_with("find /tmp")
        || c.starts_with("ls -R /")
        || c.starts_with("du -a /")
        || c.starts_with("tree /")
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn policy_with(deny: &[&str]) -> ToolPolicy {
        ToolPolicy::from_config(&ToolsConfig {
            deny_patterns: deny.iter().map(|s| s.to_string()).collect(),
            ..ToolsConfig::default()
        })
    }

    fn bash(cmd: &str) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "bash".into(),
            arguments: json!({"command": cmd}),
        }
    }

    #[test]
    fn configured_pattern_denies() {
        let p = policy_with(&["rm -rf /*"]);
        assert!(p.check_call(&bash("rm -rf /*")).is_err());
    }

    #[test]
    fn unrelated_command_passes() {
        let p = policy_with(&["rm -rf /*"]);
        assert!(p.check_call(&bash("git status")).is_ok());
    }

    #[test]
    fn recursive_dump_rejected_without_configuration() {
        let p = policy_with(&[]);
        assert!(p.check_call(&bash("find / -name '*.rs'")).is_err());
        assert!(p.check_call(&bash("ls -R /")).is_err());
    }

    #[test]
    fn scoped_find_is_allowed() {
        let p = policy_with(&[]);
        assert!(p.check_call(&bash("find /tmp -name x")).is_ok());
        assert!(p.check_call(&bash("find . -name '*.rs'")).is_ok());
    }

    #[test]
    fn non_bash_tools_are_not_policed() {
        let p = policy_with(&["*"]);
        let call = ToolCall {
            id: "1".into(),
            name: "read".into(),
            arguments: json!({"path": "x"}),
        };
        assert!(p.check_call(&call).is_ok());
    }

    #[test]
    fn question_mark_glob_matches_one_char() {
        let p = policy_with(&["rm ?"]);
        assert!(p.check_call(&bash("rm x")).is_err());
        assert!(p.check_call(&bash("rm xy")).is_ok());
    }
}
