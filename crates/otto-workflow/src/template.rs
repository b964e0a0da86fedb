// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*args\.([A-Za-z0-9_-]+)\s*\}\}").unwrap())
}

/// Substitute `{{args.key}}` placeholders against the accumulated run args.
/// Unknown keys resolve to the empty string.
pub fn substitute_args(text: &str, args: &Value) -> String {
    placeholder_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            match args.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            }
        })
        .into_owned()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_string_args() {
        let out = substitute_args("deploy to {{args.env}}", &json!({"env": "staging"}));
        assert_eq!(out, "deploy to staging");
    }

    #[test]
    fn tolerates_inner_whitespace() {
        let out = substitute_args("v{{ args.version }}", &json!({"version": "1.2"}));
        assert_eq!(out, "v1.2");
    }

    #[test]
    fn unknown_keys_become_empty() {
        assert_eq!(substitute_args("x{{args.ghost}}y", &json!({})), "xy");
    }

    #[test]
    fn non_string_values_stringify() {
        assert_eq!(substitute_args("n={{args.n}}", &json!({"n": 7})), "n=7");
    }

    #[test]
    fn unrelated_braces_untouched() {
        let text = "code {fn x()} and {{not.args}}";
        assert_eq!(substitute_args(text, &json!({})), text);
    }
}
