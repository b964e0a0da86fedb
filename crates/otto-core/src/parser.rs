// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-call recovery from completion text.
//!
//! Local models without native tool-call support are asked to answer with a
//! bare JSON object; in practice they wrap it in prose, markdown fences,
//! trailing commas, or alternative key spellings.  The parser climbs a
//! recovery ladder before giving up: direct parse → trailing-comma repair →
//! balanced-region and fenced-block scan → key-alias interpretation.

use otto_model::{Completion, FinishReason};
use serde_json::Value;

/// Outcome of parsing one completion's text.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    /// Plain final answer.
    Final { text: String },
    /// A recovered tool invocation.
    ToolCall { name: String, arguments: Value },
    /// JSON was present but not interpretable as an answer or a tool call.
    ParseError { error: String },
}

/// Parse a completion that carried no native tool calls.
pub fn parse_completion(completion: &Completion) -> ParseResult {
    let text = completion.text.trim();

    // Fast path: prose that never tries to be JSON is a final answer —
    // unless the model claimed tool_calls, in which case JSON must be
    // hiding somewhere and we dig for it.
    if !text.starts_with('{') && completion.finish_reason != FinishReason::ToolCalls {
        return ParseResult::Final {
            text: text.to_string(),
        };
    }

    // 1. Direct parse.
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return interpret(&value, text);
    }

    // 2. Trailing-comma artifacts.
    let stripped = strip_trailing_commas(text);
    if let Ok(value) = serde_json::from_str::<Value>(&stripped) {
        return interpret(&value, text);
    }

    // 3. Balanced {…} regions and fenced ```json blocks.
    let mut candidates = fenced_json_blocks(text);
    candidates.extend(balanced_object_regions(text));
    for candidate in &candidates {
        let parsed = serde_json::from_str::<Value>(candidate)
            .or_else(|_| serde_json::from_str::<Value>(&strip_trailing_commas(candidate)));
        if let Ok(value) = parsed {
            if let Some(result) = try_tool_call(&value) {
                return result;
            }
        }
    }

    ParseResult::ParseError {
        error: "response contains JSON but no interpretable tool call".to_string(),
    }
}

/// Interpret a fully-parsed top-level JSON value.
fn interpret(value: &Value, original_text: &str) -> ParseResult {
    if let Some(result) = try_tool_call(value) {
        return result;
    }
    // A parsed object with no tool shape is JSON-but-not-interpretable.
    if value.is_object() {
        return ParseResult::ParseError {
            error: "JSON object has no recognizable tool-call fields".to_string(),
        };
    }
    ParseResult::Final {
        text: original_text.to_string(),
    }
}

/// Accept `{tool_calls: [..]}`, `{tool_call: {..}}`, or a bare call object.
fn try_tool_call(value: &Value) -> Option<ParseResult> {
    let candidates = [
        value.get("tool_calls").and_then(|v| v.get(0)),
        value.get("tool_call"),
        Some(value),
    ];
    for candidate in candidates.into_iter().flatten() {
        let name = ["name", "tool", "toolName"]
            .iter()
            .find_map(|k| candidate.get(*k))
            .and_then(|v| v.as_str())
            // Some models nest the call one level down as {function: {...}}.
            .or_else(|| {
                candidate
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
            });
        let name = match name {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => continue,
        };

        let raw_args = ["arguments", "args", "input"]
            .iter()
            .find_map(|k| candidate.get(*k))
            .or_else(|| candidate.get("function").and_then(|f| f.get("arguments")));
        let arguments = match raw_args {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            // String-encoded argument objects are parsed best-effort.
            Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(v) if v.is_object() => v,
                _ => continue,
            },
            None => Value::Object(serde_json::Map::new()),
            _ => continue,
        };
        return Some(ParseResult::ToolCall { name, arguments });
    }
    None
}

/// Remove `,` immediately before `}` or `]` (string-aware).
fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = s.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next_meaningful = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if matches!(next_meaningful, Some('}') | Some(']')) {
                    continue;
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Contents of every ```json fenced block.
fn fenced_json_blocks(s: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = s;
    while let Some(open) = rest.find("```json") {
        let body = &rest[open + "```json".len()..];
        match body.find("```") {
            Some(close) => {
                blocks.push(body[..close].trim().to_string());
                rest = &body[close + 3..];
            }
            None => break,
        }
    }
    blocks
}

/// Every balanced top-level `{…}` region, string-aware.
fn balanced_object_regions(s: &str) -> Vec<String> {
    let mut regions = Vec::new();
    let bytes: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != '{' {
            i += 1;
            continue;
        }
        let start = i;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;
        for (j, &c) in bytes.iter().enumerate().skip(start) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(j);
                        break;
                    }
                }
                _ => {}
            }
        }
        match end {
            Some(j) => {
                regions.push(bytes[start..=j].iter().collect());
                i = j + 1;
            }
            None => break,
        }
    }
    regions
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use otto_model::Completion;
    use serde_json::json;

    fn completion(text: &str) -> Completion {
        Completion::text(text)
    }

    fn expect_tool(result: ParseResult) -> (String, Value) {
        match result {
            ParseResult::ToolCall { name, arguments } => (name, arguments),
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    // ── Final answers ─────────────────────────────────────────────────────────

    #[test]
    fn prose_is_final_without_recovery() {
        let r = parse_completion(&completion("The answer is 42. {not even json"));
        assert_eq!(
            r,
            ParseResult::Final {
                text: "The answer is 42. {not even json".into()
            }
        );
    }

    #[test]
    fn non_object_json_is_final() {
        // Doesn't start with '{' → plain answer.
        let r = parse_completion(&completion("[1, 2, 3]"));
        assert!(matches!(r, ParseResult::Final { .. }));
    }

    // ── Direct tool-call shapes ───────────────────────────────────────────────

    #[test]
    fn bare_call_object() {
        let (name, args) = expect_tool(parse_completion(&completion(
            r#"{"name": "bash", "arguments": {"command": "pwd"}}"#,
        )));
        assert_eq!(name, "bash");
        assert_eq!(args["command"], "pwd");
    }

    #[test]
    fn tool_call_wrapper() {
        let (name, _) = expect_tool(parse_completion(&completion(
            r#"{"tool_call": {"tool": "read", "args": {"path": "a.txt"}}}"#,
        )));
        assert_eq!(name, "read");
    }

    #[test]
    fn tool_calls_array_takes_first() {
        let (name, _) = expect_tool(parse_completion(&completion(
            r#"{"tool_calls": [{"toolName": "write", "input": {"path": "x", "content": "y"}}]}"#,
        )));
        assert_eq!(name, "write");
    }

    #[test]
    fn nested_function_shape() {
        let (name, args) = expect_tool(parse_completion(&completion(
            r#"{"function": {"name": "bash", "arguments": "{\"command\": \"ls\"}"}}"#,
        )));
        assert_eq!(name, "bash");
        assert_eq!(args["command"], "ls");
    }

    #[test]
    fn string_arguments_are_json_parsed() {
        let (_, args) = expect_tool(parse_completion(&completion(
            r#"{"name": "bash", "arguments": "{\"command\": \"pwd\"}"}"#,
        )));
        assert_eq!(args, json!({"command": "pwd"}));
    }

    #[test]
    fn missing_arguments_default_to_empty_object() {
        let (_, args) = expect_tool(parse_completion(&completion(r#"{"name": "bash"}"#)));
        assert_eq!(args, json!({}));
    }

    // ── Repair ladder ─────────────────────────────────────────────────────────

    #[test]
    fn trailing_comma_is_repaired() {
        let (name, _) = expect_tool(parse_completion(&completion(
            "{\"name\": \"bash\", \"arguments\": {\"command\": \"pwd\",},}",
        )));
        assert_eq!(name, "bash");
    }

    #[test]
    fn fenced_json_block_is_recovered() {
        let text = "I will run the command now.\n```json\n{\"name\": \"bash\", \
                    \"arguments\": {\"command\": \"pwd\"}}\n```\nDone.";
        let mut c = completion(text);
        c.finish_reason = FinishReason::ToolCalls;
        let (name, _) = expect_tool(parse_completion(&c));
        assert_eq!(name, "bash");
    }

    #[test]
    fn embedded_object_region_is_recovered() {
        let text = r#"{"thoughts": "irrelevant"} {"name": "read", "arguments": {"path": "f"}}"#;
        let (name, _) = expect_tool(parse_completion(&completion(text)));
        assert_eq!(name, "read");
    }

    #[test]
    fn braces_inside_strings_do_not_break_region_scan() {
        let text = r#"{"name": "write", "arguments": {"path": "a", "content": "fn f() { }"}}"#;
        let (name, args) = expect_tool(parse_completion(&completion(text)));
        assert_eq!(name, "write");
        assert_eq!(args["content"], "fn f() { }");
    }

    // ── Parse errors ──────────────────────────────────────────────────────────

    #[test]
    fn object_without_tool_fields_is_parse_error() {
        let r = parse_completion(&completion(r#"{"weather": "sunny"}"#));
        assert!(matches!(r, ParseResult::ParseError { .. }));
    }

    #[test]
    fn broken_json_with_tool_claim_is_parse_error() {
        let mut c = completion("{tool:bad");
        c.finish_reason = FinishReason::ToolCalls;
        assert!(matches!(
            parse_completion(&c),
            ParseResult::ParseError { .. }
        ));
    }

    #[test]
    fn broken_json_starting_with_brace_is_parse_error() {
        assert!(matches!(
            parse_completion(&completion("{\"name\": ")),
            ParseResult::ParseError { .. }
        ));
    }
}
