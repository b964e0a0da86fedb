// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Minimal JSON-Schema argument checker.
//!
//! Covers the subset the builtin tool schemas actually use: `required`,
//! per-property `type`, and `additionalProperties: false`.  Errors are
//! plain strings fed back to the model through the correction prompt, so
//! they are written to be read by the model, not by serde.

use serde_json::Value;

/// Validate `args` against a tool's parameter schema.  Empty result = valid.
pub fn validate_args(schema: &Value, args: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let obj = match args.as_object() {
        Some(o) => o,
        None => {
            errors.push("arguments must be a JSON object".to_string());
            return errors;
        }
    };

    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(key) {
                errors.push(format!("missing required parameter '{key}'"));
            }
        }
    }

    if let Some(props) = properties {
        for (key, value) in obj {
            match props.get(key) {
                None => {
                    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                        errors.push(format!("unknown parameter '{key}'"));
                    }
                }
                Some(prop_schema) => {
                    if let Some(expected) = prop_schema.get("type").and_then(Value::as_str) {
                        if !type_matches(expected, value) {
                            errors.push(format!(
                                "parameter '{key}' must be of type {expected}"
                            ));
                        }
                    }
                }
            }
        }
    }

    errors
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
