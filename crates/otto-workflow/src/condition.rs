// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Minimal condition language for workflow steps.
//!
//! Only path-equality expressions are allowed:
//!
//! ```yaml
//! condition: steps.detect.output == "needs-build"
//! condition: args.mode != "dry"
//! ```
//!
//! Anything richer is a validation error — conditions are data, never code.

use std::collections::HashMap;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathExpr {
    /// `steps.<id>.output`
    StepOutput(String),
    /// `args.<key>`
    Arg(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    lhs: PathExpr,
    op: Op,
    rhs: String,
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, String> {
        let (lhs_raw, op, rhs_raw) = if let Some((l, r)) = input.split_once("==") {
            (l, Op::Eq, r)
        } else if let Some((l, r)) = input.split_once("!=") {
            (l, Op::Ne, r)
        } else {
            return Err("expected '<path> == \"literal\"' or '<path> != \"literal\"'".into());
        };

        let lhs = parse_path(lhs_raw.trim())?;
        let rhs = parse_literal(rhs_raw.trim())?;
        Ok(Self { lhs, op, rhs })
    }

    /// Evaluate against completed step outputs and the accumulated run args.
    /// Missing paths compare as the empty string.
    pub fn eval(&self, step_outputs: &HashMap<String, String>, args: &Value) -> bool {
        let actual = match &self.lhs {
            PathExpr::StepOutput(id) => step_outputs.get(id).cloned().unwrap_or_default(),
            PathExpr::Arg(key) => match args.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            },
        };
        match self.op {
            Op::Eq => actual == self.rhs,
            Op::Ne => actual != self.rhs,
        }
    }
}

fn parse_path(s: &str) -> Result<PathExpr, String> {
    if let Some(rest) = s.strip_prefix("steps.") {
        let (id, field) = rest
            .rsplit_once('.')
            .ok_or_else(|| format!("step path '{s}' must be steps.<id>.output"))?;
        if field != "output" {
            return Err(format!("unsupported step field '{field}' (only 'output')"));
        }
        if id.is_empty() {
            return Err("empty step id in condition path".into());
        }
        return Ok(PathExpr::StepOutput(id.to_string()));
    }
    if let Some(key) = s.strip_prefix("args.") {
        if key.is_empty() || key.contains('.') {
            return Err(format!("arg path '{s}' must be args.<key>"));
        }
        return Ok(PathExpr::Arg(key.to_string()));
    }
    Err(format!("unsupported path '{s}' (use steps.<id>.output or args.<key>)"))
}

fn parse_literal(s: &str) -> Result<String, String> {
    if let Some(inner) = s.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        return Ok(inner.to_string());
    }
    if s.is_empty() || s.contains(char::is_whitespace) {
        return Err(format!("literal '{s}' must be quoted"));
    }
    Ok(s.to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn step_output_equality() {
        let c = Condition::parse(r#"steps.detect.output == "needs-build""#).unwrap();
        assert!(c.eval(&outputs(&[("detect", "needs-build")]), &json!({})));
        assert!(!c.eval(&outputs(&[("detect", "clean")]), &json!({})));
    }

    #[test]
    fn arg_inequality() {
        let c = Condition::parse(r#"args.mode != "dry""#).unwrap();
        assert!(c.eval(&outputs(&[]), &json!({"mode": "wet"})));
        assert!(!c.eval(&outputs(&[]), &json!({"mode": "dry"})));
    }

    #[test]
    fn missing_path_compares_as_empty() {
        let c = Condition::parse(r#"steps.ghost.output == """#).unwrap();
        assert!(c.eval(&outputs(&[]), &json!({})));
    }

    #[test]
    fn bare_literal_without_spaces_is_accepted() {
        let c = Condition::parse("args.target == release").unwrap();
        assert!(c.eval(&outputs(&[]), &json!({"target": "release"})));
    }

    #[test]
    fn non_string_args_stringify() {
        let c = Condition::parse(r#"args.count == "3""#).unwrap();
        assert!(c.eval(&outputs(&[]), &json!({"count": 3})));
    }

    #[test]
    fn general_code_is_rejected() {
        assert!(Condition::parse("1 + 1 == 2").is_err());
        assert!(Condition::parse("steps.a.output.len() > 0").is_err());
        assert!(Condition::parse("system('rm -rf /')").is_err());
    }

    #[test]
    fn only_output_field_is_supported() {
        assert!(Condition::parse(r#"steps.a.error == "x""#).is_err());
    }

    #[test]
    fn unquoted_multiword_literal_rejected() {
        assert!(Condition::parse("args.mode == two words").is_err());
    }
}
