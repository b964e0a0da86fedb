// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::condition::Condition;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),
    #[error("invalid workflow yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A workflow definition as loaded from `workflow.yaml`.
///
/// Unknown fields anywhere in the document are rejected at deserialization
/// time — a typoed key must fail loudly, not silently change semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<WorkflowInput>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowInput {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Agent,
    WaitForInput,
    SystemWriteFile,
    SystemDeleteFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuccessCheck {
    #[serde(rename = "type")]
    pub check_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub id: String,
    #[serde(default, rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub load_skills: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub success_checks: Vec<SuccessCheck>,
    /// Seconds the step may stay active; expiry is a retriable failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_key: Option<String>,
}

fn slug_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9-]+$").unwrap())
}

/// Structural validation beyond what serde enforces.
pub fn validate(workflow: &Workflow) -> Result<(), WorkflowError> {
    let mut errors = Vec::new();

    if !slug_re().is_match(&workflow.id) {
        errors.push(format!("id '{}' is not a slug ([a-z0-9-]+)", workflow.id));
    }
    if workflow.steps.is_empty() {
        errors.push("workflow has no steps".to_string());
    }

    let mut seen = HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
    }

    let ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &workflow.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                errors.push(format!("step '{}' depends on unknown step '{dep}'", step.id));
            }
            if dep == &step.id {
                errors.push(format!("step '{}' depends on itself", step.id));
            }
        }

        match step.step_type {
            StepType::Agent => {
                if step.instruction.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    errors.push(format!("agent step '{}' has no instruction", step.id));
                }
                if step.tools.is_empty() {
                    errors.push(format!("agent step '{}' has no tools", step.id));
                }
            }
            StepType::WaitForInput => {
                let has_text = step.instruction.is_some() || step.prompt.is_some();
                if !has_text {
                    errors.push(format!(
                        "wait_for_input step '{}' needs an instruction or prompt",
                        step.id
                    ));
                }
            }
            StepType::SystemWriteFile => {
                if step.path.is_none() {
                    errors.push(format!("system_write_file step '{}' has no path", step.id));
                }
                if step.content.is_none() {
                    errors.push(format!("system_write_file step '{}' has no content", step.id));
                }
            }
            StepType::SystemDeleteFile => {
                if step.path.is_none() {
                    errors.push(format!("system_delete_file step '{}' has no path", step.id));
                }
            }
        }

        if let Some(cond) = &step.condition {
            if let Err(e) = Condition::parse(cond) {
                errors.push(format!("step '{}' has an invalid condition: {e}", step.id));
            }
        }
        for check in &step.success_checks {
            if check.check_type.trim().is_empty() {
                errors.push(format!("step '{}' has a success check without a type", step.id));
            }
        }
    }

    if errors.is_empty() {
        if let Err(cycle) = topological_order(workflow) {
            errors.push(cycle);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::Validation(errors))
    }
}

/// Kahn's algorithm, stable in declaration order.  Errors on cycles.
fn topological_order(workflow: &Workflow) -> Result<Vec<String>, String> {
    let mut indegree: HashMap<&str, usize> = workflow
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.len()))
        .collect();
    let mut order = Vec::with_capacity(workflow.steps.len());

    loop {
        let next = workflow
            .steps
            .iter()
            .find(|s| indegree.get(s.id.as_str()) == Some(&0));
        let step = match next {
            Some(s) => s,
            None => break,
        };
        order.push(step.id.clone());
        indegree.remove(step.id.as_str());
        for s in &workflow.steps {
            if s.depends_on.iter().any(|d| d == &step.id) {
                if let Some(d) = indegree.get_mut(s.id.as_str()) {
                    *d = d.saturating_sub(1);
                }
            }
        }
    }

    if order.len() != workflow.steps.len() {
        let stuck: Vec<&str> = indegree.keys().copied().collect();
        return Err(format!("dependency cycle involving: {}", stuck.join(", ")));
    }
    Ok(order)
}

/// Lint/dry-run plan: topologically ordered step ids, each with the number
/// of successor steps it unblocks.
pub fn plan(workflow: &Workflow) -> Result<Vec<(String, usize)>, WorkflowError> {
    validate(workflow)?;
    let order = topological_order(workflow).map_err(|e| WorkflowError::Validation(vec![e]))?;
    Ok(order
        .into_iter()
        .map(|id| {
            let successors = workflow
                .steps
                .iter()
                .filter(|s| s.depends_on.iter().any(|d| d == &id))
                .count();
            (id, successors)
        })
        .collect())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Workflow, WorkflowError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    const DEMO: &str = r#"
id: demo
version: "1.0.0"
name: Demo
steps:
  - id: prepare
    type: agent
    instruction: Prepare the workspace.
    tools: [bash]
  - id: build
    type: agent
    instruction: Build the project.
    tools: [bash]
    depends_on: [prepare]
"#;

    #[test]
    fn valid_workflow_parses_and_validates() {
        let w = parse(DEMO).unwrap();
        validate(&w).unwrap();
        assert_eq!(w.steps.len(), 2);
        assert_eq!(w.steps[1].depends_on, vec!["prepare"]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = r#"
id: demo
version: "1"
steps:
  - id: a
    type: agent
    instruction: x
    tools: [bash]
    supercharge: yes
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn default_step_type_is_agent() {
        let yaml = r#"
id: demo
version: "1"
steps:
  - id: a
    instruction: x
    tools: [bash]
"#;
        let w = parse(yaml).unwrap();
        assert_eq!(w.steps[0].step_type, StepType::Agent);
        validate(&w).unwrap();
    }

    #[test]
    fn duplicate_ids_rejected() {
        let yaml = r#"
id: demo
version: "1"
steps:
  - { id: a, instruction: x, tools: [bash] }
  - { id: a, instruction: y, tools: [bash] }
"#;
        let err = validate(&parse(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let yaml = r#"
id: demo
version: "1"
steps:
  - { id: a, instruction: x, tools: [bash], depends_on: [ghost] }
"#;
        let err = validate(&parse(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("unknown step 'ghost'"));
    }

    #[test]
    fn cycle_rejected() {
        let yaml = r#"
id: demo
version: "1"
steps:
  - { id: a, instruction: x, tools: [bash], depends_on: [b] }
  - { id: b, instruction: y, tools: [bash], depends_on: [a] }
"#;
        let err = validate(&parse(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn agent_step_requires_instruction_and_tools() {
        let yaml = r#"
id: demo
version: "1"
steps:
  - { id: a, type: agent }
"#;
        let err = validate(&parse(yaml).unwrap()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no instruction"));
        assert!(msg.contains("no tools"));
    }

    #[test]
    fn system_write_requires_path_and_content() {
        let yaml = r#"
id: demo
version: "1"
steps:
  - { id: w, type: system_write_file }
"#;
        let err = validate(&parse(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("no path"));
        assert!(err.to_string().contains("no content"));
    }

    #[test]
    fn non_slug_id_rejected() {
        let yaml = r#"
id: Demo Flow
version: "1"
steps:
  - { id: a, instruction: x, tools: [bash] }
"#;
        let err = validate(&parse(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("not a slug"));
    }

    #[test]
    fn invalid_condition_rejected() {
        let yaml = r#"
id: demo
version: "1"
steps:
  - { id: a, instruction: x, tools: [bash], condition: "fn delete_all()" }
"#;
        let err = validate(&parse(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("invalid condition"));
    }

    #[test]
    fn serialized_workflow_revalidates() {
        let w = parse(DEMO).unwrap();
        validate(&w).unwrap();
        let text = serde_yaml::to_string(&w).unwrap();
        let again: Workflow = serde_yaml::from_str(&text).unwrap();
        validate(&again).unwrap();
    }

    #[test]
    fn plan_orders_and_counts_successors() {
        let w = parse(DEMO).unwrap();
        let p = plan(&w).unwrap();
        assert_eq!(p[0].0, "prepare");
        assert_eq!(p[0].1, 1, "prepare unblocks build");
        assert_eq!(p[1].0, "build");
        assert_eq!(p[1].1, 0);
    }

    #[test]
    fn plan_is_stable_for_independent_steps() {
        let yaml = r#"
id: demo
version: "1"
steps:
  - { id: z-first, instruction: x, tools: [bash] }
  - { id: a-second, instruction: y, tools: [bash] }
"#;
        let p = plan(&parse(yaml).unwrap()).unwrap();
        assert_eq!(p[0].0, "z-first", "declaration order wins, not name order");
    }
}
