// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::tool::{Tool, ToolCall, ToolContext, ToolError, ToolOutput};
use crate::{policy::ToolPolicy, validate::validate_args};

/// A tool schema as handed to the model provider.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools plus the policy layer.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    policy: ToolPolicy,
}

impl ToolRegistry {
    pub fn new(policy: ToolPolicy) -> Self {
        Self {
            tools: HashMap::new(),
            policy,
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for all registered tools, name-sorted for stable prompts.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Schemas for a named subset (a workflow step's `tools` list).
    /// Unknown names are skipped.
    pub fn schemas_for(&self, names: &[String]) -> Vec<ToolSchema> {
        self.schemas()
            .into_iter()
            .filter(|s| names.contains(&s.name))
            .collect()
    }

    /// Validate a call against its tool's schema and the policy layer.
    pub fn validate_call(&self, call: &ToolCall) -> Result<(), ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::InvalidArgument(format!("unknown tool: {}", call.name)))?;
        let errors = validate_args(&tool.parameters_schema(), &call.arguments);
        if !errors.is_empty() {
            return Err(ToolError::InvalidArgument(errors.join("; ")));
        }
        self.policy.check_call(call)
    }

    /// Validate and run one call.
    pub async fn execute(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        self.validate_call(call)?;
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::InvalidArgument(format!("unknown tool: {}", call.name)))?;
        tool.execute(call, ctx).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use otto_config::ToolsConfig;

    fn registry() -> ToolRegistry {
        ToolRegistry::new(ToolPolicy::from_config(&ToolsConfig::default()))
    }

    /// Minimal echo tool for registry tests.
    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
                "additionalProperties": false
            })
        }
        async fn execute(
            &self,
            call: &ToolCall,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::ok(
                &call.id,
                call.arguments["text"].as_str().unwrap_or_default(),
            ))
        }
    }

    fn ctx() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext {
            workspace: std::sync::Arc::new(otto_workspace::WorkspaceManager::new(dir.path())),
            rollback: std::sync::Arc::new(crate::WriteRollback::new()),
        };
        (dir, ctx)
    }

    #[test]
    fn register_and_get() {
        let mut reg = registry();
        reg.register(EchoTool { name: "echo" });
        assert!(reg.get("echo").is_some());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let mut reg = registry();
        reg.register(EchoTool { name: "zeta" });
        reg.register(EchoTool { name: "alpha" });
        let names: Vec<_> = reg.schemas().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn schemas_for_filters_to_requested_subset() {
        let mut reg = registry();
        reg.register(EchoTool { name: "a" });
        reg.register(EchoTool { name: "b" });
        let subset = reg.schemas_for(&["b".to_string(), "ghost".to_string()]);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].name, "b");
    }

    #[test]
    fn validate_unknown_tool_is_invalid_argument() {
        let reg = registry();
        let call = ToolCall {
            id: "1".into(),
            name: "missing".into(),
            arguments: json!({}),
        };
        assert!(matches!(
            reg.validate_call(&call),
            Err(ToolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn validate_rejects_schema_violation() {
        let mut reg = registry();
        reg.register(EchoTool { name: "echo" });
        let call = ToolCall {
            id: "1".into(),
            name: "echo".into(),
            arguments: json!({"wrong": 1}),
        };
        let err = reg.validate_call(&call).unwrap_err();
        assert!(err.to_string().contains("missing required parameter"));
    }

    #[tokio::test]
    async fn execute_runs_valid_call() {
        let mut reg = registry();
        reg.register(EchoTool { name: "echo" });
        let (_d, ctx) = ctx();
        let out = reg
            .execute(
                &ToolCall {
                    id: "1".into(),
                    name: "echo".into(),
                    arguments: json!({"text": "hello"}),
                },
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out.content, "hello");
    }

    #[tokio::test]
    async fn execute_refuses_invalid_call() {
        let mut reg = registry();
        reg.register(EchoTool { name: "echo" });
        let (_d, ctx) = ctx();
        let result = reg
            .execute(
                &ToolCall {
                    id: "1".into(),
                    name: "echo".into(),
                    arguments: json!({"text": 9}),
                },
                &ctx,
            )
            .await;
        assert!(matches!(result, Err(ToolError::InvalidArgument(_))));
    }
}
