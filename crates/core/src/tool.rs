//! Tool registry and dispatcher.
//!
//! Tools are the agent's external capabilities: named, schema-described
//! callables. The registry maps names to handlers, validates argument
//! payloads against each tool's declared JSON schema, and executes handlers
//! under a bounded timeout. Dispatch failures never abort a turn — they are
//! converted into `success = false` results the model can recover from.

use crate::error::ToolError;
use crate::message::SessionId;
use crate::provider::ToolDefinition;
use crate::scratch::ScratchStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// A request to execute a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the model's tool_call id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// The result of a tool execution, appended to history as a tool message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call this result answers
    pub tool_call_id: String,

    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content (or a human-readable failure description)
    pub output: String,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: true,
            output: output.into(),
        }
    }

    pub fn failure(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: false,
            output: output.into(),
        }
    }
}

/// Per-session state handed to every tool invocation.
///
/// Session state is passed explicitly by handle — there is no process-wide
/// current-session singleton.
#[derive(Clone)]
pub struct ToolContext {
    /// The session this call runs inside
    pub session_id: SessionId,

    /// The session's working-set cache
    pub scratch: Arc<dyn ScratchStore>,
}

impl ToolContext {
    pub fn new(session_id: SessionId, scratch: Arc<dyn ScratchStore>) -> Self {
        Self {
            session_id,
            scratch,
        }
    }
}

/// The core Tool trait.
///
/// Each tool implements this trait and is registered in the `ToolRegistry`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "scratch_store").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with validated arguments.
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> std::result::Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
///
/// The orchestration loop uses this to:
/// 1. Get tool definitions to send with each completion request
/// 2. Validate and execute tool calls when the model requests them
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
    execution_timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            execution_timeout: Duration::from_secs(60),
        }
    }

    /// Set the per-tool execution timeout.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Register a tool. Fails if a tool with the same name already exists.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> std::result::Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::Duplicate(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool definitions (for sending to the model).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Validate and execute a tool call.
    ///
    /// Never returns an error: unknown tools, schema violations, handler
    /// failures, and timeouts all become `success = false` results that are
    /// fed back to the model as tool messages.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "Tool call for unregistered tool");
            return ToolResult::failure(
                &call.id,
                format!("Unknown tool '{}'. Available tools: {}", call.name, {
                    let mut names = self.names();
                    names.sort_unstable();
                    names.join(", ")
                }),
            );
        };

        if let Err(violation) = validate_arguments(&tool.parameters_schema(), &call.arguments) {
            warn!(tool = %call.name, error = %violation, "Tool arguments failed schema validation");
            return ToolResult::failure(
                &call.id,
                format!("Invalid arguments for '{}': {violation}", call.name),
            );
        }

        match tokio::time::timeout(
            self.execution_timeout,
            tool.execute(ctx, call.arguments.clone()),
        )
        .await
        {
            Ok(Ok(mut result)) => {
                result.tool_call_id = call.id.clone();
                result
            }
            Ok(Err(e)) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                ToolResult::failure(&call.id, format!("Tool '{}' failed: {e}", call.name))
            }
            Err(_) => {
                warn!(tool = %call.name, timeout_secs = self.execution_timeout.as_secs(), "Tool execution timed out");
                ToolResult::failure(
                    &call.id,
                    format!(
                        "Tool '{}' timed out after {}s",
                        call.name,
                        self.execution_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a JSON argument payload against a tool's parameter schema.
///
/// Supports the subset of JSON Schema that tool definitions actually use:
/// `type`, `properties`, `required`, and `enum`. Unknown keys in the payload
/// are allowed (models sometimes add extras); missing required keys and
/// type mismatches are not.
pub fn validate_arguments(
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> std::result::Result<(), String> {
    if schema.get("type").and_then(|t| t.as_str()) == Some("object") && !arguments.is_object() {
        return Err(format!(
            "expected an object, got {}",
            json_type_name(arguments)
        ));
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if arguments.get(field).is_none() {
                return Err(format!("missing required field '{field}'"));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };

    for (name, prop_schema) in properties {
        let Some(value) = arguments.get(name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }

        if let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) {
            let matches = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(format!(
                    "field '{name}' should be {expected}, got {}",
                    json_type_name(value)
                ));
            }
            // Recurse into declared nested object schemas
            if expected == "object" {
                validate_arguments(prop_schema, value)
                    .map_err(|e| format!("in field '{name}': {e}"))?;
            }
        }

        if let Some(allowed) = prop_schema.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                return Err(format!("field '{name}' is not one of the allowed values"));
            }
        }
    }

    Ok(())
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::scratch::{CacheEntry, CacheQuery, CacheStats, PutOptions};

    /// A scratch store that holds nothing, for tests that don't touch it.
    struct NullScratch;

    #[async_trait]
    impl ScratchStore for NullScratch {
        async fn put(
            &self,
            _key: &str,
            _value: serde_json::Value,
            _opts: PutOptions,
        ) -> std::result::Result<(), CacheError> {
            Ok(())
        }
        async fn get(&self, key: &str) -> std::result::Result<serde_json::Value, CacheError> {
            Err(CacheError::NotFound(key.into()))
        }
        async fn search(
            &self,
            _query: CacheQuery,
        ) -> std::result::Result<Vec<CacheEntry>, CacheError> {
            Ok(vec![])
        }
        async fn delete(&self, _key: &str) -> std::result::Result<bool, CacheError> {
            Ok(false)
        }
        async fn list(&self) -> std::result::Result<Vec<CacheEntry>, CacheError> {
            Ok(vec![])
        }
        async fn stats(&self) -> std::result::Result<CacheStats, CacheError> {
            Ok(CacheStats {
                total_entries: 0,
                total_bytes: 0,
                capacity_bytes: 0,
                pinned_entries: 0,
                total_accesses: 0,
                entries_with_summary: 0,
                tag_counts: Default::default(),
            })
        }
        async fn clear(&self) -> std::result::Result<(), CacheError> {
            Ok(())
        }
    }

    fn test_ctx() -> ToolContext {
        ToolContext::new(SessionId::from("test-session"), Arc::new(NullScratch))
    }

    /// A simple echo tool for registry tests.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn execute(
            &self,
            _ctx: &ToolContext,
            arguments: serde_json::Value,
        ) -> std::result::Result<ToolResult, ToolError> {
            let text = arguments["text"].as_str().unwrap_or("").to_string();
            Ok(ToolResult::ok("", text))
        }
    }

    /// A tool that sleeps longer than any sane timeout.
    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Never finishes in time"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(
            &self,
            _ctx: &ToolContext,
            _arguments: serde_json::Value,
        ) -> std::result::Result<ToolResult, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ToolResult::ok("", "too late"))
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool)).unwrap();
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool)).unwrap();
        let err = registry.register(Box::new(EchoTool)).unwrap_err();
        assert!(matches!(err, ToolError::Duplicate(name) if name == "echo"));
    }

    #[tokio::test]
    async fn dispatch_executes_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool)).unwrap();

        let call = ToolCall {
            id: "call_1".into(),
            name: "echo".into(),
            arguments: serde_json::json!({"text": "hello world"}),
        };
        let result = registry.dispatch(&call, &test_ctx()).await;
        assert!(result.success);
        assert_eq!(result.output, "hello world");
        assert_eq!(result.tool_call_id, "call_1");
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_soft_failure() {
        let registry = ToolRegistry::new();
        let call = ToolCall {
            id: "call_1".into(),
            name: "nonexistent".into(),
            arguments: serde_json::json!({}),
        };
        let result = registry.dispatch(&call, &test_ctx()).await;
        assert!(!result.success);
        assert!(result.output.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn dispatch_schema_violation_is_soft_failure() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool)).unwrap();

        let call = ToolCall {
            id: "call_1".into(),
            name: "echo".into(),
            arguments: serde_json::json!({"text": 42}),
        };
        let result = registry.dispatch(&call, &test_ctx()).await;
        assert!(!result.success);
        assert!(result.output.contains("Invalid arguments"));
    }

    #[tokio::test]
    async fn dispatch_timeout_is_soft_failure() {
        let mut registry =
            ToolRegistry::new().with_execution_timeout(Duration::from_millis(20));
        registry.register(Box::new(SlowTool)).unwrap();

        let call = ToolCall {
            id: "call_1".into(),
            name: "slow".into(),
            arguments: serde_json::json!({}),
        };
        let result = registry.dispatch(&call, &test_ctx()).await;
        assert!(!result.success);
        assert!(result.output.contains("timed out"));
    }

    // --- Schema validation ---

    fn echo_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "count": { "type": "integer" },
                "mode": { "type": "string", "enum": ["fast", "slow"] }
            },
            "required": ["text"]
        })
    }

    #[test]
    fn validation_accepts_valid_payload() {
        let args = serde_json::json!({"text": "hi", "count": 3, "mode": "fast"});
        assert!(validate_arguments(&echo_schema(), &args).is_ok());
    }

    #[test]
    fn validation_rejects_missing_required() {
        let args = serde_json::json!({"count": 3});
        let err = validate_arguments(&echo_schema(), &args).unwrap_err();
        assert!(err.contains("text"));
    }

    #[test]
    fn validation_rejects_wrong_type() {
        let args = serde_json::json!({"text": "hi", "count": "three"});
        let err = validate_arguments(&echo_schema(), &args).unwrap_err();
        assert!(err.contains("count"));
    }

    #[test]
    fn validation_rejects_bad_enum_value() {
        let args = serde_json::json!({"text": "hi", "mode": "warp"});
        assert!(validate_arguments(&echo_schema(), &args).is_err());
    }

    #[test]
    fn validation_rejects_non_object_payload() {
        let args = serde_json::json!("just a string");
        assert!(validate_arguments(&echo_schema(), &args).is_err());
    }

    #[test]
    fn validation_recurses_into_nested_objects() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "options": {
                    "type": "object",
                    "properties": { "depth": { "type": "integer" } },
                    "required": ["depth"]
                }
            }
        });
        let good = serde_json::json!({"options": {"depth": 2}});
        assert!(validate_arguments(&schema, &good).is_ok());

        let bad = serde_json::json!({"options": {}});
        let err = validate_arguments(&schema, &bad).unwrap_err();
        assert!(err.contains("options"));
    }
}
