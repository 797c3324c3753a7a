//! Scratch-pad tools — the model's handle on its working memory.
//!
//! Three tools over the session's working set: store, fetch, and search.
//! The store arrives through the `ToolContext`, so the same registry serves
//! every session.

use async_trait::async_trait;
use scuttle_core::error::{CacheError, ToolError};
use scuttle_core::scratch::{CacheQuery, PutOptions, ScratchStore};
use scuttle_core::tool::{Tool, ToolContext, ToolResult};
use uuid::Uuid;

/// Store a value in the scratch pad.
pub struct ScratchStoreTool;

#[async_trait]
impl Tool for ScratchStoreTool {
    fn name(&self) -> &str {
        "scratch_store"
    }

    fn description(&self) -> &str {
        "Store a value in your scratch pad for later turns. Tag entries to find them again; \
         tag with 'keep' to protect an entry from eviction."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": {
                    "type": "string",
                    "description": "Key to store under; generated when omitted"
                },
                "value": {
                    "description": "The value to store (any JSON)"
                },
                "tags": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Tags for later search; 'keep' pins the entry"
                },
                "summary": {
                    "type": "string",
                    "description": "Short description of the value"
                },
                "ttl_secs": {
                    "type": "integer",
                    "description": "Seconds until the entry expires"
                }
            },
            "required": ["value"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let key = arguments["key"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| format!("item_{}", &Uuid::new_v4().simple().to_string()[..8]));
        let value = arguments
            .get("value")
            .cloned()
            .ok_or_else(|| ToolError::SchemaViolation("missing 'value'".into()))?;

        let opts = PutOptions {
            tags: arguments["tags"]
                .as_array()
                .map(|tags| {
                    tags.iter()
                        .filter_map(|t| t.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            summary: arguments["summary"].as_str().map(String::from),
            ttl_secs: arguments["ttl_secs"].as_u64(),
        };

        match ctx.scratch.put(&key, value, opts).await {
            Ok(()) => Ok(ToolResult::ok("", format!("Stored under key '{key}'"))),
            Err(e @ CacheError::CapacityExceeded { .. }) => Ok(ToolResult::failure(
                "",
                format!("Not stored: {e}. Delete or unpin entries to make room."),
            )),
            Err(e) => Err(ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Fetch a value from the scratch pad.
pub struct ScratchGetTool;

#[async_trait]
impl Tool for ScratchGetTool {
    fn name(&self) -> &str {
        "scratch_get"
    }

    fn description(&self) -> &str {
        "Fetch a value from your scratch pad by key."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "The key to fetch" }
            },
            "required": ["key"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let key = arguments["key"]
            .as_str()
            .ok_or_else(|| ToolError::SchemaViolation("missing 'key'".into()))?;

        match ctx.scratch.get(key).await {
            Ok(value) => {
                let rendered = match &value {
                    serde_json::Value::String(s) => s.clone(),
                    other => serde_json::to_string_pretty(other).unwrap_or_default(),
                };
                Ok(ToolResult::ok("", rendered))
            }
            Err(CacheError::NotFound(_)) => Ok(ToolResult::failure(
                "",
                format!("No scratch entry under key '{key}'"),
            )),
            Err(e) => Err(ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Search the scratch pad by text and/or tags.
pub struct ScratchSearchTool;

#[async_trait]
impl Tool for ScratchSearchTool {
    fn name(&self) -> &str {
        "scratch_search"
    }

    fn description(&self) -> &str {
        "Search your scratch pad by free text and/or tags. Returns matching keys with previews."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Free-text query" },
                "tags": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Restrict to entries carrying any of these tags"
                },
                "limit": { "type": "integer", "description": "Maximum results (default 10)" }
            }
        })
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let query = CacheQuery {
            text: arguments["query"].as_str().map(String::from),
            tags: arguments["tags"]
                .as_array()
                .map(|tags| {
                    tags.iter()
                        .filter_map(|t| t.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            match_all_tags: false,
            limit: arguments["limit"].as_u64().unwrap_or(10) as usize,
        };

        let entries = ctx
            .scratch
            .search(query)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name().into(),
                reason: e.to_string(),
            })?;

        if entries.is_empty() {
            return Ok(ToolResult::ok("", "No matching scratch entries"));
        }

        let lines: Vec<String> = entries
            .iter()
            .map(|entry| {
                let summary = entry
                    .summary
                    .clone()
                    .unwrap_or_else(|| entry.value_preview(80));
                format!("{}: {} (tags: {})", entry.key, summary, entry.tags.join(", "))
            })
            .collect();
        Ok(ToolResult::ok("", lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scuttle_core::SessionId;
    use scuttle_session::{WorkingSet, WorkingSetConfig};
    use std::sync::Arc;

    fn ctx() -> ToolContext {
        ToolContext::new(
            SessionId::from("tool-test"),
            Arc::new(WorkingSet::new(WorkingSetConfig::default())),
        )
    }

    fn tiny_ctx() -> ToolContext {
        ToolContext::new(
            SessionId::from("tool-test"),
            Arc::new(WorkingSet::new(WorkingSetConfig {
                capacity_bytes: 40,
                pin_tag: "keep".into(),
                default_ttl: None,
            })),
        )
    }

    #[tokio::test]
    async fn store_then_get() {
        let ctx = ctx();
        let stored = ScratchStoreTool
            .execute(
                &ctx,
                serde_json::json!({"key": "gear", "value": "12-tooth spur", "tags": ["sketch"]}),
            )
            .await
            .unwrap();
        assert!(stored.success);
        assert!(stored.output.contains("gear"));

        let fetched = ScratchGetTool
            .execute(&ctx, serde_json::json!({"key": "gear"}))
            .await
            .unwrap();
        assert!(fetched.success);
        assert_eq!(fetched.output, "12-tooth spur");
    }

    #[tokio::test]
    async fn store_generates_key_when_omitted() {
        let ctx = ctx();
        let stored = ScratchStoreTool
            .execute(&ctx, serde_json::json!({"value": {"width": 4}}))
            .await
            .unwrap();
        assert!(stored.success);
        assert!(stored.output.contains("item_"));
    }

    #[tokio::test]
    async fn get_missing_is_soft_failure() {
        let ctx = ctx();
        let result = ScratchGetTool
            .execute(&ctx, serde_json::json!({"key": "nothing"}))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.output.contains("nothing"));
    }

    #[tokio::test]
    async fn capacity_rejection_is_reported_not_fatal() {
        let ctx = tiny_ctx();
        ScratchStoreTool
            .execute(
                &ctx,
                serde_json::json!({"key": "a", "value": "0123456789", "tags": ["keep"]}),
            )
            .await
            .unwrap();
        ScratchStoreTool
            .execute(
                &ctx,
                serde_json::json!({"key": "b", "value": "0123456789", "tags": ["keep"]}),
            )
            .await
            .unwrap();

        let rejected = ScratchStoreTool
            .execute(&ctx, serde_json::json!({"key": "c", "value": "0123456789"}))
            .await
            .unwrap();
        assert!(!rejected.success);
        assert!(rejected.output.contains("Not stored"));
    }

    #[tokio::test]
    async fn search_finds_by_tag_and_text() {
        let ctx = ctx();
        ScratchStoreTool
            .execute(
                &ctx,
                serde_json::json!({
                    "key": "gear",
                    "value": "12-tooth spur gear",
                    "tags": ["sketch"],
                    "summary": "gear profile"
                }),
            )
            .await
            .unwrap();
        ScratchStoreTool
            .execute(
                &ctx,
                serde_json::json!({"key": "todo", "value": "check tolerances", "tags": ["notes"]}),
            )
            .await
            .unwrap();

        let by_text = ScratchSearchTool
            .execute(&ctx, serde_json::json!({"query": "gear"}))
            .await
            .unwrap();
        assert!(by_text.output.contains("gear"));
        assert!(!by_text.output.contains("todo"));

        let by_tag = ScratchSearchTool
            .execute(&ctx, serde_json::json!({"tags": ["notes"]}))
            .await
            .unwrap();
        assert!(by_tag.output.contains("todo"));

        let nothing = ScratchSearchTool
            .execute(&ctx, serde_json::json!({"query": "nonexistent term"}))
            .await
            .unwrap();
        assert!(nothing.output.contains("No matching"));
    }
}
