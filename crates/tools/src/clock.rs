//! Clock tool — current time in ISO-8601 or Unix form.

use async_trait::async_trait;
use chrono::Utc;
use scuttle_core::error::ToolError;
use scuttle_core::tool::{Tool, ToolContext, ToolResult};

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current UTC time."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "enum": ["iso", "unix"],
                    "description": "Output format (default: iso)"
                }
            }
        })
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let now = Utc::now();
        let output = match arguments["format"].as_str() {
            Some("unix") => now.timestamp().to_string(),
            _ => now.to_rfc3339(),
        };
        Ok(ToolResult::ok("", output))
    }
}
