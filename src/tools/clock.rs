//! `current_time` tool

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::json;

use crate::error::{ForkchatError, Result};
use crate::tools::{Tool, ToolExecutor, ToolResult};

/// Reports the current date and time, optionally shifted to a UTC offset
#[derive(Debug, Clone, Default)]
pub struct CurrentTimeTool;

#[async_trait]
impl ToolExecutor for CurrentTimeTool {
    fn tool_definition(&self) -> Tool {
        Tool::new(
            "current_time",
            "Get the current date and time in RFC 3339 format",
            json!({
                "type": "object",
                "properties": {
                    "utc_offset_minutes": {
                        "type": "integer",
                        "description": "Offset from UTC in minutes, e.g. 120 for UTC+2"
                    }
                }
            }),
        )
    }

    async fn execute(&self, args: serde_json::Value) -> Result<ToolResult> {
        let offset_minutes = match args.get("utc_offset_minutes") {
            None | Some(serde_json::Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| {
                ForkchatError::Tool("utc_offset_minutes must be an integer".into())
            })?,
        };

        let offset = i32::try_from(offset_minutes * 60)
            .ok()
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ForkchatError::Tool(format!("utc offset out of range: {}", offset_minutes))
            })?;

        let now = Utc::now().with_timezone(&offset);
        Ok(ToolResult::success(now.to_rfc3339()))
    }
}
