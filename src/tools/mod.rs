//! Tools module for Forkchat
//!
//! This module contains the tool executor abstraction, the registry the
//! streaming session calls into, and the built-in tools.
//!
//! The registry boundary never fails: unknown tools, malformed arguments
//! and executor errors are all turned into a textual result that is fed
//! back to the model as a normal tool message.

pub mod clock;
pub mod fetch;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ToolsConfig;
use crate::conversation::{Feature, FeatureToggles};
use crate::error::Result;
use crate::providers::ToolDefinition;

pub use clock::CurrentTimeTool;
pub use fetch::FetchUrlTool;

/// Tool definition
///
/// Represents a tool that can be called by the model, including its name,
/// description, and JSON schema for parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Name of the tool
    pub name: String,
    /// Description of what the tool does
    pub description: String,
    /// JSON schema for tool parameters
    pub parameters: serde_json::Value,
}

impl Tool {
    /// Creates a new tool definition
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Wire representation for the request body
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::function(&self.name, &self.description, self.parameters.clone())
    }
}

/// Result of a tool execution
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Whether the tool execution was successful
    pub success: bool,
    /// Output from the tool
    pub output: String,
    /// Error message if execution failed
    pub error: Option<String>,
    /// Whether output was truncated
    pub truncated: bool,
}

impl ToolResult {
    /// Creates a successful tool result
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            truncated: false,
        }
    }

    /// Creates a failed tool result
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            truncated: false,
        }
    }

    /// Truncates output to at most `max_size` bytes on a char boundary
    pub fn truncate_if_needed(mut self, max_size: usize) -> Self {
        if self.output.len() > max_size {
            let mut cut = max_size;
            while !self.output.is_char_boundary(cut) {
                cut -= 1;
            }
            self.output.truncate(cut);
            self.output.push_str("\n... (truncated)");
            self.truncated = true;
        }
        self
    }

    /// Text handed back to the model for a tool called `name`
    pub fn to_message(&self, name: &str) -> String {
        if self.success {
            self.output.clone()
        } else {
            format!(
                "Error executing {}: {}",
                name,
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

/// Tool executor trait
///
/// All tools implement this trait to provide their definition and
/// execution logic.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Returns the tool definition
    fn tool_definition(&self) -> Tool;

    /// Conversation feature that must be enabled for the tool to be advertised
    fn feature(&self) -> Option<Feature> {
        None
    }

    /// Executes the tool with the given arguments
    async fn execute(&self, args: serde_json::Value) -> Result<ToolResult>;
}

/// Tool registry
///
/// Maps tool names to executors. Definitions are returned in name order so
/// request bodies are deterministic.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in tools
    ///
    /// # Examples
    ///
    /// ```
    /// use forkchat::config::ToolsConfig;
    /// use forkchat::tools::ToolRegistry;
    ///
    /// let registry = ToolRegistry::builtin(&ToolsConfig::default());
    /// assert!(registry.get("current_time").is_some());
    /// assert!(registry.get("fetch_url").is_some());
    /// ```
    pub fn builtin(config: &ToolsConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CurrentTimeTool));
        registry.register(Arc::new(FetchUrlTool::new(
            Duration::from_secs(config.fetch_timeout_seconds),
            config.max_fetch_bytes,
        )));
        registry
    }

    /// Registers an executor under its definition's name
    pub fn register(&mut self, executor: Arc<dyn ToolExecutor>) {
        let name = executor.tool_definition().name;
        self.tools.insert(name, executor);
    }

    /// Gets a tool executor by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.get(name).cloned()
    }

    /// Definitions of the tools allowed by `features`
    pub fn definitions_for(&self, features: &FeatureToggles) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .filter(|executor| {
                executor
                    .feature()
                    .map(|f| features.is_enabled(f))
                    .unwrap_or(true)
            })
            .map(|executor| executor.tool_definition().to_definition())
            .collect()
    }

    /// Runs `name` with JSON-encoded `arguments`
    ///
    /// Never fails; every failure is rendered as
    /// `"Error executing <name>: <reason>"`.
    pub async fn execute(&self, name: &str, arguments: &str) -> String {
        let Some(executor) = self.get(name) else {
            tracing::warn!(tool = name, "Model called an unknown tool");
            return format!("Error executing {}: unknown tool", name);
        };

        let args = if arguments.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str::<serde_json::Value>(arguments) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(tool = name, "Invalid tool arguments: {}", e);
                    return format!("Error executing {}: invalid arguments: {}", name, e);
                }
            }
        };

        match executor.execute(args).await {
            Ok(result) => {
                tracing::debug!(tool = name, success = result.success, "Tool executed");
                result.to_message(name)
            }
            Err(e) => {
                tracing::warn!(tool = name, "Tool execution failed: {}", e);
                format!("Error executing {}: {}", name, e)
            }
        }
    }

    /// Returns the number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Checks if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl ToolExecutor for EchoTool {
        fn tool_definition(&self) -> Tool {
            Tool::new("echo", "Echo the input", json!({"type": "object"}))
        }

        async fn execute(&self, args: serde_json::Value) -> Result<ToolResult> {
            match args.get("text").and_then(|v| v.as_str()) {
                Some(text) => Ok(ToolResult::success(text)),
                None => Ok(ToolResult::error("missing text")),
            }
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl ToolExecutor for BrokenTool {
        fn tool_definition(&self) -> Tool {
            Tool::new("broken", "Always fails", json!({"type": "object"}))
        }

        fn feature(&self) -> Option<Feature> {
            Some(Feature::CodeExecution)
        }

        async fn execute(&self, _args: serde_json::Value) -> Result<ToolResult> {
            Err(anyhow::anyhow!("disk on fire"))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(BrokenTool));
        registry
    }

    #[tokio::test]
    async fn test_execute_success() {
        let out = registry().execute("echo", r#"{"text":"hi"}"#).await;
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn test_execute_failures_become_text() {
        let registry = registry();
        assert_eq!(
            registry.execute("nope", "{}").await,
            "Error executing nope: unknown tool"
        );
        assert!(registry
            .execute("echo", "{\"text\":")
            .await
            .starts_with("Error executing echo: invalid arguments"));
        assert_eq!(
            registry.execute("echo", "{}").await,
            "Error executing echo: missing text"
        );
        assert_eq!(
            registry.execute("broken", "").await,
            "Error executing broken: disk on fire"
        );
    }

    #[test]
    fn test_definitions_filtered_by_features() {
        let registry = registry();
        let names = |features: &FeatureToggles| {
            registry
                .definitions_for(features)
                .into_iter()
                .map(|d| d.function.name)
                .collect::<Vec<_>>()
        };

        assert_eq!(names(&FeatureToggles::default()), vec!["echo"]);
        let features = FeatureToggles {
            code_execution: true,
            ..Default::default()
        };
        assert_eq!(names(&features), vec!["broken", "echo"]);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let result = ToolResult::success("héllo wörld").truncate_if_needed(2);
        assert!(result.truncated);
        assert!(result.output.starts_with('h'));
    }

    #[test]
    fn test_builtin_registry() {
        let registry = ToolRegistry::builtin(&ToolsConfig::default());
        assert_eq!(registry.len(), 2);
        let advertised = registry.definitions_for(&FeatureToggles::default());
        assert_eq!(advertised.len(), 1);
        assert_eq!(advertised[0].function.name, "current_time");
    }
}
