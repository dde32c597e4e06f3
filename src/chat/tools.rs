//! Tool handlers - definitions, execution, outcome packaging

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::types::ToolDefinition;

/// Error during tool execution
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

/// Result of one tool execution, addressed by tool-use id
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub tool_use_id: String,
    pub output: Vec<String>,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn success(tool_use_id: impl Into<String>, output: Vec<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            output,
            is_error: false,
        }
    }

    pub fn error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            output: vec![message.into()],
            is_error: true,
        }
    }
}

/// A tool the model can call. Handlers run concurrently with the
/// conversation; output lines become the tool_result body.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn run(&self, input: serde_json::Value) -> Result<Vec<String>, ToolError>;
}

/// Registry of handlers keyed by tool name
#[derive(Default)]
pub struct ToolRunner {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.definition().name;
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Definitions for every registered tool, name-sorted for stable requests
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.handlers.values().map(|h| h.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Run a handler to completion, converting every failure into an
    /// error outcome the model can recover from
    pub async fn execute(
        &self,
        tool_use_id: &str,
        name: &str,
        input: serde_json::Value,
    ) -> ToolOutcome {
        let Some(handler) = self.get(name) else {
            tracing::warn!("No handler registered for tool '{}'", name);
            return ToolOutcome::error(tool_use_id, ToolError::NotFound(name.to_string()).to_string());
        };
        match handler.run(input).await {
            Ok(output) => ToolOutcome::success(tool_use_id, output),
            Err(e) => {
                tracing::warn!("Tool '{}' failed: {}", name, e);
                ToolOutcome::error(tool_use_id, e.to_string())
            }
        }
    }
}
