use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::ToolSpec;
use crate::gateway::Broadcaster;

use super::policy::SenderRole;

/// The result of executing a [`Tool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Human-readable output (stdout, search hits, confirmation text, etc.).
    pub output: String,
    /// Whether the tool considered the execution successful.
    pub success: bool,
    /// Optional structured metadata for machine consumption.
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            metadata: None,
        }
    }

    pub fn err(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Safety classification driving the approval path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFlags {
    /// Can destroy or mutate local state (files, processes, VCS).
    pub destructive: bool,
    /// Reaches outside the machine on the owner's behalf (messages, posts).
    pub intrusive: bool,
}

impl ToolFlags {
    pub const NONE: ToolFlags = ToolFlags {
        destructive: false,
        intrusive: false,
    };
    pub const DESTRUCTIVE: ToolFlags = ToolFlags {
        destructive: true,
        intrusive: false,
    };
    pub const INTRUSIVE: ToolFlags = ToolFlags {
        destructive: false,
        intrusive: true,
    };

    pub fn needs_approval(&self) -> bool {
        self.destructive || self.intrusive
    }
}

/// Execution context threaded into every tool call.
#[derive(Clone)]
pub struct ToolContext {
    pub client_id: String,
    pub sender_role: SenderRole,
    pub broadcaster: Arc<dyn Broadcaster>,
}

/// A capability the engine can invoke.
///
/// Implementations must be `Send + Sync` so they can be held in a shared
/// `Arc<dyn Tool>` registry.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable machine identifier (snake_case), e.g. `"execute_shell_command"`.
    fn name(&self) -> &str;

    /// Human-readable description used in engine tool payloads.
    fn description(&self) -> &str;

    /// JSON Schema object describing the tool's accepted parameters.
    fn parameters_schema(&self) -> Value;

    fn flags(&self) -> ToolFlags {
        ToolFlags::NONE
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, String>;
}

/// Convert a tool into the engine-facing spec.
pub fn to_spec(tool: &dyn Tool) -> ToolSpec {
    ToolSpec {
        name: tool.name().to_owned(),
        description: tool.description().to_owned(),
        schema: tool.parameters_schema(),
    }
}
