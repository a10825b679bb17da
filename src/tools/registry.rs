use std::{collections::HashMap, sync::Arc};

use crate::engine::ToolSpec;

use super::policy::{PolicyDecision, SenderRole, evaluate_tool_policy};
use super::traits::{Tool, to_spec};

/// Central registry of available tools: the static native set plus anything
/// forged or provided by extensions at runtime.
///
/// Registration happens during daemon construction and whenever the forge
/// produces a new artefact, so the map lives behind a `std::sync::Mutex`
/// inside an `Arc<ToolRegistry>`.
pub struct ToolRegistry {
    tools: std::sync::Mutex<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Register a tool.  Overwrites any previous tool with the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        if let Ok(mut map) = self.tools.lock() {
            map.insert(tool.name().to_owned(), tool);
        }
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.lock().ok().and_then(|map| map.get(name).cloned())
    }

    /// The effective tool set for one request: every registered tool the
    /// sender's role may see.  Computed once per request and handed to the
    /// engine adapter.
    pub fn effective_specs(&self, role: SenderRole) -> Vec<ToolSpec> {
        let Ok(map) = self.tools.lock() else {
            return Vec::new();
        };
        let mut specs: Vec<ToolSpec> = map
            .values()
            .filter(|t| {
                matches!(
                    evaluate_tool_policy(t.name(), role),
                    PolicyDecision::Allowed
                )
            })
            .map(|t| to_spec(t.as_ref()))
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
