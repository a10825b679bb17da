//! The forge bridge: wraps the external code-sandbox runner as the
//! `create_and_run_tool` tool and persists successful artefacts in
//! `tools-registry.json` so they survive restarts as invocable tools.

use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Mutex, Weak},
};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::registry::ToolRegistry;
use super::traits::{Tool, ToolContext, ToolFlags, ToolResult};

// ─── ForgeRunner (consumed) ───────────────────────────────────────────────────

/// What the engine asked the forge to build and execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeSpec {
    pub filename: String,
    pub description: String,
    pub code: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
}

/// The external workspace that writes, installs dependencies for, and runs
/// generated code.  Implementations live outside the core.
#[async_trait]
pub trait ForgeRunner: Send + Sync {
    /// Create the artefact and run it once.
    async fn create_and_run(&self, spec: &ForgeSpec) -> Result<ForgeOutcome, String>;

    /// Re-run a previously created artefact by filename.
    async fn run_existing(&self, filename: &str, args: &Value) -> Result<ForgeOutcome, String>;
}

// ─── Persistent artefact registry ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgedToolRecord {
    pub name: String,
    pub filename: String,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    tools: Vec<ForgedToolRecord>,
}

/// On-disk store behind `tools-registry.json`.
pub struct ForgeStore {
    path: PathBuf,
    state: Mutex<RegistryFile>,
}

impl ForgeStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str::<RegistryFile>(&json)
                .map_err(|e| format!("tools-registry parse: {e}"))?,
            Err(_) => RegistryFile {
                version: 1,
                tools: Vec::new(),
            },
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn records(&self) -> Vec<ForgedToolRecord> {
        self.state
            .lock()
            .map(|s| s.tools.clone())
            .unwrap_or_default()
    }

    /// Append a record (replacing any with the same name) and persist.
    pub fn append(&self, record: ForgedToolRecord) -> Result<(), String> {
        let snapshot = {
            let mut state = match self.state.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.tools.retain(|t| t.name != record.name);
            state.tools.push(record);
            state.clone()
        };
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| format!("tools-registry serialise: {e}"))?;
        fs::write(&self.path, json).map_err(|e| format!("tools-registry write: {e}"))
    }
}

// ─── ForgedTool ───────────────────────────────────────────────────────────────

/// A previously forged artefact, re-invocable as a first-class tool.
pub struct ForgedTool {
    record: ForgedToolRecord,
    runner: Arc<dyn ForgeRunner>,
}

impl ForgedTool {
    pub fn new(record: ForgedToolRecord, runner: Arc<dyn ForgeRunner>) -> Self {
        Self { record, runner }
    }
}

#[async_trait]
impl Tool for ForgedTool {
    fn name(&self) -> &str {
        &self.record.name
    }

    fn description(&self) -> &str {
        &self.record.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "args": { "type": "object", "description": "Arguments forwarded to the artefact." }
            }
        })
    }

    fn flags(&self) -> ToolFlags {
        // Forged code runs unreviewed on the host.
        ToolFlags::DESTRUCTIVE
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, String> {
        let forwarded = args.get("args").cloned().unwrap_or(Value::Null);
        let outcome = self
            .runner
            .run_existing(&self.record.filename, &forwarded)
            .await?;
        Ok(outcome_to_result(&outcome))
    }
}

/// Register every persisted artefact as a live tool.  Called at daemon start.
pub fn register_forged_tools(
    store: &ForgeStore,
    runner: Arc<dyn ForgeRunner>,
    registry: &ToolRegistry,
) -> usize {
    let records = store.records();
    let count = records.len();
    for record in records {
        registry.register(Arc::new(ForgedTool::new(record, runner.clone())));
    }
    count
}

// ─── create_and_run_tool ──────────────────────────────────────────────────────

/// Owner-only tool that asks the forge to build and execute new code.
pub struct CreateAndRunTool {
    runner: Arc<dyn ForgeRunner>,
    store: Arc<ForgeStore>,
    /// Weak link back to the live registry so successful artefacts become
    /// invocable immediately without an Arc cycle.
    registry: Weak<ToolRegistry>,
}

impl CreateAndRunTool {
    pub fn new(
        runner: Arc<dyn ForgeRunner>,
        store: Arc<ForgeStore>,
        registry: Weak<ToolRegistry>,
    ) -> Self {
        Self {
            runner,
            store,
            registry,
        }
    }
}

#[async_trait]
impl Tool for CreateAndRunTool {
    fn name(&self) -> &str {
        "create_and_run_tool"
    }

    fn description(&self) -> &str {
        "Write a new script in the forge workspace, install its dependencies, run it, \
         and register it as a reusable tool on success."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filename": { "type": "string" },
                "description": { "type": "string" },
                "code": { "type": "string" },
                "dependencies": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["filename", "description", "code"]
        })
    }

    fn flags(&self) -> ToolFlags {
        ToolFlags::DESTRUCTIVE
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, String> {
        let spec: ForgeSpec =
            serde_json::from_value(args).map_err(|e| format!("invalid forge spec: {e}"))?;

        let outcome = self.runner.create_and_run(&spec).await?;

        if outcome.success {
            let record = ForgedToolRecord {
                name: tool_name_for(&spec.filename),
                filename: spec.filename.clone(),
                description: spec.description.clone(),
                dependencies: spec.dependencies.clone(),
                created_at: Utc::now().to_rfc3339(),
            };
            if let Err(e) = self.store.append(record.clone()) {
                tracing::warn!(error = %e, "failed to persist forged tool");
            }
            if let Some(registry) = self.registry.upgrade() {
                registry.register(Arc::new(ForgedTool::new(record, self.runner.clone())));
            }
        }

        Ok(outcome_to_result(&outcome))
    }
}

/// Derive a snake_case tool name from an artefact filename.
fn tool_name_for(filename: &str) -> String {
    let stem = filename
        .rsplit('/')
        .next()
        .unwrap_or(filename)
        .split('.')
        .next()
        .unwrap_or(filename);
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("forged_{cleaned}")
}

fn outcome_to_result(outcome: &ForgeOutcome) -> ToolResult {
    let mut text = outcome.stdout.clone();
    if !outcome.stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str("[stderr]\n");
        text.push_str(&outcome.stderr);
    }
    ToolResult {
        output: text,
        success: outcome.success,
        metadata: Some(json!({
            "durationMs": outcome.duration_ms,
            "exitCode": outcome.exit_code,
        })),
    }
}
