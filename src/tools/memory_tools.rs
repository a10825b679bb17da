//! Tools exposing the memory subsystem to the engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::memory::{ArchivalMemory, CoreMemory};

use super::traits::{Tool, ToolContext, ToolFlags, ToolResult};

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required argument '{key}'"))
}

// ─── memorize ─────────────────────────────────────────────────────────────────

pub struct MemorizeTool {
    archival: Arc<ArchivalMemory>,
}

impl MemorizeTool {
    pub fn new(archival: Arc<ArchivalMemory>) -> Self {
        Self { archival }
    }
}

#[async_trait]
impl Tool for MemorizeTool {
    fn name(&self) -> &str {
        "memorize"
    }

    fn description(&self) -> &str {
        "Store a fact in long-term archival memory under a category."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "category": { "type": "string", "description": "Category to file the fact under." },
                "content": { "type": "string", "description": "The fact to remember." }
            },
            "required": ["category", "content"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, String> {
        let category = str_arg(&args, "category")?;
        let content = str_arg(&args, "content")?;
        let outcome = self.archival.memorize(category, content).await?;
        if outcome.duplicate {
            Ok(ToolResult::ok("duplicate: this fact is already stored")
                .with_metadata(json!({ "stored": false, "duplicate": true })))
        } else {
            Ok(ToolResult::ok(format!("stored under '{category}'"))
                .with_metadata(json!({ "stored": true, "duplicate": false })))
        }
    }
}

// ─── search_memory ────────────────────────────────────────────────────────────

pub struct SearchMemoryTool {
    archival: Arc<ArchivalMemory>,
}

impl SearchMemoryTool {
    pub fn new(archival: Arc<ArchivalMemory>) -> Self {
        Self { archival }
    }
}

#[async_trait]
impl Tool for SearchMemoryTool {
    fn name(&self) -> &str {
        "search_memory"
    }

    fn description(&self) -> &str {
        "Semantic search within one memory category."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "category": { "type": "string" },
                "query": { "type": "string" },
                "k": { "type": "integer", "description": "Maximum results (default 5)." }
            },
            "required": ["category", "query"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, String> {
        let category = str_arg(&args, "category")?;
        let query = str_arg(&args, "query")?;
        let k = args.get("k").and_then(Value::as_u64).unwrap_or(5) as usize;
        let hits = self.archival.search_memory(category, query, k).await?;
        if hits.is_empty() {
            return Ok(ToolResult::ok("no matches"));
        }
        let listing = hits
            .iter()
            .map(|h| format!("- {}", h.content))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolResult::ok(listing))
    }
}

// ─── search_all_categories ────────────────────────────────────────────────────

pub struct SearchAllCategoriesTool {
    archival: Arc<ArchivalMemory>,
}

impl SearchAllCategoriesTool {
    pub fn new(archival: Arc<ArchivalMemory>) -> Self {
        Self { archival }
    }
}

#[async_trait]
impl Tool for SearchAllCategoriesTool {
    fn name(&self) -> &str {
        "search_all_categories"
    }

    fn description(&self) -> &str {
        "Semantic search across every memory category, best matches first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "k": { "type": "integer", "description": "Maximum results (default 5)." }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, String> {
        let query = str_arg(&args, "query")?;
        let k = args.get("k").and_then(Value::as_u64).unwrap_or(5) as usize;
        let hits = self.archival.search_all_categories(query, k).await?;
        if hits.is_empty() {
            return Ok(ToolResult::ok("no matches"));
        }
        let listing = hits
            .iter()
            .map(|h| format!("- [{}] {}", h.category, h.content))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolResult::ok(listing))
    }
}

// ─── forget_memory ────────────────────────────────────────────────────────────

pub struct ForgetMemoryTool {
    archival: Arc<ArchivalMemory>,
}

impl ForgetMemoryTool {
    pub fn new(archival: Arc<ArchivalMemory>) -> Self {
        Self { archival }
    }
}

#[async_trait]
impl Tool for ForgetMemoryTool {
    fn name(&self) -> &str {
        "forget_memory"
    }

    fn description(&self) -> &str {
        "Delete memories in a category that closely match the given content."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "category": { "type": "string" },
                "content": { "type": "string", "description": "Content to match for deletion." }
            },
            "required": ["category", "content"]
        })
    }

    fn flags(&self) -> ToolFlags {
        ToolFlags::DESTRUCTIVE
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, String> {
        let category = str_arg(&args, "category")?;
        let content = str_arg(&args, "content")?;
        let removed = self.archival.forget_memory(category, content).await?;
        Ok(ToolResult::ok(format!("removed {removed} memories"))
            .with_metadata(json!({ "removed": removed })))
    }
}

// ─── core_memory_append / core_memory_replace ─────────────────────────────────

pub struct CoreMemoryAppendTool {
    core: Arc<CoreMemory>,
    /// When set, an over-cap append auto-enqueues a `distill_memory` heavy
    /// task whose completion replaces the document with the distilled text.
    heavy: Option<Arc<crate::lanes::HeavyTaskQueue>>,
}

impl CoreMemoryAppendTool {
    pub fn new(core: Arc<CoreMemory>) -> Self {
        Self { core, heavy: None }
    }

    pub fn with_distillation(mut self, heavy: Arc<crate::lanes::HeavyTaskQueue>) -> Self {
        self.heavy = Some(heavy);
        self
    }
}

#[async_trait]
impl Tool for CoreMemoryAppendTool {
    fn name(&self) -> &str {
        "core_memory_append"
    }

    fn description(&self) -> &str {
        "Append a fact to the always-in-context working memory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "fact": { "type": "string" }
            },
            "required": ["fact"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, String> {
        let fact = str_arg(&args, "fact")?;
        let outcome = self.core.append(fact).map_err(|e| e.to_string())?;

        if outcome.needs_distillation
            && let Some(heavy) = &self.heavy
        {
            let core = self.core.clone();
            let prompt = format!(
                "Distill this working memory document below its size cap. Keep active goals, \
                 user context, critical facts, and open tasks; drop stale detail.\n\n{}",
                self.core.read()
            );
            heavy.enqueue(
                "distill working memory",
                prompt,
                crate::lanes::HeavyTaskType::DistillMemory,
                Some(Box::new(move |result| {
                    if let Ok(distilled) = result
                        && let Err(e) = core.replace(&distilled)
                    {
                        tracing::warn!(error = %e, "distilled memory write failed");
                    }
                })),
            );
        }

        Ok(
            ToolResult::ok("appended to core memory").with_metadata(json!({
                "needsDistillation": outcome.needs_distillation
            })),
        )
    }
}

pub struct CoreMemoryReplaceTool {
    core: Arc<CoreMemory>,
}

impl CoreMemoryReplaceTool {
    pub fn new(core: Arc<CoreMemory>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl Tool for CoreMemoryReplaceTool {
    fn name(&self) -> &str {
        "core_memory_replace"
    }

    fn description(&self) -> &str {
        "Replace the entire working memory document."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string" }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult, String> {
        let content = str_arg(&args, "content")?;
        self.core.replace(content).map_err(|e| e.to_string())?;
        Ok(ToolResult::ok("core memory replaced"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::NullBroadcaster;
    use crate::memory::HashEmbeddingProvider;
    use crate::tools::policy::SenderRole;

    fn ctx() -> ToolContext {
        ToolContext {
            client_id: "client-1".to_owned(),
            sender_role: SenderRole::Owner,
            broadcaster: Arc::new(NullBroadcaster),
        }
    }

    fn archival() -> Arc<ArchivalMemory> {
        Arc::new(ArchivalMemory::in_memory(Arc::new(HashEmbeddingProvider::new())).unwrap())
    }

    #[tokio::test]
    async fn memorize_then_duplicate() {
        let mem = archival();
        let tool = MemorizeTool::new(mem);
        let args = json!({"category": "prefs", "content": "user prefers emacs"});

        let first = tool.execute(args.clone(), &ctx()).await.unwrap();
        assert!(first.success);
        assert_eq!(first.metadata.unwrap()["stored"], true);

        let second = tool.execute(args, &ctx()).await.unwrap();
        assert!(second.success);
        assert_eq!(second.metadata.unwrap()["duplicate"], true);
    }

    #[tokio::test]
    async fn search_tools_round_trip() {
        let mem = archival();
        MemorizeTool::new(mem.clone())
            .execute(
                json!({"category": "stack", "content": "project uses postgres 15"}),
                &ctx(),
            )
            .await
            .unwrap();

        let one = SearchMemoryTool::new(mem.clone())
            .execute(json!({"category": "stack", "query": "postgres"}), &ctx())
            .await
            .unwrap();
        assert!(one.output.contains("postgres 15"));

        let all = SearchAllCategoriesTool::new(mem)
            .execute(json!({"query": "postgres project"}), &ctx())
            .await
            .unwrap();
        assert!(all.output.contains("[stack]"));
    }

    #[tokio::test]
    async fn forget_reports_removed_count() {
        let mem = archival();
        MemorizeTool::new(mem.clone())
            .execute(json!({"category": "tmp", "content": "scratch note"}), &ctx())
            .await
            .unwrap();

        let result = ForgetMemoryTool::new(mem)
            .execute(json!({"category": "tmp", "content": "scratch note"}), &ctx())
            .await
            .unwrap();
        assert_eq!(result.metadata.unwrap()["removed"], 1);
    }

    #[tokio::test]
    async fn core_memory_tools() {
        let dir = tempfile::TempDir::new().unwrap();
        let core = Arc::new(CoreMemory::open(dir.path().join("core-memory.md")).unwrap());

        CoreMemoryAppendTool::new(core.clone())
            .execute(json!({"fact": "owner speaks French"}), &ctx())
            .await
            .unwrap();
        assert!(core.read().contains("owner speaks French"));

        CoreMemoryReplaceTool::new(core.clone())
            .execute(json!({"content": "fresh start"}), &ctx())
            .await
            .unwrap();
        assert_eq!(core.read(), "fresh start");
    }
}
