//! The per-request pipeline: auto-RAG, context guard, router dispatch, and
//! the engine/tool loop with the approval gate.
//!
//! # Flow
//!
//! ```text
//! Request ─► role + engine hint ─► router
//!    score ≥ 60 & worker ───────► heavy queue, ack, done
//!    otherwise ────────────────► engine turn loop:
//!        auto-RAG ─► context guard (compact once) ─► adapter.stream()
//!            Chunk      → fan-out
//!            ToolCall   → policy → loop detector → approval gate → execute
//!                         result appended, next turn
//!            Done       → transcript + stream:done
//!            Error      → compact-retry (context-overflow, once) or chat:error
//! ```
//!
//! Each turn hands the engine the full message list including tool results;
//! the adapter owns provider-specific marshalling.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;

use crate::{
    context::{self, Compactor, GuardAction, Summarizer},
    engine::{
        ChatMessage, EngineAdapter, EngineErrorKind, EngineEvent, EngineKind, EnginePool,
        EngineRequest,
    },
    gateway::{Broadcaster, ServerMessage},
    heartbeat::{DaemonState, StateHandle},
    lanes::{HeavyTaskQueue, HeavyTaskType},
    memory::{ArchivalMemory, CoreMemory},
    router::{CognitiveRouter, RouteDecision, parse_engine_hint},
    tools::{
        ApprovalDecision, ApprovalGate, ApprovalReason, ApprovalRequest, LoopDetector,
        LoopVerdict, PolicyDecision, SenderRole, ToolContext, ToolRegistry, ToolResult,
        evaluate_tool_policy, hash_args, hash_result,
    },
    transcript::{EntryRole, TranscriptLog},
};

/// Upper bound on engine turns per request; the loop detector usually trips
/// long before this.
const MAX_ENGINE_TURNS: usize = 20;

const AUTO_RAG_K: usize = 3;
const AUTO_RAG_MIN_CHARS: usize = 12;

/// Header on the retrieved-context block prepended to the user message.
pub const AUTO_CONTEXT_HEADER: &str = "[SYSTEM AUTO-CONTEXT RETRIEVED]";

// ─── Request ──────────────────────────────────────────────────────────────────

/// One user request, immutable from gateway ingress to the final
/// `stream:done`.
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: String,
    pub client_id: String,
    pub content: String,
    pub prior_messages: Vec<ChatMessage>,
    /// Explicit engine override from the payload; a `/live`-style slash
    /// command in the content is merged in at handling time.
    pub force_engine_hint: Option<EngineKind>,
}

// ─── ChatHandler ──────────────────────────────────────────────────────────────

/// Everything the pipeline needs, injected at daemon construction.
pub struct ChatDeps {
    pub engines: Arc<EnginePool>,
    pub router: CognitiveRouter,
    pub registry: Arc<ToolRegistry>,
    pub approvals: Arc<ApprovalGate>,
    pub core_memory: Arc<CoreMemory>,
    pub archival: Arc<ArchivalMemory>,
    pub transcript: Arc<TranscriptLog>,
    pub state: StateHandle,
    /// `None` when the worker engine is disabled.
    pub heavy: Option<Arc<HeavyTaskQueue>>,
    pub broadcaster: Arc<dyn Broadcaster>,
    /// Present when an external transport is configured for the owner.
    pub owner_channel: Option<Arc<crate::channels::OwnerChannel>>,
    pub god_mode: bool,
    pub approval_timeout_ms: u64,
}

pub struct ChatHandler {
    deps: ChatDeps,
}

impl ChatHandler {
    pub fn new(deps: ChatDeps) -> Self {
        Self { deps }
    }

    /// Run one request to completion.  The caller has already serialised
    /// this onto the request's lane.
    #[tracing::instrument(
        name = "chat.handle",
        skip_all,
        fields(request_id = %request.request_id, client_id = %request.client_id)
    )]
    pub async fn handle(&self, request: Request) {
        let d = &self.deps;
        let role = SenderRole::from_client_id(&request.client_id);
        let (slash_hint, stripped) = parse_engine_hint(&request.content);
        let hint = request.force_engine_hint.or(slash_hint);
        let content = stripped.to_owned();

        d.state.transition(DaemonState::Thinking);
        d.transcript
            .message(EntryRole::User, &content, Some(&request.request_id));

        let worker_enabled = d.heavy.is_some() && d.engines.worker_enabled();
        let (decision, score) =
            d.router
                .route(&content, &request.prior_messages, role, hint, worker_enabled);
        tracing::debug!(score, ?decision, "request routed");

        match decision {
            RouteDecision::DelegateHeavy => self.delegate_heavy(&request, &content),
            RouteDecision::Engine(kind) => self.run_engine(&request, &content, role, kind).await,
        }

        d.state.transition(DaemonState::Idle);
    }

    // ── Heavy delegation ─────────────────────────────────────────────────

    fn delegate_heavy(&self, request: &Request, content: &str) {
        let d = &self.deps;
        let Some(heavy) = &d.heavy else {
            // route() only delegates when the queue exists.
            return;
        };

        // Completion surfaces as a proactive thought, and reaches the owner
        // channel when one is configured.
        let broadcaster = d.broadcaster.clone();
        let owner_channel = d.owner_channel.clone();
        let on_complete: crate::lanes::heavy::HeavyCallback = Box::new(move |result| {
            if let Ok(output) = result {
                let summary: String = output.chars().take(400).collect();
                broadcaster.broadcast(ServerMessage::proactive_thought(&summary));
                if let Some(owner) = owner_channel {
                    tokio::spawn(async move {
                        if let Err(e) = owner
                            .send_to_owner(&format!("Background analysis finished:\n{summary}"))
                            .await
                        {
                            tracing::warn!(error = %e, "owner notification failed");
                        }
                    });
                }
            }
        });

        let task_id = heavy.enqueue(
            "deep analysis",
            content,
            HeavyTaskType::DeepAnalysis,
            Some(on_complete),
        );

        d.broadcaster.broadcast(ServerMessage::log(
            "info",
            &format!("Delegated to Worker Engine (task {task_id})"),
        ));

        let ack = format!("delegated to Worker Engine, background task {task_id}");
        let model = d
            .engines
            .get(EngineKind::Worker)
            .map(|(desc, _)| desc.model.clone())
            .unwrap_or_default();
        d.broadcaster
            .broadcast(ServerMessage::stream_chunk(&request.request_id, &ack));
        d.broadcaster.broadcast(ServerMessage::stream_done(
            &request.request_id,
            "worker",
            &model,
            None,
            None,
        ));
        d.transcript
            .assistant_message(&ack, "worker", &model, Some(&request.request_id));
    }

    // ── Engine loop ──────────────────────────────────────────────────────

    async fn run_engine(
        &self,
        request: &Request,
        content: &str,
        role: SenderRole,
        kind: EngineKind,
    ) {
        let d = &self.deps;
        let Some((descriptor, adapter)) = d.engines.get(kind) else {
            self.fail(request, "unknown", &format!("{kind} engine is not configured"));
            return;
        };
        let descriptor = descriptor.clone();

        let user_content = self.with_auto_context(content).await;
        let system_prompt = self.system_prompt();

        let mut messages = request.prior_messages.clone();
        messages.push(ChatMessage::user(user_content));

        // Pre-flight token budget.  Compaction is recursive: keep folding
        // the oldest turns while the guard objects and progress is made.
        let max = context::max_tokens_for_model(&descriptor.model);
        let mut verdict = context::evaluate(&system_prompt, &messages, max);
        let mut rounds = 0;
        while matches!(verdict.action, GuardAction::Compact | GuardAction::Block) && rounds < 4 {
            rounds += 1;
            let before = messages.len();
            messages = self.compact(messages, max).await;
            verdict = context::evaluate(&system_prompt, &messages, max);
            if messages.len() == before {
                break;
            }
        }
        match verdict.action {
            GuardAction::Block => {
                self.fail(
                    request,
                    "context-overflow",
                    "context window exhausted even after compaction",
                );
                return;
            }
            GuardAction::Warn | GuardAction::Compact => {
                tracing::warn!(remaining = verdict.remaining, "context window is tight");
            }
            GuardAction::Proceed => {}
        }

        let tools = d.registry.effective_specs(role);
        let mut detector = LoopDetector::new();
        let mut compaction_retry_used = false;

        for _turn in 0..MAX_ENGINE_TURNS {
            let mut engine_messages = Vec::with_capacity(messages.len() + 1);
            engine_messages.push(ChatMessage::system(system_prompt.clone()));
            engine_messages.extend(messages.iter().cloned());

            let stream_result = adapter
                .stream(EngineRequest {
                    messages: engine_messages,
                    tools: tools.clone(),
                })
                .await;

            let mut turn_text = String::new();
            let mut tool_calls: Vec<(String, Value)> = Vec::new();
            let mut done_meta: Option<(String, String, Option<u32>, Option<u32>)> = None;
            let mut turn_error: Option<(EngineErrorKind, String)> = None;

            match stream_result {
                Ok(mut stream) => {
                    while let Some(event) = stream.next().await {
                        match event {
                            EngineEvent::Chunk { text } => {
                                turn_text.push_str(&text);
                                d.broadcaster.broadcast(ServerMessage::stream_chunk(
                                    &request.request_id,
                                    &text,
                                ));
                            }
                            EngineEvent::ToolCall { name, args, .. } => {
                                tool_calls.push((name, args));
                            }
                            EngineEvent::Done {
                                tier,
                                model,
                                tokens_in,
                                tokens_out,
                            } => {
                                done_meta = Some((tier, model, tokens_in, tokens_out));
                            }
                            EngineEvent::Error { kind, message } => {
                                turn_error = Some((kind, message));
                                break;
                            }
                        }
                    }
                }
                Err(e) => turn_error = Some((e.kind, e.message)),
            }

            if let Some((error_kind, message)) = turn_error {
                if error_kind == EngineErrorKind::ContextOverflow && !compaction_retry_used {
                    compaction_retry_used = true;
                    tracing::info!("context overflow reported; compacting and retrying once");
                    messages = self.compact(messages, max).await;
                    continue;
                }
                self.fail(request, &error_kind.to_string(), &message);
                return;
            }

            if tool_calls.is_empty() {
                let (tier, model, tokens_in, tokens_out) = done_meta.unwrap_or((
                    descriptor.kind.to_string(),
                    descriptor.model.clone(),
                    None,
                    None,
                ));
                d.transcript.assistant_message(
                    &turn_text,
                    &tier,
                    &model,
                    Some(&request.request_id),
                );
                d.broadcaster.broadcast(ServerMessage::stream_done(
                    &request.request_id,
                    &tier,
                    &model,
                    tokens_in,
                    tokens_out,
                ));
                return;
            }

            if !turn_text.is_empty() {
                messages.push(ChatMessage::assistant(turn_text.clone()));
            }
            for (name, args) in tool_calls {
                let result_message = self
                    .run_tool(request, role, &name, &args, &mut detector)
                    .await;
                messages.push(result_message);
            }
        }

        self.fail(request, "unknown", "maximum engine turns reached");
    }

    // ── Tool pipeline ────────────────────────────────────────────────────

    #[tracing::instrument(name = "chat.tool", skip_all, fields(tool = %name))]
    async fn run_tool(
        &self,
        request: &Request,
        role: SenderRole,
        name: &str,
        args: &Value,
        detector: &mut LoopDetector,
    ) -> ChatMessage {
        let d = &self.deps;
        d.broadcaster
            .broadcast(ServerMessage::tool_call(&request.request_id, name, args));
        d.state.transition(DaemonState::ExecutingTool);

        let started = Instant::now();
        let args_hash = hash_args(name, args);
        let mut warn_note: Option<String> = None;

        let result: ToolResult = 'exec: {
            // 1. Sender-role policy.
            if let PolicyDecision::Restricted(reason) = evaluate_tool_policy(name, role) {
                break 'exec ToolResult::err(reason);
            }

            // 2. Loop detection.
            match detector.check(name, &args_hash) {
                LoopVerdict::Abort(message) => break 'exec ToolResult::err(message),
                LoopVerdict::Warn(message) => warn_note = Some(message),
                LoopVerdict::Proceed => {}
            }

            let Some(tool) = d.registry.get(name) else {
                break 'exec ToolResult::err(format!("tool '{name}' is not registered"));
            };

            // 3. Approval gate.  God mode bypasses destructive approvals
            //    only; intrusive tools are always gated.
            let flags = tool.flags();
            let god_mode_bypass = d.god_mode && flags.destructive && !flags.intrusive;
            if flags.needs_approval() && !god_mode_bypass && !d.approvals.is_always_allowed(name)
            {
                let reason = if flags.intrusive {
                    ApprovalReason::Intrusive
                } else {
                    ApprovalReason::Destructive
                };
                let description = format!("Agent wants to run '{name}'");
                let record = d.approvals.create(
                    ApprovalRequest {
                        tool_name: name.to_owned(),
                        description: description.clone(),
                        reason,
                        args: args.clone(),
                    },
                    d.approval_timeout_ms,
                    None,
                    Some(request.client_id.clone()),
                );
                let approval_id = record.id.clone();
                let expires_at_ms = record.expires_at.timestamp_millis();
                d.approvals.register(record);

                let reason_str = match reason {
                    ApprovalReason::Destructive => "destructive",
                    ApprovalReason::Intrusive => "intrusive",
                };
                d.broadcaster.broadcast(ServerMessage::approval_request(
                    &approval_id,
                    name,
                    &description,
                    reason_str,
                    args,
                    expires_at_ms,
                ));

                d.state.transition(DaemonState::BlockedWaitingUser);
                let decision = d.approvals.await_decision(&approval_id).await;
                d.state.transition(DaemonState::ExecutingTool);
                d.broadcaster
                    .broadcast(ServerMessage::approval_resolved(&approval_id, decision));

                match decision {
                    Some(ApprovalDecision::AllowOnce) => {
                        if !d.approvals.consume_allow_once(&approval_id) {
                            break 'exec ToolResult::err("approval already consumed");
                        }
                    }
                    Some(ApprovalDecision::AllowAlways) => {}
                    Some(ApprovalDecision::Deny) | None => {
                        break 'exec ToolResult::err("user denied");
                    }
                }
            }

            // 4. Execute.
            let ctx = ToolContext {
                client_id: request.client_id.clone(),
                sender_role: role,
                broadcaster: d.broadcaster.clone(),
            };
            match tool.execute(args.clone(), &ctx).await {
                Ok(result) => result,
                Err(e) => ToolResult::err(e),
            }
        };

        // 5. Feed back.
        let duration_ms = started.elapsed().as_millis() as u64;
        detector.record(args_hash, Some(hash_result(&result.output)));
        d.transcript.tool_invocation(
            name,
            &result.output,
            result.success,
            duration_ms,
            Some(&request.request_id),
        );
        d.broadcaster.broadcast(ServerMessage::tool_result(
            &request.request_id,
            name,
            result.success,
            &result.output,
        ));
        d.state.transition(DaemonState::Thinking);

        let output = match warn_note {
            Some(note) => format!("[warning: {note}]\n{}", result.output),
            None => result.output.clone(),
        };
        ChatMessage::tool_result(name, &output, result.success)
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn system_prompt(&self) -> String {
        format!(
            "You are Vigil, a persistent local agent daemon. Use the available tools when they \
             help; keep answers concise.\n\n# Working Memory\n{}",
            self.deps.core_memory.read()
        )
    }

    /// Tier-1 auto-RAG: prepend cross-category retrieval to non-trivial
    /// messages.  Failures fall through with no retrieved context.
    async fn with_auto_context(&self, content: &str) -> String {
        if !wants_retrieval(content) {
            return content.to_owned();
        }
        match self
            .deps
            .archival
            .search_all_categories(content, AUTO_RAG_K)
            .await
        {
            Ok(hits) if !hits.is_empty() => {
                let block = hits
                    .iter()
                    .map(|h| format!("- [{}] {}", h.category, h.content))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("{AUTO_CONTEXT_HEADER}\n{block}\n\n{content}")
            }
            Ok(_) => content.to_owned(),
            Err(e) => {
                tracing::debug!(error = %e, "auto-RAG retrieval failed; continuing without");
                content.to_owned()
            }
        }
    }

    async fn compact(&self, messages: Vec<ChatMessage>, max: usize) -> Vec<ChatMessage> {
        // The live engine is the summariser of choice; fall back to whatever
        // engine exists.
        let adapter = self
            .deps
            .engines
            .get(EngineKind::Live)
            .or_else(|| self.deps.engines.get(EngineKind::Cloud))
            .map(|(_, a)| a);
        let Some(adapter) = adapter else {
            return messages;
        };
        let summarizer = EngineSummarizer { adapter };
        // The compactor's over-budget test must line up with the guard's
        // compact threshold, which fires 3 000 tokens before the window end.
        let budget = max.saturating_sub(3_000).max(1);
        Compactor::compact(messages, budget, &summarizer).await
    }

    fn fail(&self, request: &Request, kind: &str, message: &str) {
        tracing::warn!(%kind, %message, "request failed");
        self.deps
            .transcript
            .error(&format!("{kind}: {message}"), Some(&request.request_id));
        self.deps.broadcaster.broadcast(ServerMessage::chat_error(
            &request.request_id,
            kind,
            message,
        ));
    }
}

fn wants_retrieval(content: &str) -> bool {
    const GREETINGS: &[&str] = &["hi", "hello", "hey", "yo", "ok", "thanks", "thank you"];
    let trimmed = content.trim().to_lowercase();
    !trimmed.is_empty()
        && trimmed.chars().count() >= AUTO_RAG_MIN_CHARS
        && !GREETINGS.contains(&trimmed.as_str())
}

/// Summarises via a one-shot engine call, collecting streamed chunks.
struct EngineSummarizer {
    adapter: Arc<dyn EngineAdapter>,
}

#[async_trait]
impl Summarizer for EngineSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, String> {
        let mut stream = self
            .adapter
            .stream(EngineRequest {
                messages: vec![ChatMessage::user(text.to_owned())],
                tools: Vec::new(),
            })
            .await
            .map_err(|e| e.to_string())?;

        let mut collected = String::new();
        while let Some(event) = stream.next().await {
            match event {
                EngineEvent::Chunk { text } => collected.push_str(&text),
                EngineEvent::Error { message, .. } => return Err(message),
                _ => {}
            }
        }
        if collected.is_empty() {
            Err("summariser returned nothing".to_owned())
        } else {
            Ok(collected)
        }
    }
}
