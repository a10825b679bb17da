//! Daemon assembly and lifecycle.
//!
//! Every component is a value constructed here and handed to its consumers —
//! no global accessors.  The single-instance invariant is enforced by
//! `daemon.pid` on disk, not by singletons in code.

use std::{sync::Arc, time::Duration};

use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};

use crate::{
    channels::{ExternalTransport, OwnerChannel, SendOwnerMessageTool},
    chat::{ChatDeps, ChatHandler, Request},
    config::EngineEntry,
    engine::{
        AdapterFactory, ChatMessage, EngineAdapter, EngineDescriptor, EngineKind, EnginePool,
        EngineRequest, EngineEvent,
    },
    gateway::{Broadcaster, ClientMessage, Gateway, Inbound, ServerMessage},
    heartbeat::{self, SnapshotSources, StateHandle},
    lanes::{HeavyRunner, HeavyTask, HeavyTaskQueue, LaneError, LaneScheduler, lane_for},
    memory::{ArchivalMemory, CoreMemory, EmbeddingProvider, HashEmbeddingProvider, LruEmbeddingCache},
    router::CognitiveRouter,
    scheduler::Scheduler,
    tools::{
        ApprovalGate, CreateAndRunTool, ForgeRunner, ForgeStore, SenderRole, ToolRegistry,
        DEFAULT_APPROVAL_TIMEOUT_MS,
        forge::register_forged_tools,
        memory_tools::{
            CoreMemoryAppendTool, CoreMemoryReplaceTool, ForgetMemoryTool, MemorizeTool,
            SearchAllCategoriesTool, SearchMemoryTool,
        },
        shell::ExecuteShellCommandTool,
    },
    transcript::TranscriptLog,
    vault::Vault,
};

const EMBEDDING_CACHE_SIZE: usize = 4_096;
const LANE_WARN_AFTER: Duration = Duration::from_secs(15);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Collaborators ────────────────────────────────────────────────────────────

/// Factory for engine adapters, resolving a descriptor to a concrete
/// provider implementation.
pub type AdapterFactoryFn =
    Box<dyn Fn(&EngineDescriptor) -> Result<Arc<dyn EngineAdapter>, String> + Send + Sync>;

/// External collaborators the core consumes via traits.  All optional; the
/// daemon runs degraded without them.
pub struct Collaborators {
    pub adapter_factory: AdapterFactoryFn,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub transport: Option<Arc<dyn ExternalTransport>>,
    pub forge: Option<Arc<dyn ForgeRunner>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            adapter_factory: Box::new(|descriptor| AdapterFactory::create(descriptor)),
            embedder: None,
            transport: None,
            forge: None,
        }
    }
}

// ─── Worker-engine heavy runner ───────────────────────────────────────────────

/// Runs heavy tasks by streaming the worker engine to completion.
struct WorkerEngineRunner {
    adapter: Arc<dyn EngineAdapter>,
}

#[async_trait::async_trait]
impl HeavyRunner for WorkerEngineRunner {
    async fn run(&self, task: &HeavyTask) -> Result<String, String> {
        use futures::StreamExt;
        let mut stream = self
            .adapter
            .stream(EngineRequest {
                messages: vec![ChatMessage::user(task.prompt.clone())],
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
        Ok(collected)
    }
}

// ─── Daemon ───────────────────────────────────────────────────────────────────

pub struct Daemon {
    pub port: u16,
    vault: Arc<Vault>,
    shutdown_tx: watch::Sender<bool>,
    heavy: Option<Arc<HeavyTaskQueue>>,
}

impl Daemon {
    /// Construct every subsystem, bind the gateway, and start the background
    /// loops.  Returns once the daemon is serving.
    pub async fn start(vault: Vault, collaborators: Collaborators) -> Result<Self, String> {
        vault.claim_pid().map_err(|e| e.to_string())?;
        let vault = Arc::new(vault);
        let config = vault.config().clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel::<Inbound>();

        // ── Gateway ──────────────────────────────────────────────────────
        let gateway = Gateway::new(ingress_tx.clone());
        let listener = TcpListener::bind(("127.0.0.1", config.gateway_port))
            .await
            .map_err(|e| format!("gateway bind on {}: {e}", config.gateway_port))?;
        let port = listener
            .local_addr()
            .map_err(|e| e.to_string())?
            .port();
        tokio::spawn(gateway.clone().serve(listener, shutdown_rx.clone()));
        tracing::info!(port, "gateway listening");

        // ── Memory ───────────────────────────────────────────────────────
        let embedder: Arc<dyn EmbeddingProvider> = collaborators.embedder.unwrap_or_else(|| {
            Arc::new(LruEmbeddingCache::new(
                HashEmbeddingProvider::new(),
                EMBEDDING_CACHE_SIZE,
            ))
        });
        let archival = Arc::new(ArchivalMemory::open(
            vault.memory_dir().join("archive.db"),
            vault.cognitive_map_path(),
            embedder,
        )?);
        let core_memory =
            Arc::new(CoreMemory::open(vault.core_memory_path()).map_err(|e| e.to_string())?);

        // ── Transcript ───────────────────────────────────────────────────
        let transcript = Arc::new(TranscriptLog::open(&vault.transcripts_dir())?);
        transcript.session_meta(&format!(
            "session open; pid={} version={} live={} worker={} cloud={}",
            std::process::id(),
            env!("CARGO_PKG_VERSION"),
            engine_summary(&config.engines.live),
            engine_summary(&config.engines.worker),
            engine_summary(&config.engines.cloud),
        ));

        // ── Engines ──────────────────────────────────────────────────────
        let mut engines = EnginePool::new();
        for kind in EnginePool::configured_kinds(&config.engines) {
            let entry = match kind {
                EngineKind::Live => &config.engines.live,
                EngineKind::Worker => &config.engines.worker,
                EngineKind::Cloud => &config.engines.cloud,
            };
            let credential = match &entry.credential_ref {
                Some(reference) => vault.credential(reference).map_err(|e| e.to_string())?,
                None => None,
            };
            let descriptor = EngineDescriptor::from_entry(kind, entry, credential);
            match (collaborators.adapter_factory)(&descriptor) {
                Ok(adapter) => engines.register(descriptor, adapter),
                Err(e) => {
                    tracing::warn!(%kind, error = %e, "engine adapter unavailable");
                }
            }
        }
        let engines = Arc::new(engines);

        // ── Tool system ──────────────────────────────────────────────────
        let approvals = Arc::new(ApprovalGate::new());
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(ExecuteShellCommandTool));
        registry.register(Arc::new(MemorizeTool::new(archival.clone())));
        registry.register(Arc::new(SearchMemoryTool::new(archival.clone())));
        registry.register(Arc::new(SearchAllCategoriesTool::new(archival.clone())));
        registry.register(Arc::new(ForgetMemoryTool::new(archival.clone())));
        registry.register(Arc::new(CoreMemoryReplaceTool::new(core_memory.clone())));

        // ── Heavy queue (worker engine) ──────────────────────────────────
        let heavy = engines.get(EngineKind::Worker).map(|(_, adapter)| {
            HeavyTaskQueue::new(
                crate::lanes::heavy::DEFAULT_CONCURRENCY,
                Arc::new(WorkerEngineRunner { adapter }),
                gateway.clone() as Arc<dyn Broadcaster>,
            )
        });

        // Core-memory appends distil through the worker when available.
        let append_tool = match &heavy {
            Some(queue) => {
                CoreMemoryAppendTool::new(core_memory.clone()).with_distillation(queue.clone())
            }
            None => CoreMemoryAppendTool::new(core_memory.clone()),
        };
        registry.register(Arc::new(append_tool));

        // ── Forge ────────────────────────────────────────────────────────
        if let Some(forge) = &collaborators.forge {
            let store = Arc::new(ForgeStore::open(vault.tools_registry_path())?);
            let restored = register_forged_tools(&store, forge.clone(), &registry);
            if restored > 0 {
                tracing::info!(restored, "forged tools re-registered");
            }
            registry.register(Arc::new(CreateAndRunTool::new(
                forge.clone(),
                store,
                Arc::downgrade(&registry),
            )));
        }

        // ── Owner channel ────────────────────────────────────────────────
        let owner_channel = collaborators.transport.as_ref().and_then(|transport| {
            OwnerChannel::new(config.owner_identity.as_deref(), transport.clone())
        });
        if let Some(channel) = &owner_channel {
            registry.register(Arc::new(SendOwnerMessageTool::new(channel.clone())));
            tokio::spawn(channel.clone().run(ingress_tx.clone(), shutdown_rx.clone()));
        }

        // ── State + heartbeat ────────────────────────────────────────────
        let state = StateHandle::new();
        let lanes = LaneScheduler::new();
        let sources = SnapshotSources {
            active_tasks: {
                let heavy = heavy.clone();
                Arc::new(move || heavy.as_ref().map(|h| h.running_count()).unwrap_or(0))
            },
            pending_tasks: {
                let heavy = heavy.clone();
                Arc::new(move || heavy.as_ref().map(|h| h.queued_count()).unwrap_or(0))
            },
            awaiting_approval: {
                let approvals = approvals.clone();
                Arc::new(move || approvals.pending_count())
            },
            connected_clients: {
                let gateway = gateway.clone();
                Arc::new(move || gateway.connected_count())
            },
        };
        tokio::spawn(heartbeat::run(
            state.clone(),
            sources,
            gateway.clone() as Arc<dyn Broadcaster>,
            port,
            shutdown_rx.clone(),
        ));

        // ── Scheduler ────────────────────────────────────────────────────
        let scheduler = Scheduler::load(&vault.alerts_path());
        if scheduler.job_count() > 0 {
            tracing::info!(jobs = scheduler.job_count(), "scheduler armed");
        }
        tokio::spawn(scheduler.run(ingress_tx.clone(), shutdown_rx.clone()));

        // ── Chat pipeline + dispatch loop ────────────────────────────────
        let default_engine = config
            .default_engine
            .parse::<EngineKind>()
            .unwrap_or(EngineKind::Live);
        let handler = Arc::new(ChatHandler::new(ChatDeps {
            engines,
            router: CognitiveRouter::new(default_engine),
            registry,
            approvals: approvals.clone(),
            core_memory,
            archival: archival.clone(),
            transcript,
            state: state.clone(),
            heavy: heavy.clone(),
            broadcaster: gateway.clone(),
            owner_channel,
            god_mode: config.god_mode,
            approval_timeout_ms: DEFAULT_APPROVAL_TIMEOUT_MS,
        }));

        tokio::spawn(dispatch_loop(
            ingress_rx,
            handler,
            lanes,
            approvals,
            archival,
            state,
            gateway,
            shutdown_rx,
        ));

        Ok(Self {
            port,
            vault,
            shutdown_tx,
            heavy,
        })
    }

    /// Graceful shutdown: stop accepting, drain the heavy queue (no
    /// retries), release the pid file.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        let _ = self.shutdown_tx.send(true);

        if let Some(heavy) = &self.heavy {
            let drain_until = tokio::time::Instant::now() + DRAIN_TIMEOUT;
            while (heavy.queued_count() > 0 || heavy.running_count() > 0)
                && tokio::time::Instant::now() < drain_until
            {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        self.vault.release_pid();
        tracing::info!("daemon stopped");
    }
}

fn engine_summary(entry: &EngineEntry) -> String {
    if entry.is_configured() {
        format!("{}/{}", entry.provider, entry.model)
    } else {
        "unset".to_owned()
    }
}

// ─── Dispatch loop ────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn dispatch_loop(
    mut ingress: mpsc::UnboundedReceiver<Inbound>,
    handler: Arc<ChatHandler>,
    lanes: Arc<LaneScheduler>,
    approvals: Arc<ApprovalGate>,
    archival: Arc<ArchivalMemory>,
    state: StateHandle,
    gateway: Arc<Gateway>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut request_counter: u64 = 0;
    loop {
        tokio::select! {
            inbound = ingress.recv() => {
                let Some(Inbound { client_id, message }) = inbound else { break };
                match message {
                    ClientMessage::ChatRequest(payload) => {
                        request_counter += 1;
                        let request_id = payload
                            .request_id
                            .unwrap_or_else(|| format!("req-{request_counter}"));
                        let prior_messages = payload
                            .prior_messages
                            .unwrap_or_default()
                            .into_iter()
                            .map(|m| match m.role.as_str() {
                                "assistant" => ChatMessage::assistant(m.content),
                                "system" => ChatMessage::system(m.content),
                                _ => ChatMessage::user(m.content),
                            })
                            .collect();
                        let force_engine_hint = payload
                            .force_engine_hint
                            .as_deref()
                            .and_then(|s| s.parse::<EngineKind>().ok());
                        let request = Request {
                            request_id: request_id.clone(),
                            client_id: client_id.clone(),
                            content: payload.content,
                            prior_messages,
                            force_engine_hint,
                        };

                        let role = SenderRole::from_client_id(&client_id);
                        let lane = lane_for(&client_id, role);
                        let handler = handler.clone();
                        // Submission is synchronous so arrival order is lane
                        // order; completion is not awaited here.
                        match lanes.submit_request(
                            &lane,
                            &request_id,
                            Some(LANE_WARN_AFTER),
                            async move {
                                handler.handle(request).await;
                            },
                        ) {
                            Ok(_done) => {}
                            Err(LaneError::DuplicateRequest(id)) => {
                                gateway.broadcast(ServerMessage::chat_error(
                                    &id,
                                    "unknown",
                                    "request id is already queued or running",
                                ));
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "lane submission failed");
                            }
                        }
                    }
                    ClientMessage::ApprovalResponse(payload) => {
                        if !approvals.resolve(&payload.approval_id, payload.decision, &client_id) {
                            tracing::warn!(
                                approval_id = %payload.approval_id,
                                "approval response for unknown or settled record"
                            );
                        }
                    }
                    ClientMessage::SystemCommand(payload) => {
                        handle_system_command(
                            &payload.command,
                            &client_id,
                            &archival,
                            &state,
                            &gateway,
                        );
                    }
                    ClientMessage::Ping => {}
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("dispatch loop stopped");
}

fn handle_system_command(
    command: &str,
    client_id: &str,
    archival: &Arc<ArchivalMemory>,
    state: &StateHandle,
    gateway: &Arc<Gateway>,
) {
    match command {
        "status" => {
            let payload = serde_json::json!({
                "state": state.current(),
                "pid": std::process::id(),
                "categories": archival.cognitive_map().len(),
            });
            gateway.send_to(client_id, ServerMessage::system_status(payload));
        }
        "memory_stats" => {
            let map = archival.cognitive_map();
            let total: usize = map.iter().map(|e| e.memory_count).sum();
            let payload = serde_json::json!({
                "categories": map,
                "total": total,
            });
            gateway.send_to(client_id, ServerMessage::system_status(payload));
        }
        other => {
            gateway.send_to(
                client_id,
                ServerMessage::system_alert(&format!("unknown system command '{other}'")),
            );
        }
    }
}
