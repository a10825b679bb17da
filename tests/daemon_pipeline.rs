//! End-to-end pipeline tests: a real daemon on a real socket, with scripted
//! engine adapters standing in for model backends.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
};

use vigil::{
    channels::{ExternalMessage, ExternalTransport},
    config::{self, DaemonConfig, EngineEntry},
    daemon::{Collaborators, Daemon},
    engine::{
        EngineAdapter, EngineDescriptor, EngineError, EngineEvent, EngineKind, EngineRequest,
        EngineStream,
    },
    gateway::client_frame,
};

// ─── Scripted adapter ─────────────────────────────────────────────────────────

struct ScriptedAdapter {
    turns: Mutex<VecDeque<Vec<EngineEvent>>>,
    seen: Mutex<Vec<EngineRequest>>,
    tier: String,
    model: String,
}

impl ScriptedAdapter {
    fn new(tier: &str, model: &str, turns: Vec<Vec<EngineEvent>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            seen: Mutex::new(Vec::new()),
            tier: tier.to_owned(),
            model: model.to_owned(),
        })
    }

    fn done(&self) -> EngineEvent {
        EngineEvent::Done {
            tier: self.tier.clone(),
            model: self.model.clone(),
            tokens_in: Some(12),
            tokens_out: Some(7),
        }
    }

    fn requests_seen(&self) -> Vec<EngineRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineAdapter for ScriptedAdapter {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: EngineRequest) -> Result<EngineStream, EngineError> {
        self.seen.lock().unwrap().push(request);
        let events = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                vec![
                    EngineEvent::Chunk {
                        text: "fallback reply".to_owned(),
                    },
                    self.done(),
                ]
            });
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

// ─── Fake external transport ──────────────────────────────────────────────────

struct FakeTransport {
    inject: Mutex<Option<mpsc::UnboundedReceiver<ExternalMessage>>>,
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeTransport {
    fn new() -> (Arc<Self>, mpsc::UnboundedSender<ExternalMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inject: Mutex::new(Some(rx)),
                sent: Arc::new(Mutex::new(Vec::new())),
            }),
            tx,
        )
    }
}

#[async_trait]
impl ExternalTransport for FakeTransport {
    fn name(&self) -> &str {
        "faketext"
    }

    async fn send(&self, recipient: &str, text: &str) -> Result<(), String> {
        self.sent
            .lock()
            .map_err(|_| "poisoned".to_owned())?
            .push((recipient.to_owned(), text.to_owned()));
        Ok(())
    }

    async fn listen(&self, tx: mpsc::Sender<ExternalMessage>) -> Result<(), String> {
        let Some(mut rx) = self.inject.lock().map_err(|_| "poisoned")?.take() else {
            return Err("listen called twice".to_owned());
        };
        while let Some(message) = rx.recv().await {
            if tx.send(message).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

// ─── Harness ──────────────────────────────────────────────────────────────────

fn write_config(dir: &Path, owner: Option<&str>, worker: bool) {
    let mut cfg = DaemonConfig::default();
    cfg.gateway_port = 0; // let the OS pick
    cfg.owner_identity = owner.map(str::to_owned);
    cfg.engines.live = EngineEntry {
        provider: "scripted".to_owned(),
        model: "live-model".to_owned(),
        ..EngineEntry::default()
    };
    cfg.engines.cloud = EngineEntry {
        provider: "scripted".to_owned(),
        model: "cloud-model".to_owned(),
        ..EngineEntry::default()
    };
    if worker {
        cfg.engines.worker = EngineEntry {
            provider: "scripted".to_owned(),
            model: "worker-model".to_owned(),
            ..EngineEntry::default()
        };
    }
    config::save_config(&dir.join("config.json"), &cfg).unwrap();
}

struct Adapters {
    live: Arc<ScriptedAdapter>,
    worker: Arc<ScriptedAdapter>,
    cloud: Arc<ScriptedAdapter>,
}

fn collaborators(adapters: &Adapters, transport: Option<Arc<FakeTransport>>) -> Collaborators {
    let live = adapters.live.clone();
    let worker = adapters.worker.clone();
    let cloud = adapters.cloud.clone();
    Collaborators {
        adapter_factory: Box::new(move |descriptor: &EngineDescriptor| {
            Ok(match descriptor.kind {
                EngineKind::Live => live.clone() as Arc<dyn EngineAdapter>,
                EngineKind::Worker => worker.clone() as Arc<dyn EngineAdapter>,
                EngineKind::Cloud => cloud.clone() as Arc<dyn EngineAdapter>,
            })
        }),
        embedder: None,
        transport: transport.map(|t| t as Arc<dyn ExternalTransport>),
        forge: None,
    }
}

struct TestClient {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send(&mut self, kind: &str, payload: Value) {
        let frame = client_frame(kind, payload);
        self.writer.write_all(frame.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Next frame of the given type, skipping heartbeats and anything else.
    async fn wait_for(&mut self, kind: &str) -> Value {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let line = self.lines.next_line().await.unwrap().expect("socket closed");
                let v: Value = serde_json::from_str(&line).unwrap();
                if v["type"] == kind {
                    return v;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for '{kind}'"))
    }

    /// Collect frames until one of `kind` arrives; returns everything seen.
    async fn collect_until(&mut self, kind: &str) -> Vec<Value> {
        tokio::time::timeout(Duration::from_secs(10), async {
            let mut seen = Vec::new();
            loop {
                let line = self.lines.next_line().await.unwrap().expect("socket closed");
                let v: Value = serde_json::from_str(&line).unwrap();
                let hit = v["type"] == kind;
                seen.push(v);
                if hit {
                    return seen;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out collecting until '{kind}'"))
    }
}

fn transcript_entries(dir: &Path) -> Vec<Value> {
    let transcripts = dir.join("transcripts");
    let mut entries = Vec::new();
    for file in std::fs::read_dir(transcripts).unwrap() {
        let content = std::fs::read_to_string(file.unwrap().path()).unwrap();
        for line in content.lines() {
            entries.push(serde_json::from_str(line).unwrap());
        }
    }
    entries
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn trivial_chat_streams_on_the_live_engine() {
    let dir = tempfile::TempDir::new().unwrap();
    write_config(dir.path(), None, false);

    let adapters = Adapters {
        live: ScriptedAdapter::new(
            "live",
            "live-model",
            vec![vec![
                EngineEvent::Chunk {
                    text: "hello!".to_owned(),
                },
                EngineEvent::Done {
                    tier: "live".to_owned(),
                    model: "live-model".to_owned(),
                    tokens_in: None,
                    tokens_out: None,
                },
            ]],
        ),
        worker: ScriptedAdapter::new("worker", "worker-model", vec![]),
        cloud: ScriptedAdapter::new("cloud", "cloud-model", vec![]),
    };

    let vault = vigil::vault::Vault::open(dir.path()).unwrap();
    let daemon = Daemon::start(vault, collaborators(&adapters, None))
        .await
        .unwrap();

    let mut client = TestClient::connect(daemon.port).await;
    client
        .send("chat:request", json!({ "content": "hi", "requestId": "r1" }))
        .await;

    let seen = client.collect_until("chat:stream:done").await;
    let chunks: Vec<&Value> = seen
        .iter()
        .filter(|v| v["type"] == "chat:stream:chunk")
        .collect();
    assert!(!chunks.is_empty());
    assert!(
        !seen.iter().any(|v| v["type"] == "chat:tool:call"),
        "trivial chat must not call tools"
    );

    let done = seen.last().unwrap();
    assert_eq!(done["payload"]["tier"], "live");
    assert_eq!(done["payload"]["model"], "live-model");

    daemon.shutdown().await;

    // Transcript: user "hi" then the assistant reply.
    let messages: Vec<Value> = transcript_entries(dir.path())
        .into_iter()
        .filter(|e| e["type"] == "message")
        .collect();
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "hi");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "hello!");
}

#[tokio::test]
async fn heavy_request_is_delegated_to_the_worker() {
    let dir = tempfile::TempDir::new().unwrap();
    write_config(dir.path(), None, true);

    let adapters = Adapters {
        live: ScriptedAdapter::new("live", "live-model", vec![]),
        worker: ScriptedAdapter::new(
            "worker",
            "worker-model",
            vec![vec![
                EngineEvent::Chunk {
                    text: "the root cause is a null frame pointer".to_owned(),
                },
                EngineEvent::Done {
                    tier: "worker".to_owned(),
                    model: "worker-model".to_owned(),
                    tokens_in: None,
                    tokens_out: None,
                },
            ]],
        ),
        cloud: ScriptedAdapter::new("cloud", "cloud-model", vec![]),
    };

    let vault = vigil::vault::Vault::open(dir.path()).unwrap();
    let daemon = Daemon::start(vault, collaborators(&adapters, None))
        .await
        .unwrap();

    let mut client = TestClient::connect(daemon.port).await;
    let trace = format!(
        "analyse this stack trace:\n{}",
        "at frame::step (interp.rs:42)\n".repeat(70)
    );
    assert!(trace.len() >= 2_000);
    client
        .send("chat:request", json!({ "content": trace, "requestId": "r1" }))
        .await;

    // The ack stream finishes immediately...
    let seen = client.collect_until("chat:stream:done").await;
    let log = seen
        .iter()
        .find(|v| v["type"] == "log")
        .expect("expected a delegation log broadcast");
    assert!(
        log["payload"]["message"]
            .as_str()
            .unwrap()
            .contains("Delegated to Worker Engine")
    );
    let chunk = seen
        .iter()
        .find(|v| v["type"] == "chat:stream:chunk")
        .unwrap();
    assert!(
        chunk["payload"]["text"]
            .as_str()
            .unwrap()
            .contains("background task")
    );

    // ...and the background completion arrives out of band.
    let completed = client.wait_for("worker_task_completed").await;
    assert_eq!(completed["payload"]["taskType"], "deep_analysis");
    assert!(
        completed["payload"]["summary"]
            .as_str()
            .unwrap()
            .contains("null frame pointer")
    );

    daemon.shutdown().await;
}

#[tokio::test]
async fn destructive_tool_waits_for_approval_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    write_config(dir.path(), None, false);

    let live = ScriptedAdapter::new("live", "live-model", vec![]);
    let adapters = Adapters {
        live: live.clone(),
        worker: ScriptedAdapter::new("worker", "worker-model", vec![]),
        cloud: ScriptedAdapter::new(
            "cloud",
            "cloud-model",
            vec![
                vec![EngineEvent::ToolCall {
                    id: "t1".to_owned(),
                    name: "execute_shell_command".to_owned(),
                    args: json!({ "command": "echo approved-run" }),
                }],
                vec![
                    EngineEvent::Chunk {
                        text: "command executed".to_owned(),
                    },
                    EngineEvent::Done {
                        tier: "cloud".to_owned(),
                        model: "cloud-model".to_owned(),
                        tokens_in: None,
                        tokens_out: None,
                    },
                ],
            ],
        ),
    };

    let vault = vigil::vault::Vault::open(dir.path()).unwrap();
    let daemon = Daemon::start(vault, collaborators(&adapters, None))
        .await
        .unwrap();

    let mut client = TestClient::connect(daemon.port).await;
    // Mid-band content so the router picks the cloud engine.
    client
        .send(
            "chat:request",
            json!({ "content": "fix the build by running the echo in src/build.rs", "requestId": "r1" }),
        )
        .await;

    let approval = client.wait_for("approval:request").await;
    assert_eq!(approval["payload"]["reason"], "destructive");
    assert_eq!(approval["payload"]["toolName"], "execute_shell_command");
    let approval_id = approval["payload"]["approvalId"].as_str().unwrap().to_owned();

    client
        .send(
            "approval:response",
            json!({ "approvalId": approval_id, "decision": "allow-once" }),
        )
        .await;

    let seen = client.collect_until("chat:stream:done").await;
    let result = seen
        .iter()
        .find(|v| v["type"] == "chat:tool:result")
        .expect("tool result expected");
    assert_eq!(result["payload"]["success"], true);
    assert!(
        result["payload"]["output"]
            .as_str()
            .unwrap()
            .contains("approved-run")
    );

    daemon.shutdown().await;
}

#[tokio::test]
async fn owner_firewall_drops_strangers_silently() {
    let dir = tempfile::TempDir::new().unwrap();
    write_config(dir.path(), Some("+15551234567"), false);

    let adapters = Adapters {
        live: ScriptedAdapter::new(
            "live",
            "live-model",
            vec![vec![
                EngineEvent::Chunk {
                    text: "hello owner".to_owned(),
                },
                EngineEvent::Done {
                    tier: "live".to_owned(),
                    model: "live-model".to_owned(),
                    tokens_in: None,
                    tokens_out: None,
                },
            ]],
        ),
        worker: ScriptedAdapter::new("worker", "worker-model", vec![]),
        cloud: ScriptedAdapter::new("cloud", "cloud-model", vec![]),
    };

    let (transport, inject) = FakeTransport::new();
    let sent = transport.sent.clone();

    let vault = vigil::vault::Vault::open(dir.path()).unwrap();
    let daemon = Daemon::start(vault, collaborators(&adapters, Some(transport)))
        .await
        .unwrap();

    let mut observer = TestClient::connect(daemon.port).await;
    // The observer is passive; make sure its socket is registered before
    // any broadcast it needs to see.
    observer.wait_for("heartbeat").await;

    // A stranger knocks: nothing may happen.
    inject
        .send(ExternalMessage {
            from: "+0000000000".to_owned(),
            to: None,
            body: "open up".to_owned(),
        })
        .unwrap();

    // Then the owner speaks and the pipeline runs.
    inject
        .send(ExternalMessage {
            from: "+15551234567".to_owned(),
            to: None,
            body: "hi".to_owned(),
        })
        .unwrap();

    let seen = observer.collect_until("chat:stream:done").await;
    assert!(seen.iter().any(|v| v["type"] == "chat:stream:chunk"));

    daemon.shutdown().await;

    // The stranger's message left no trace: no transcript entry, no outbound.
    let entries = transcript_entries(dir.path());
    assert!(
        entries
            .iter()
            .all(|e| !e["content"].as_str().unwrap_or_default().contains("open up"))
    );
    assert!(sent.lock().unwrap().is_empty(), "send_to_owner must not fire");

    // Only the owner's message was transcribed.
    assert!(
        entries
            .iter()
            .any(|e| e["type"] == "message" && e["content"] == "hi")
    );
}

#[tokio::test]
async fn oversized_history_is_compacted_before_the_engine_runs() {
    let dir = tempfile::TempDir::new().unwrap();
    write_config(dir.path(), None, false);

    // qwen2.5 has a 32 768-token window; ~280 turns × 400 chars overruns it.
    let mut cfg: DaemonConfig =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("config.json")).unwrap())
            .unwrap();
    cfg.engines.live.model = "qwen2.5-7b".to_owned();
    config::save_config(&dir.path().join("config.json"), &cfg).unwrap();

    let live = ScriptedAdapter::new(
        "live",
        "qwen2.5-7b",
        vec![
            // First call: the compactor's summariser.
            vec![
                EngineEvent::Chunk {
                    text: "earlier: argued about schemas; decided on postgres".to_owned(),
                },
                EngineEvent::Done {
                    tier: "live".to_owned(),
                    model: "qwen2.5-7b".to_owned(),
                    tokens_in: None,
                    tokens_out: None,
                },
            ],
            // Second call: the actual turn.
            vec![
                EngineEvent::Chunk {
                    text: "continuing from the summary".to_owned(),
                },
                EngineEvent::Done {
                    tier: "live".to_owned(),
                    model: "qwen2.5-7b".to_owned(),
                    tokens_in: None,
                    tokens_out: None,
                },
            ],
        ],
    );
    let adapters = Adapters {
        live: live.clone(),
        worker: ScriptedAdapter::new("worker", "worker-model", vec![]),
        cloud: ScriptedAdapter::new("cloud", "cloud-model", vec![]),
    };

    let vault = vigil::vault::Vault::open(dir.path()).unwrap();
    let daemon = Daemon::start(vault, collaborators(&adapters, None))
        .await
        .unwrap();

    let prior: Vec<Value> = (0..280)
        .map(|i| json!({ "role": "user", "content": format!("turn {i}: {}", "x".repeat(400)) }))
        .collect();

    let mut client = TestClient::connect(daemon.port).await;
    client
        .send(
            "chat:request",
            json!({ "content": "hello again", "requestId": "r1", "priorMessages": prior }),
        )
        .await;

    let seen = client.collect_until("chat:stream:done").await;
    assert!(
        !seen.iter().any(|v| v["type"] == "chat:error"),
        "compaction should have made the request fit"
    );

    // Two adapter calls: summariser + one real turn carrying the summary.
    let requests = live.requests_seen();
    assert_eq!(requests.len(), 2);
    let final_request = &requests[1];
    assert!(final_request.messages.len() < 280);
    assert!(
        final_request
            .messages
            .iter()
            .any(|m| m.content.starts_with("[CONVERSATION HISTORY SUMMARY]")),
        "the folded history must appear as a summary message"
    );

    daemon.shutdown().await;
}

#[tokio::test]
async fn lane_serialises_two_requests_from_one_client() {
    let dir = tempfile::TempDir::new().unwrap();
    write_config(dir.path(), None, false);

    let adapters = Adapters {
        live: ScriptedAdapter::new(
            "live",
            "live-model",
            vec![
                vec![
                    EngineEvent::Chunk {
                        text: "first answer".to_owned(),
                    },
                    EngineEvent::Done {
                        tier: "live".to_owned(),
                        model: "live-model".to_owned(),
                        tokens_in: None,
                        tokens_out: None,
                    },
                ],
                vec![
                    EngineEvent::Chunk {
                        text: "second answer".to_owned(),
                    },
                    EngineEvent::Done {
                        tier: "live".to_owned(),
                        model: "live-model".to_owned(),
                        tokens_in: None,
                        tokens_out: None,
                    },
                ],
            ],
        ),
        worker: ScriptedAdapter::new("worker", "worker-model", vec![]),
        cloud: ScriptedAdapter::new("cloud", "cloud-model", vec![]),
    };

    let vault = vigil::vault::Vault::open(dir.path()).unwrap();
    let daemon = Daemon::start(vault, collaborators(&adapters, None))
        .await
        .unwrap();

    let mut client = TestClient::connect(daemon.port).await;
    client
        .send("chat:request", json!({ "content": "one", "requestId": "rA" }))
        .await;
    client
        .send("chat:request", json!({ "content": "two", "requestId": "rB" }))
        .await;

    // rA's final event precedes any of rB's events.
    let seen = {
        let mut all = client.collect_until("chat:stream:done").await;
        if all
            .last()
            .map(|v| v["payload"]["requestId"] == "rA")
            .unwrap_or(false)
        {
            all.extend(client.collect_until("chat:stream:done").await);
        }
        all
    };

    let first_b_index = seen
        .iter()
        .position(|v| {
            v["type"].as_str().unwrap_or_default().starts_with("chat:")
                && v["payload"]["requestId"] == "rB"
        })
        .expect("rB events expected");
    let a_done_index = seen
        .iter()
        .position(|v| v["type"] == "chat:stream:done" && v["payload"]["requestId"] == "rA")
        .expect("rA done expected");
    assert!(
        a_done_index < first_b_index,
        "rA must fully finish before rB starts (a_done={a_done_index}, b_first={first_b_index})"
    );

    daemon.shutdown().await;
}
