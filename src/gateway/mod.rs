//! Client gateway: newline-delimited JSON over a local TCP socket.
//!
//! On connect, a client is minted a short monotonic id (`client-1`,
//! `client-2`, …).  Inbound frames are parsed into [`ClientMessage`]s and
//! forwarded to the daemon's ingress queue; outbound traffic flows through
//! the [`Broadcaster`] capability, which is all that other subsystems ever
//! hold — the gateway itself never reaches into them.
//!
//! Malformed frames are logged and dropped with the connection left open;
//! unknown message types likewise.  A disconnect does not cancel in-flight
//! work: pending events for that client are dropped at the socket.

pub mod protocol;

pub use protocol::{
    ChatRequestPayload, ClientMessage, FrameError, PriorMessage, ServerMessage, client_frame,
};

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
};

// ─── Broadcaster ──────────────────────────────────────────────────────────────

/// Outbound fan-out capability handed to the chat pipeline, heartbeat,
/// tools, and channels.
pub trait Broadcaster: Send + Sync {
    /// Write to every connected client; closed sockets are pruned.
    fn broadcast(&self, msg: ServerMessage);

    /// Address a single client; silently drops when absent.
    fn send_to(&self, client_id: &str, msg: ServerMessage);
}

/// A no-op broadcaster for tests and detached tool execution.
pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn broadcast(&self, _msg: ServerMessage) {}
    fn send_to(&self, _client_id: &str, _msg: ServerMessage) {}
}

// ─── Ingress ──────────────────────────────────────────────────────────────────

/// One parsed inbound message, tagged with the sender's client id.
#[derive(Debug)]
pub struct Inbound {
    pub client_id: String,
    pub message: ClientMessage,
}

// ─── Gateway ──────────────────────────────────────────────────────────────────

/// The socket server and client registry.
pub struct Gateway {
    clients: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    next_id: AtomicU64,
    ingress: mpsc::UnboundedSender<Inbound>,
}

impl Gateway {
    /// Create a gateway delivering parsed messages to `ingress`.
    pub fn new(ingress: mpsc::UnboundedSender<Inbound>) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            ingress,
        })
    }

    /// Number of currently connected clients.
    pub fn connected_count(&self) -> usize {
        self.lock_clients().len()
    }

    /// Accept connections until `shutdown` flips to `true`.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let client_id = format!(
                                "client-{}",
                                self.next_id.fetch_add(1, Ordering::SeqCst)
                            );
                            tracing::info!(%client_id, %addr, "client connected");
                            tokio::spawn(self.clone().handle_connection(
                                stream,
                                client_id,
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("gateway stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        client_id: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.lock_clients().insert(client_id.clone(), tx);

        // Writer task: drains the per-client queue onto the socket.
        let writer_id = client_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err()
                    || write_half.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
            tracing::debug!(client_id = %writer_id, "writer closed");
        });

        // Read loop: one JSON frame per line.
        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(raw)) => self.handle_frame(&client_id, &raw),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(%client_id, error = %e, "socket read failed");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.lock_clients().remove(&client_id);
        writer.abort();
        tracing::info!(%client_id, "client disconnected");
    }

    fn handle_frame(&self, client_id: &str, raw: &str) {
        if raw.trim().is_empty() {
            return;
        }
        match ClientMessage::parse(raw) {
            Ok(ClientMessage::Ping) => {
                self.send_to(client_id, ServerMessage::pong());
            }
            Ok(message) => {
                if self
                    .ingress
                    .send(Inbound {
                        client_id: client_id.to_owned(),
                        message,
                    })
                    .is_err()
                {
                    tracing::warn!("ingress queue closed; dropping frame");
                }
            }
            Err(FrameError::UnknownType(kind)) => {
                tracing::warn!(%client_id, %kind, "unknown message type dropped");
            }
            Err(FrameError::Malformed(e)) => {
                tracing::warn!(%client_id, error = %e, "malformed frame dropped");
            }
        }
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<String>>> {
        match self.clients.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Broadcaster for Gateway {
    fn broadcast(&self, msg: ServerMessage) {
        let line = msg.to_line();
        let mut clients = self.lock_clients();
        clients.retain(|_, tx| tx.send(line.clone()).is_ok());
    }

    fn send_to(&self, client_id: &str, msg: ServerMessage) {
        let mut clients = self.lock_clients();
        if let Some(tx) = clients.get(client_id)
            && tx.send(msg.to_line()).is_err()
        {
            clients.remove(client_id);
        }
    }
}
