//! External channel adapters, gated by the owner firewall.
//!
//! A transport (an IM bridge, a phone-number gateway) is an external
//! collaborator implementing [`ExternalTransport`].  The daemon never talks
//! to a transport directly: everything goes through [`OwnerChannel`], which
//! enforces the firewall invariants —
//!
//! - the channel refuses to start when no owner identity is configured
//!   (silent inhibit, no user-visible error);
//! - inbound messages whose `from` is not the owner identity are dropped
//!   before any routing, transcription, or logging of their content;
//! - outbound traffic has exactly one function, [`OwnerChannel::send_to_owner`],
//!   with no destination parameter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::gateway::{ChatRequestPayload, ClientMessage, Inbound};

// ─── ExternalTransport ────────────────────────────────────────────────────────

/// A message received from the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalMessage {
    /// Sender identity as the transport knows it (phone number, user id).
    pub from: String,
    /// Destination identity, when the transport carries one.  The firewall
    /// ignores it.
    #[serde(default)]
    pub to: Option<String>,
    pub body: String,
}

/// Transport abstraction.  Implementations live outside the core; the
/// recipient parameter exists so one transport type can serve any identity —
/// only [`OwnerChannel`] ever supplies it.
#[async_trait]
pub trait ExternalTransport: Send + Sync {
    /// Transport name (`"signal"`, `"whatsapp"`, …), used for the
    /// pseudo-client id.
    fn name(&self) -> &str;

    /// Deliver `text` to `recipient`.
    async fn send(&self, recipient: &str, text: &str) -> Result<(), String>;

    /// Run the inbound loop, forwarding messages on `tx` until the channel
    /// disconnects or `tx` is dropped.
    async fn listen(&self, tx: mpsc::Sender<ExternalMessage>) -> Result<(), String>;
}

// ─── OwnerChannel ─────────────────────────────────────────────────────────────

/// The single-identity firewall around an external transport.
pub struct OwnerChannel {
    owner_identity: String,
    transport: Arc<dyn ExternalTransport>,
    client_id: String,
}

impl OwnerChannel {
    /// Construct the channel, or silently decline when `owner_identity` is
    /// unset.
    pub fn new(
        owner_identity: Option<&str>,
        transport: Arc<dyn ExternalTransport>,
    ) -> Option<Arc<Self>> {
        let Some(identity) = owner_identity.filter(|s| !s.is_empty()) else {
            tracing::debug!(
                transport = transport.name(),
                "owner identity unset; external channel inhibited"
            );
            return None;
        };
        let client_id = format!("channel:{}", transport.name());
        Some(Arc::new(Self {
            owner_identity: identity.to_owned(),
            transport,
            client_id,
        }))
    }

    /// The pseudo-client id this channel injects requests under.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The only outbound path.  No other recipient is addressable.
    pub async fn send_to_owner(&self, text: &str) -> Result<(), String> {
        self.transport.send(&self.owner_identity, text).await
    }

    /// Run the inbound loop: owner messages become gateway requests, all
    /// other senders are dropped before any downstream component sees them.
    pub async fn run(
        self: Arc<Self>,
        ingress: mpsc::UnboundedSender<Inbound>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (tx, mut rx) = mpsc::channel::<ExternalMessage>(64);

        let transport = self.transport.clone();
        let listener = tokio::spawn(async move {
            if let Err(e) = transport.listen(tx).await {
                tracing::warn!(error = %e, "external transport listener ended");
            }
        });

        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    if message.from != self.owner_identity {
                        // Silent drop: no transcript, no routing, no reply.
                        tracing::trace!("non-owner inbound dropped");
                        continue;
                    }
                    let inbound = Inbound {
                        client_id: self.client_id.clone(),
                        message: ClientMessage::ChatRequest(ChatRequestPayload {
                            content: message.body,
                            request_id: None,
                            prior_messages: None,
                            force_engine_hint: None,
                        }),
                    };
                    if ingress.send(inbound).is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        listener.abort();
        tracing::info!("owner channel stopped");
    }
}

// ─── send_owner_message tool ──────────────────────────────────────────────────

/// Owner-only, intrusive tool that lets the engine message the owner on the
/// external channel.  Routes through [`OwnerChannel::send_to_owner`] like
/// every other outbound path.
pub struct SendOwnerMessageTool {
    channel: Arc<OwnerChannel>,
}

impl SendOwnerMessageTool {
    pub fn new(channel: Arc<OwnerChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl crate::tools::Tool for SendOwnerMessageTool {
    fn name(&self) -> &str {
        "send_owner_message"
    }

    fn description(&self) -> &str {
        "Send a message to the owner on the external channel."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Message text." }
            },
            "required": ["text"]
        })
    }

    fn flags(&self) -> crate::tools::ToolFlags {
        crate::tools::ToolFlags::INTRUSIVE
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &crate::tools::ToolContext,
    ) -> Result<crate::tools::ToolResult, String> {
        let text = args
            .get("text")
            .and_then(serde_json::Value::as_str)
            .ok_or("missing required argument 'text'")?;
        self.channel.send_to_owner(text).await?;
        Ok(crate::tools::ToolResult::ok("message sent to owner"))
    }
}
