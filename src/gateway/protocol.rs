//! The typed duplex message protocol spoken over the local client socket.
//!
//! Every frame is one JSON object per line: `{type, timestamp, payload?}`.
//! The `type` string is the discriminator (`"chat:request"`,
//! `"chat:stream:chunk"`, …).  Unknown types are logged and dropped;
//! malformed frames are logged and dropped without closing the connection.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::heartbeat::HeartbeatSnapshot;
use crate::tools::approval::ApprovalDecision;

// ─── Wire frame ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    timestamp: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

// ─── Client → server ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestPayload {
    pub content: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub prior_messages: Option<Vec<PriorMessage>>,
    /// Explicit engine override (`"live"`, `"cloud"`, `"worker"`); slash
    /// commands in the content are the other way to force an engine.
    #[serde(default)]
    pub force_engine_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponsePayload {
    pub approval_id: String,
    pub decision: ApprovalDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCommandPayload {
    pub command: String,
}

/// Messages a client may send.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    ChatRequest(ChatRequestPayload),
    ApprovalResponse(ApprovalResponsePayload),
    SystemCommand(SystemCommandPayload),
    Ping,
}

/// Why an inbound frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not valid JSON, or missing the envelope fields.
    Malformed(String),
    /// Valid envelope with a type this daemon does not speak.
    UnknownType(String),
}

impl ClientMessage {
    /// Parse one JSON line into a typed client message.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let frame: WireFrame =
            serde_json::from_str(line).map_err(|e| FrameError::Malformed(e.to_string()))?;

        fn payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, FrameError> {
            serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
        }

        match frame.kind.as_str() {
            "chat:request" => Ok(Self::ChatRequest(payload(frame.payload)?)),
            "approval:response" => Ok(Self::ApprovalResponse(payload(frame.payload)?)),
            "system:command" => Ok(Self::SystemCommand(payload(frame.payload)?)),
            "ping" => Ok(Self::Ping),
            other => Err(FrameError::UnknownType(other.to_owned())),
        }
    }
}

// ─── Server → client ──────────────────────────────────────────────────────────

// The server-side set is wide and payload shapes vary; rather than one big
// enum with serde gymnastics, each constructor builds its wire frame
// directly.
#[derive(Debug, Clone)]
pub struct ServerMessage {
    pub kind: &'static str,
    pub payload: Value,
}

impl ServerMessage {
    pub fn stream_chunk(request_id: &str, text: &str) -> Self {
        Self {
            kind: "chat:stream:chunk",
            payload: serde_json::json!({ "requestId": request_id, "text": text }),
        }
    }

    pub fn stream_done(
        request_id: &str,
        tier: &str,
        model: &str,
        tokens_in: Option<u32>,
        tokens_out: Option<u32>,
    ) -> Self {
        Self {
            kind: "chat:stream:done",
            payload: serde_json::json!({
                "requestId": request_id,
                "tier": tier,
                "model": model,
                "tokensIn": tokens_in,
                "tokensOut": tokens_out,
            }),
        }
    }

    pub fn chat_error(request_id: &str, kind: &str, message: &str) -> Self {
        Self {
            kind: "chat:error",
            payload: serde_json::json!({
                "requestId": request_id,
                "kind": kind,
                "message": message,
            }),
        }
    }

    pub fn tool_call(request_id: &str, tool_name: &str, args: &Value) -> Self {
        Self {
            kind: "chat:tool:call",
            payload: serde_json::json!({
                "requestId": request_id,
                "toolName": tool_name,
                "args": args,
            }),
        }
    }

    pub fn tool_result(request_id: &str, tool_name: &str, success: bool, output: &str) -> Self {
        Self {
            kind: "chat:tool:result",
            payload: serde_json::json!({
                "requestId": request_id,
                "toolName": tool_name,
                "success": success,
                "output": output,
            }),
        }
    }

    pub fn approval_request(
        approval_id: &str,
        tool_name: &str,
        description: &str,
        reason: &str,
        args: &Value,
        expires_at_ms: i64,
    ) -> Self {
        Self {
            kind: "approval:request",
            payload: serde_json::json!({
                "approvalId": approval_id,
                "toolName": tool_name,
                "description": description,
                "reason": reason,
                "args": args,
                "expiresAtMs": expires_at_ms,
            }),
        }
    }

    pub fn approval_resolved(approval_id: &str, decision: Option<ApprovalDecision>) -> Self {
        Self {
            kind: "approval:resolved",
            payload: serde_json::json!({
                "approvalId": approval_id,
                "decision": decision,
            }),
        }
    }

    pub fn log(level: &str, message: &str) -> Self {
        Self {
            kind: "log",
            payload: serde_json::json!({ "level": level, "message": message }),
        }
    }

    pub fn system_status(status: Value) -> Self {
        Self {
            kind: "system:status",
            payload: status,
        }
    }

    pub fn system_alert(message: &str) -> Self {
        Self {
            kind: "system:alert",
            payload: serde_json::json!({ "message": message }),
        }
    }

    pub fn heartbeat(snapshot: &HeartbeatSnapshot) -> Self {
        Self {
            kind: "heartbeat",
            payload: serde_json::to_value(snapshot).unwrap_or(Value::Null),
        }
    }

    pub fn proactive_thought(content: &str) -> Self {
        Self {
            kind: "proactive:thought",
            payload: serde_json::json!({ "content": content }),
        }
    }

    pub fn worker_task_completed(task_id: &str, task_type: &str, summary: &str) -> Self {
        Self {
            kind: "worker_task_completed",
            payload: serde_json::json!({
                "taskId": task_id,
                "taskType": task_type,
                "summary": summary,
            }),
        }
    }

    pub fn worker_task_failed(task_id: &str, task_type: &str, error: &str) -> Self {
        Self {
            kind: "worker_task_failed",
            payload: serde_json::json!({
                "taskId": task_id,
                "taskType": task_type,
                "error": error,
            }),
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: "pong",
            payload: Value::Null,
        }
    }

    /// Serialise to one wire line (no trailing newline).
    pub fn to_line(&self) -> String {
        let frame = WireFrame {
            kind: self.kind.to_owned(),
            timestamp: Utc::now().to_rfc3339(),
            payload: self.payload.clone(),
        };
        serde_json::to_string(&frame).unwrap_or_else(|_| {
            // Payloads are built from serde_json::json! and cannot fail to
            // serialise; keep the wire alive regardless.
            format!(
                r#"{{"type":"log","timestamp":"{}","payload":{{"level":"error","message":"serialise failure"}}}}"#,
                Utc::now().to_rfc3339()
            )
        })
    }
}

/// Serialise a client message for test clients and channel bridges.
pub fn client_frame(kind: &str, payload: Value) -> String {
    let frame = WireFrame {
        kind: kind.to_owned(),
        timestamp: Utc::now().to_rfc3339(),
        payload,
    };
    serde_json::to_string(&frame).unwrap_or_default()
}
