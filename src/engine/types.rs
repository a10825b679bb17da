use serde::{Deserialize, Serialize};

// ─── MessageRole / ChatMessage ────────────────────────────────────────────────

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// Encode a tool result as a user-role message.  Adapters for providers
    /// with a native tool role may re-marshal; the core never depends on one.
    pub fn tool_result(tool_name: &str, output: &str, success: bool) -> Self {
        let prefix = if success { "✓" } else { "✗" };
        Self {
            role: MessageRole::User,
            content: format!("[Tool: {tool_name}] {prefix}\n{output}"),
        }
    }
}

// ─── ToolSpec ─────────────────────────────────────────────────────────────────

/// Description of a tool as handed to the engine adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

// ─── EngineEvent ──────────────────────────────────────────────────────────────

/// One event on an engine's output stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A fragment of generated text.
    Chunk { text: String },
    /// The engine requests a tool invocation.
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// Generation finished for this turn.
    Done {
        tier: String,
        model: String,
        tokens_in: Option<u32>,
        tokens_out: Option<u32>,
    },
    /// The engine failed; classified for the retry policy.
    Error {
        kind: EngineErrorKind,
        message: String,
    },
}

// ─── EngineErrorKind / EngineError ────────────────────────────────────────────

/// Failure classification.  Only `ContextOverflow` is ever retried, once,
/// after compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineErrorKind {
    Auth,
    Network,
    RateLimit,
    ContextOverflow,
    Unknown,
}

impl std::fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth => write!(f, "auth"),
            Self::Network => write!(f, "network"),
            Self::RateLimit => write!(f, "rate-limit"),
            Self::ContextOverflow => write!(f, "context-overflow"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("engine error ({kind}): {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Best-effort classification of a raw provider error message.  Adapters that
/// know better should classify themselves; this is the fallback.
pub fn classify_error_message(message: &str) -> EngineErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
    {
        EngineErrorKind::Auth
    } else if lower.contains("429") || lower.contains("rate limit") || lower.contains("quota") {
        EngineErrorKind::RateLimit
    } else if lower.contains("context")
        && (lower.contains("length") || lower.contains("window") || lower.contains("overflow"))
        || lower.contains("too many tokens")
        || lower.contains("maximum context")
    {
        EngineErrorKind::ContextOverflow
    } else if lower.contains("connection")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("dns")
        || lower.contains("refused")
    {
        EngineErrorKind::Network
    } else {
        EngineErrorKind::Unknown
    }
}
