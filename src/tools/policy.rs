//! Sender-role derivation and the owner-only tool filter.
//!
//! The daemon is single-user; roles exist to keep synthetic senders (the
//! scheduler, internal system prompts) away from tools that act as the owner.

use serde::{Deserialize, Serialize};

/// Who a request is acting as.  Derived from the client id, never carried in
/// the message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Owner,
    System,
    Scheduled,
}

impl SenderRole {
    /// `"system"` → System; `scheduled*` → Scheduled; everything else —
    /// local socket clients and owner-channel pseudo-clients — is the owner.
    pub fn from_client_id(client_id: &str) -> Self {
        if client_id == "system" {
            SenderRole::System
        } else if client_id.starts_with("scheduled") {
            SenderRole::Scheduled
        } else {
            SenderRole::Owner
        }
    }
}

impl std::fmt::Display for SenderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::System => write!(f, "system"),
            Self::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Tools that act with the owner's full authority.  Non-owner senders get a
/// failed tool-result instead of execution.
pub const OWNER_ONLY_TOOLS: &[&str] = &[
    "install_extension",
    "schedule_task",
    "set_persona",
    "core_memory_replace",
    "core_memory_append",
    "commit_repository",
    "send_owner_message",
    "create_and_run_tool",
];

/// Decision returned by [`evaluate_tool_policy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    /// The tool is reserved for the owner; the reason is surfaced to the
    /// engine as a failed tool-result.
    Restricted(String),
}

/// Filter a tool call by sender role.
pub fn evaluate_tool_policy(tool_name: &str, role: SenderRole) -> PolicyDecision {
    if role == SenderRole::Owner {
        return PolicyDecision::Allowed;
    }
    if OWNER_ONLY_TOOLS.contains(&tool_name) {
        return PolicyDecision::Restricted("restricted to owner".to_owned());
    }
    PolicyDecision::Allowed
}
