pub mod channels;
pub mod chat;
pub mod config;
pub mod context;
pub mod daemon;
pub mod engine;
pub mod gateway;
pub mod heartbeat;
pub mod lanes;
pub mod memory;
pub mod router;
pub mod scheduler;
pub mod tools;
pub mod transcript;
pub mod vault;

/// Convenience re-exports for the most commonly used traits and types across
/// the Vigil codebase.
///
/// ```rust
/// use vigil::prelude::*;
/// ```
pub mod prelude {
    // Engine layer
    pub use crate::engine::{
        ChatMessage, EngineAdapter, EngineDescriptor, EngineErrorKind, EngineEvent, EngineKind,
        EnginePool, MessageRole,
    };

    // Tool system
    pub use crate::tools::{
        ApprovalGate, LoopDetector, SenderRole, Tool, ToolContext, ToolRegistry, ToolResult,
    };

    // Memory subsystem
    pub use crate::memory::{ArchivalMemory, CoreMemory, EmbeddingProvider};

    // Gateway protocol
    pub use crate::gateway::{ClientMessage, Gateway, ServerMessage};

    // Daemon state
    pub use crate::heartbeat::{DaemonState, StateHandle};

    // Vault
    pub use crate::vault::Vault;
}
