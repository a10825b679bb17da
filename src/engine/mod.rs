pub mod adapter;
pub mod types;

pub use adapter::{
    AdapterFactory, EngineAdapter, EngineDescriptor, EngineKind, EnginePool, EngineRequest,
    EngineStream,
};
pub use types::{
    ChatMessage, EngineError, EngineErrorKind, EngineEvent, MessageRole, ToolSpec,
    classify_error_message,
};
