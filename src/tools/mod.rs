//! The tool subsystem: catalogue, sender-role policy, loop detection, the
//! human-in-the-loop approval gate, and the native tool set.

pub mod approval;
pub mod forge;
pub mod loop_detector;
pub mod memory_tools;
pub mod policy;
pub mod registry;
pub mod shell;
pub mod traits;

pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalReason, ApprovalRecord, ApprovalRequest,
    DEFAULT_APPROVAL_TIMEOUT_MS,
};
pub use forge::{CreateAndRunTool, ForgeOutcome, ForgeRunner, ForgeSpec, ForgeStore};
pub use loop_detector::{LoopDetector, LoopVerdict, hash_args, hash_result};
pub use policy::{OWNER_ONLY_TOOLS, PolicyDecision, SenderRole, evaluate_tool_policy};
pub use registry::ToolRegistry;
pub use traits::{Tool, ToolContext, ToolFlags, ToolResult, to_spec};
