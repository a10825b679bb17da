//! Cognitive router: complexity scoring → engine selection.
//!
//! Selection rules, in order:
//! 1. An explicit slash-command hint picks the engine (it never overrides
//!    the sender-role tool policy, which is enforced downstream).
//! 2. Score ≥ 60 with the worker engine enabled → delegate to the heavy
//!    task queue.
//! 3. Score ≥ 40, or a system-originated request → cloud engine.
//! 4. Otherwise → the configured default engine (live unless overridden).

pub mod complexity;

pub use complexity::score;

use crate::engine::{ChatMessage, EngineKind};
use crate::tools::SenderRole;

/// Score at which cloud quality is warranted.
pub const CLOUD_THRESHOLD: u8 = 40;
/// Score at which work is offloaded to the worker engine.
pub const HEAVY_THRESHOLD: u8 = 60;

/// Where a request should execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Engine(EngineKind),
    /// Enqueue on the heavy task queue and ack immediately.
    DelegateHeavy,
}

/// Strip a leading `/live`, `/local`, `/cloud`, or `/worker` slash command,
/// returning the forced engine and the remaining content.
pub fn parse_engine_hint(content: &str) -> (Option<EngineKind>, &str) {
    let trimmed = content.trim_start();
    for (prefix, kind) in [
        ("/live", EngineKind::Live),
        ("/local", EngineKind::Live),
        ("/cloud", EngineKind::Cloud),
        ("/worker", EngineKind::Worker),
    ] {
        if let Some(rest) = trimmed.strip_prefix(prefix)
            && (rest.is_empty() || rest.starts_with(char::is_whitespace))
        {
            return (Some(kind), rest.trim_start());
        }
    }
    (None, content)
}

/// The router itself: thresholds plus the configured fallback engine.
pub struct CognitiveRouter {
    default_engine: EngineKind,
}

impl CognitiveRouter {
    pub fn new(default_engine: EngineKind) -> Self {
        Self { default_engine }
    }

    /// Decide where `content` runs.
    pub fn route(
        &self,
        content: &str,
        prior: &[ChatMessage],
        role: SenderRole,
        hint: Option<EngineKind>,
        worker_enabled: bool,
    ) -> (RouteDecision, u8) {
        let score = complexity::score(content, prior);

        if let Some(kind) = hint {
            let decision = match kind {
                EngineKind::Worker if worker_enabled => RouteDecision::DelegateHeavy,
                EngineKind::Worker => {
                    tracing::warn!("worker engine requested but not enabled; using cloud");
                    RouteDecision::Engine(EngineKind::Cloud)
                }
                other => RouteDecision::Engine(other),
            };
            return (decision, score);
        }

        let decision = if score >= HEAVY_THRESHOLD && worker_enabled {
            RouteDecision::DelegateHeavy
        } else if score >= CLOUD_THRESHOLD || role == SenderRole::System {
            RouteDecision::Engine(EngineKind::Cloud)
        } else {
            RouteDecision::Engine(self.default_engine)
        };
        (decision, score)
    }
}
