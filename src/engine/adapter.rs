//! The uniform streaming interface over heterogeneous model backends.
//!
//! Concrete providers (OAuth'd cloud APIs, on-device runtimes, SDK wrappers)
//! live outside the core; each is wrapped in an [`EngineAdapter`] that hides
//! auth, tool-schema marshalling, and stream parsing.  The core only ever
//! observes [`EngineEvent`]s.

use std::{collections::HashMap, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::{EngineEntry, EnginesConfig};

use super::types::{ChatMessage, EngineError, EngineEvent, ToolSpec};

// ─── EngineKind / EngineDescriptor ────────────────────────────────────────────

/// Which of the three engine slots a request is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Low-latency model for interactive chat.
    Live,
    /// High-capability model for background heavy tasks; may be disabled.
    Worker,
    /// Remote API model; used when score or policy mandates.
    Cloud,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Worker => write!(f, "worker"),
            Self::Cloud => write!(f, "cloud"),
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "worker" => Ok(Self::Worker),
            "cloud" => Ok(Self::Cloud),
            other => Err(format!("unknown engine kind: {other}")),
        }
    }
}

/// Immutable description of one configured engine.  Created at config load;
/// read-only at runtime.
#[derive(Debug, Clone)]
pub struct EngineDescriptor {
    pub kind: EngineKind,
    pub provider: String,
    pub model: String,
    pub endpoint: Option<String>,
    /// Decrypted credential, if the config referenced one.
    pub credential: Option<String>,
    pub parallelism: Option<u32>,
}

impl EngineDescriptor {
    pub fn from_entry(kind: EngineKind, entry: &EngineEntry, credential: Option<String>) -> Self {
        Self {
            kind,
            provider: entry.provider.clone(),
            model: entry.model.clone(),
            endpoint: entry.endpoint.clone(),
            credential,
            parallelism: entry.parallelism,
        }
    }
}

// ─── EngineAdapter ────────────────────────────────────────────────────────────

/// A request handed to an adapter: one model turn.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

/// Stream of engine events for one turn.  The stream ends after a `Done` or
/// `Error` event.
pub type EngineStream = Pin<Box<dyn Stream<Item = EngineEvent> + Send>>;

/// Uniform streaming interface over a model backend.
///
/// One adapter instance is bound to one [`EngineDescriptor`] at pool
/// construction; `stream` is one generation turn.  Tool results are fed back
/// by the caller appending messages and calling `stream` again.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Stable provider identifier (e.g. `"ollama"`, `"anthropic"`).
    fn provider_name(&self) -> &str;

    /// Run one generation turn, yielding events until `Done` or `Error`.
    async fn stream(&self, request: EngineRequest) -> Result<EngineStream, EngineError>;
}

// ─── EnginePool ───────────────────────────────────────────────────────────────

/// The daemon's configured engines, resolved once at startup.
pub struct EnginePool {
    engines: HashMap<EngineKind, (EngineDescriptor, Arc<dyn EngineAdapter>)>,
}

impl EnginePool {
    pub fn new() -> Self {
        Self {
            engines: HashMap::new(),
        }
    }

    /// Register an adapter for an engine slot.
    pub fn register(&mut self, descriptor: EngineDescriptor, adapter: Arc<dyn EngineAdapter>) {
        self.engines.insert(descriptor.kind, (descriptor, adapter));
    }

    pub fn get(&self, kind: EngineKind) -> Option<(&EngineDescriptor, Arc<dyn EngineAdapter>)> {
        self.engines.get(&kind).map(|(d, a)| (d, a.clone()))
    }

    /// The worker engine exists and was registered.
    pub fn worker_enabled(&self) -> bool {
        self.engines.contains_key(&EngineKind::Worker)
    }

    /// Which slots from `config` should be registered (configured + enabled).
    pub fn configured_kinds(config: &EnginesConfig) -> Vec<EngineKind> {
        let mut kinds = Vec::new();
        if config.live.is_configured() && config.live.enabled {
            kinds.push(EngineKind::Live);
        }
        if config.worker.is_configured() && config.worker.enabled {
            kinds.push(EngineKind::Worker);
        }
        if config.cloud.is_configured() && config.cloud.enabled {
            kinds.push(EngineKind::Cloud);
        }
        kinds
    }
}

impl Default for EnginePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory mapping a provider id to its adapter implementation.
///
/// Concrete SDK-backed adapters register here when compiled in; the core
/// itself ships none (spec: LLM SDKs are external collaborators).
pub struct AdapterFactory;

impl AdapterFactory {
    pub fn create(descriptor: &EngineDescriptor) -> Result<Arc<dyn EngineAdapter>, String> {
        Err(format!(
            "no adapter is compiled in for provider '{}'",
            descriptor.provider
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parse_round_trip() {
        for kind in [EngineKind::Live, EngineKind::Worker, EngineKind::Cloud] {
            let parsed: EngineKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("turbo".parse::<EngineKind>().is_err());
    }

    #[test]
    fn configured_kinds_skips_disabled_worker() {
        let config: EnginesConfig = serde_json::from_str(
            r#"{
                "live":   { "provider": "ollama", "model": "llama3.2" },
                "worker": { "provider": "ollama", "model": "big", "enabled": false },
                "cloud":  { "provider": "anthropic", "model": "claude-sonnet-4-5" }
            }"#,
        )
        .unwrap();
        let kinds = EnginePool::configured_kinds(&config);
        assert!(kinds.contains(&EngineKind::Live));
        assert!(kinds.contains(&EngineKind::Cloud));
        assert!(!kinds.contains(&EngineKind::Worker));
    }

    #[test]
    fn empty_pool_has_no_worker() {
        let pool = EnginePool::new();
        assert!(!pool.worker_enabled());
        assert!(pool.get(EngineKind::Live).is_none());
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        let desc = EngineDescriptor {
            kind: EngineKind::Live,
            provider: "nonexistent".to_owned(),
            model: "m".to_owned(),
            endpoint: None,
            credential: None,
            parallelism: None,
        };
        assert!(AdapterFactory::create(&desc).is_err());
    }
}
