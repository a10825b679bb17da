//! JSON configuration schema for the Vigil daemon.
//!
//! All sections have `#[serde(default)]` so a partially-filled `config.json`
//! works correctly.  Missing sections fall back to their `Default` impl.
//! Keys are camelCase on disk, matching the setup flow's output:
//!
//! ```json
//! {
//!   "version": 1,
//!   "engines": {
//!     "live":   { "provider": "ollama", "model": "llama3.2", "endpoint": "http://127.0.0.1:11434" },
//!     "worker": { "provider": "ollama", "model": "qwen2.5-coder:32b", "enabled": false },
//!     "cloud":  { "provider": "anthropic", "model": "claude-sonnet-4-5", "credentialRef": "anthropic" }
//!   },
//!   "ownerIdentity": "+15551234567",
//!   "defaultEngine": "live",
//!   "godMode": false,
//!   "gatewayPort": 7777
//! }
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── EngineEntry ──────────────────────────────────────────────────────────────

/// One engine slot (`live`, `worker`, or `cloud`) as configured on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineEntry {
    /// Provider identifier (e.g. `"ollama"`, `"anthropic"`, `"openai"`).
    pub provider: String,
    /// Model identifier passed through to the provider.
    pub model: String,
    /// Optional API endpoint for on-device / self-hosted providers.
    pub endpoint: Option<String>,
    /// Name of the credential in the encrypted credential map, if any.
    pub credential_ref: Option<String>,
    /// Whether this engine may be used.  The worker engine ships disabled.
    pub enabled: bool,
    /// Advisory parallelism hint for the provider.
    pub parallelism: Option<u32>,
}

impl Default for EngineEntry {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: String::new(),
            endpoint: None,
            credential_ref: None,
            enabled: true,
            parallelism: None,
        }
    }
}

impl EngineEntry {
    /// An entry is configured when both provider and model are non-empty.
    pub fn is_configured(&self) -> bool {
        !self.provider.is_empty() && !self.model.is_empty()
    }
}

// ─── EnginesConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnginesConfig {
    pub live: EngineEntry,
    pub worker: EngineEntry,
    pub cloud: EngineEntry,
}

// ─── ExtensionEntry ───────────────────────────────────────────────────────────

/// A tool-provider subprocess declared in config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtensionEntry {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

// ─── HardwareProfile ──────────────────────────────────────────────────────────

/// Advisory hardware description captured by the setup flow.  Never acted on
/// by the core; surfaced in `system:status` replies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct HardwareProfile {
    pub gpu_name: Option<String>,
    pub vram_gb: Option<u32>,
    pub ram_gb: Option<u32>,
}

// ─── EncryptedCredential ──────────────────────────────────────────────────────

/// One AES-256-CBC encrypted credential, hex-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncryptedCredential {
    pub iv: String,
    pub ciphertext: String,
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

/// Root of `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Schema version.
    pub version: u32,
    pub engines: EnginesConfig,
    /// Single external identity allowed on the owner channel.  `None`
    /// inhibits the channel entirely.
    pub owner_identity: Option<String>,
    /// Engine used when the router has no stronger opinion: `"live"` or `"cloud"`.
    pub default_engine: String,
    /// When true, destructive-tool approvals are bypassed.  Intrusive tools
    /// are always gated regardless.
    pub god_mode: bool,
    /// Tool-provider subprocesses, keyed by extension id.
    pub extensions: HashMap<String, ExtensionEntry>,
    pub hardware_profile: HardwareProfile,
    /// TCP port for the local client gateway.
    pub gateway_port: u16,
    /// Encrypted credential map, keyed by `credentialRef`.
    pub credentials: HashMap<String, EncryptedCredential>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            version: 1,
            engines: EnginesConfig::default(),
            owner_identity: None,
            default_engine: "live".to_owned(),
            god_mode: false,
            extensions: HashMap::new(),
            hardware_profile: HardwareProfile::default(),
            gateway_port: 7777,
            credentials: HashMap::new(),
        }
    }
}

impl DaemonConfig {
    /// A config is initialised when at least the live engine is filled in.
    /// The daemon refuses to start on partial config (the setup flow owns
    /// creating a complete one).
    pub fn is_initialised(&self) -> bool {
        self.engines.live.is_configured()
    }
}
