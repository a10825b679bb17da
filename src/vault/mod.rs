//! The vault: owner-protected state directory, configuration, and the
//! encrypted credential store.
//!
//! # On-disk layout
//!
//! ```text
//! <state>/                   mode 0700
//!   config.json              configuration + encrypted credential map
//!   .masterkey               32-byte AES-256 key, created on first write
//!   core-memory.md           working memory
//!   memory/                  archival vector store
//!   cognitive-map.json       category index
//!   transcripts/             per-session JSONL audit logs
//!   tools-registry.json      forge-generated tool artefacts
//!   alerts.json              scheduled alerts
//!   daemon.pid               PID of the live daemon (single-writer)
//!   logs/                    daemon log files
//! ```
//!
//! The vault is constructed once at daemon start and passed by reference to
//! its consumers; there is no global accessor.

pub mod crypto;

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use zeroize::Zeroizing;

use crate::config::{self, ConfigLoad, DaemonConfig};

// ─── VaultError ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// No config exists yet — the interactive setup flow must run first.
    #[error("vault is uninitialised; run setup first")]
    Uninitialised,
    #[error("config is invalid: {0}")]
    InvalidConfig(String),
    #[error("another daemon instance is running (pid {0})")]
    AlreadyRunning(u32),
    #[error("credential error: {0}")]
    Credential(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ─── Vault ────────────────────────────────────────────────────────────────────

/// Handle to the daemon's state directory and configuration.
#[derive(Debug)]
pub struct Vault {
    state_dir: PathBuf,
    config: DaemonConfig,
    master_key: Option<Zeroizing<[u8; 32]>>,
}

impl Vault {
    /// Open the vault at `state_dir`, creating the directory tree (mode 0700)
    /// and loading `config.json`.
    ///
    /// Fails with [`VaultError::Uninitialised`] when no config exists — the
    /// daemon never continues on partial configuration.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)?;
        restrict_dir(&state_dir)?;
        for sub in ["transcripts", "memory", "logs"] {
            fs::create_dir_all(state_dir.join(sub))?;
        }

        let config = match config::load_config(&state_dir.join("config.json")) {
            ConfigLoad::Ready(c) => c,
            ConfigLoad::Absent => return Err(VaultError::Uninitialised),
            ConfigLoad::Invalid(msg) => return Err(VaultError::InvalidConfig(msg)),
        };

        let master_key = Self::load_master_key(&state_dir)?;

        Ok(Self {
            state_dir,
            config,
            master_key,
        })
    }

    /// Default state directory: `~/.vigil`.
    pub fn default_state_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".vigil")
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    // ── Paths ────────────────────────────────────────────────────────────

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join("config.json")
    }

    pub fn core_memory_path(&self) -> PathBuf {
        self.state_dir.join("core-memory.md")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.state_dir.join("memory")
    }

    pub fn cognitive_map_path(&self) -> PathBuf {
        self.state_dir.join("cognitive-map.json")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.state_dir.join("transcripts")
    }

    pub fn tools_registry_path(&self) -> PathBuf {
        self.state_dir.join("tools-registry.json")
    }

    pub fn alerts_path(&self) -> PathBuf {
        self.state_dir.join("alerts.json")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join("daemon.pid")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    // ── Credentials ──────────────────────────────────────────────────────

    /// Decrypt the credential stored under `name`, if present.
    pub fn credential(&self, name: &str) -> Result<Option<String>, VaultError> {
        let Some(cred) = self.config.credentials.get(name) else {
            return Ok(None);
        };
        let key = self
            .master_key
            .as_ref()
            .ok_or_else(|| VaultError::Credential("master key missing".to_owned()))?;
        crypto::decrypt_credential(key, cred)
            .map(Some)
            .map_err(VaultError::Credential)
    }

    /// Encrypt and store a credential, creating the master key on first write.
    pub fn store_credential(&mut self, name: &str, value: &str) -> Result<(), VaultError> {
        if self.master_key.is_none() {
            self.master_key = Some(Self::create_master_key(&self.state_dir)?);
        }
        let key = self
            .master_key
            .as_ref()
            .ok_or_else(|| VaultError::Credential("master key missing".to_owned()))?;
        let cred = crypto::encrypt_credential(key, value).map_err(VaultError::Credential)?;
        self.config.credentials.insert(name.to_owned(), cred);
        config::save_config(&self.config_path(), &self.config)
            .map_err(VaultError::InvalidConfig)?;
        Ok(())
    }

    fn load_master_key(state_dir: &Path) -> Result<Option<Zeroizing<[u8; 32]>>, VaultError> {
        let path = state_dir.join(".masterkey");
        match fs::read(&path) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut key = Zeroizing::new([0u8; 32]);
                key.copy_from_slice(&bytes);
                Ok(Some(key))
            }
            Ok(bytes) => Err(VaultError::Credential(format!(
                "master key has wrong length: {} (expected 32)",
                bytes.len()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create_master_key(state_dir: &Path) -> Result<Zeroizing<[u8; 32]>, VaultError> {
        let key = Zeroizing::new(rand::random::<[u8; 32]>());
        let path = state_dir.join(".masterkey");
        fs::write(&path, key.as_slice())?;
        restrict_file(&path)?;
        Ok(key)
    }

    // ── PID file ─────────────────────────────────────────────────────────

    /// Write `daemon.pid`, refusing when another live instance holds it.
    /// Stale pid files (dead process) are silently replaced.
    pub fn claim_pid(&self) -> Result<(), VaultError> {
        let path = self.pid_path();
        if let Ok(content) = fs::read_to_string(&path)
            && let Ok(pid) = content.trim().parse::<u32>()
            && pid != std::process::id()
            && process_alive(pid)
        {
            return Err(VaultError::AlreadyRunning(pid));
        }
        fs::write(&path, std::process::id().to_string())?;
        restrict_file(&path)?;
        Ok(())
    }

    /// Remove `daemon.pid` on shutdown.  Missing file is not an error.
    pub fn release_pid(&self) {
        let _ = fs::remove_file(self.pid_path());
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // Without procfs we cannot cheaply probe liveness; treat the pid file as
    // authoritative and refuse to replace it.
    true
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<(), io::Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> Result<(), io::Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<(), io::Error> {
    Ok(())
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> Result<(), io::Error> {
    Ok(())
}
