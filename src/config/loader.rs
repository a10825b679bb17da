//! `config.json` loading, env-var overrides, and atomic saves.
//!
//! # Loading order
//! 1. Parse `<state>/config.json`
//! 2. Apply `VIGIL_*` environment variable overrides
//!
//! A missing file is **not** silently defaulted: the daemon must never run on
//! partial config, so [`load_config`] distinguishes "absent" from "broken".
//!
//! # Atomic save
//! Writes to `<path>.tmp` → rename to `<path>` to avoid partial writes
//! corrupting the config file.

use std::{env, fs, io, path::Path};

use super::schema::DaemonConfig;

/// Outcome of attempting to load the configuration.
#[derive(Debug)]
pub enum ConfigLoad {
    /// The file parsed and is complete enough to run on.
    Ready(DaemonConfig),
    /// No config file exists — the setup flow must run first.
    Absent,
    /// The file exists but could not be parsed or is incomplete.
    Invalid(String),
}

/// Load [`DaemonConfig`] from `path`, then apply environment overrides.
pub fn load_config(path: &Path) -> ConfigLoad {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return ConfigLoad::Absent,
        Err(e) => return ConfigLoad::Invalid(format!("failed to read {path:?}: {e}")),
    };

    let mut config: DaemonConfig = match serde_json::from_str(&content) {
        Ok(c) => c,
        Err(e) => return ConfigLoad::Invalid(format!("failed to parse {path:?}: {e}")),
    };

    apply_env_overrides(&mut config);

    if !config.is_initialised() {
        return ConfigLoad::Invalid("config is missing a live engine; run setup first".to_owned());
    }
    ConfigLoad::Ready(config)
}

/// Persist `config` to `path` atomically (tmp file + rename), mode 0600.
pub fn save_config(path: &Path, config: &DaemonConfig) -> Result<(), String> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("failed to serialise config: {e}"))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json).map_err(|e| format!("failed to write {tmp:?}: {e}"))?;
    restrict_permissions(&tmp)?;
    fs::rename(&tmp, path).map_err(|e| format!("failed to rename {tmp:?} → {path:?}: {e}"))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| format!("failed to chmod {path:?}: {e}"))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), String> {
    Ok(())
}

/// Apply `VIGIL_*` environment variable overrides to `config`.
///
/// Supported overrides:
/// - `VIGIL_GATEWAY_PORT`   → `gatewayPort`
/// - `VIGIL_DEFAULT_ENGINE` → `defaultEngine`
/// - `VIGIL_GOD_MODE`       → `godMode` (1/0)
/// - `VIGIL_OWNER_IDENTITY` → `ownerIdentity`
fn apply_env_overrides(config: &mut DaemonConfig) {
    if let Ok(v) = env::var("VIGIL_GATEWAY_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        config.gateway_port = port;
    }
    if let Ok(v) = env::var("VIGIL_DEFAULT_ENGINE") {
        config.default_engine = v;
    }
    if let Ok(v) = env::var("VIGIL_GOD_MODE") {
        config.god_mode = v == "1" || v.eq_ignore_ascii_case("true");
    }
    if let Ok(v) = env::var("VIGIL_OWNER_IDENTITY")
        && !v.is_empty()
    {
        config.owner_identity = Some(v);
    }
}
