//! `vigild` — the headless daemon binary.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use vigil::{
    daemon::{Collaborators, Daemon},
    vault::{Vault, VaultError},
};

#[derive(Debug, Parser)]
#[command(name = "vigild", version, about = "Long-running local AI agent daemon")]
struct Args {
    /// State directory (default: ~/.vigil)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Override the gateway port from config.json
    #[arg(long)]
    port: Option<u16>,

    /// Log filter (overrides VIGIL_LOG), e.g. "info" or "vigil=debug"
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let state_dir = args
        .state_dir
        .clone()
        .unwrap_or_else(Vault::default_state_dir);

    if let Some(port) = args.port {
        // The loader reads VIGIL_GATEWAY_PORT after parsing config.json.
        #[allow(unsafe_code)]
        unsafe {
            std::env::set_var("VIGIL_GATEWAY_PORT", port.to_string())
        };
    }

    // Logging: stderr + daily-rolled file under <state>/logs/.
    let filter = args
        .log_level
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| {
            EnvFilter::try_from_env("VIGIL_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
        });
    let file_appender = tracing_appender::rolling::daily(state_dir.join("logs"), "vigild.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    let vault = match Vault::open(&state_dir) {
        Ok(v) => v,
        Err(VaultError::Uninitialised) => {
            eprintln!(
                "vigild: no configuration found in {}.\nRun the setup flow first, then start the daemon again.",
                state_dir.display()
            );
            return std::process::ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("vigild: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("vigild: failed to start runtime: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(async move {
        let daemon = Daemon::start(vault, Collaborators::default()).await?;
        tracing::info!(port = daemon.port, "vigild running");

        wait_for_signal().await;
        daemon.shutdown().await;
        Ok::<(), String>(())
    });

    match outcome {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vigild: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = sigterm.recv() => tracing::info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
