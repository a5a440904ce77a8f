//! sbx-vpermd - permission store daemon of one sandbox session
//!
//! Usage:
//!   sbx-vpermd --session-dir /path/to/session [--socket /path/to/vperm.sock]

use anyhow::{Context, Result};
use clap::Parser;
use sbx_config::logging::init_logging;
use sbx_config::{log_daemon_info, SessionConfig, ENV_SESSION_DIR, ENV_VPERM_SOCKET};
use sbx_vpermd::{run_daemon, DaemonConfig};
use std::path::PathBuf;

/// Owns the simulated inode records of a sandbox session.
#[derive(Parser)]
#[command(name = "sbx-vpermd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Session directory holding RuleTree.bin
    #[arg(long, env = ENV_SESSION_DIR)]
    session_dir: PathBuf,

    /// Socket to listen on (default: <session_dir>/vperm.sock)
    #[arg(long, env = ENV_VPERM_SOCKET)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if !cli.session_dir.is_dir() {
        anyhow::bail!("Session directory does not exist: {}", cli.session_dir.display());
    }

    let mut session = SessionConfig::load(&cli.session_dir)
        .with_context(|| format!("Failed to load config for {}", cli.session_dir.display()))?;
    if let Some(socket) = cli.socket {
        session.settings.vperm.socket = Some(socket);
    }

    init_logging(session.settings.logging.level);
    log_daemon_info!(session_dir = %session.session_dir.display(), mode = session.mode(), "Configuration loaded");

    run_daemon(DaemonConfig::from_session(&session)).await
}
