//! # sbx-vpermd
//!
//! Permission store daemon of one sandbox session.
//!
//! ## Architecture
//!
//! Sandboxed processes attach the session's rule tree without keeping the
//! descriptor open, which refuses appends and record updates, and read
//! simulated inode records directly. The daemon is the only writer of those
//! records: it attaches the tree with create + keep-open and applies every
//! `VpermRequest` it receives, serially.
//!
//! ## Communication
//!
//! - Socket path: `<session_dir>/vperm.sock` unless configured
//! - Protocol: `IpcHeader` frames with bincode `VpermRequest`/`VpermResponse`

pub mod commands;
pub mod socket;

use anyhow::{Context, Result};
use sbx_config::{log_daemon_info, log_daemon_warn, SessionConfig};
use sbx_ruletree::RuleTree;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

pub use commands::CommandHandler;

/// Daemon configuration for one session
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub session_dir: PathBuf,
    /// Rule tree file, created when missing
    pub ruletree_path: PathBuf,
    pub socket_path: PathBuf,
    pub map_size: usize,
}

impl DaemonConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            session_dir: config.session_dir.clone(),
            ruletree_path: config.ruletree_path(),
            socket_path: config.vperm_socket(),
            map_size: config.settings.ruletree.map_size,
        }
    }
}

/// Attach the rule tree as its writer.
pub fn open_ruletree(config: &DaemonConfig) -> Result<Arc<RuleTree>> {
    let (tree, outcome) =
        RuleTree::attach_sized(&config.ruletree_path, true, true, config.map_size).with_context(
            || format!("Failed to attach rule tree {}", config.ruletree_path.display()),
        )?;
    log_daemon_info!(
        path = %config.ruletree_path.display(),
        ?outcome,
        active = tree.num_active_inodestats(),
        "Rule tree attached"
    );
    Ok(Arc::new(tree))
}

/// Main daemon entry point
pub async fn run_daemon(config: DaemonConfig) -> Result<()> {
    log_daemon_info!(session_dir = %config.session_dir.display(), "Starting sbx-vpermd");

    let tree = open_ruletree(&config)?;
    let handler = Arc::new(Mutex::new(CommandHandler::new(Arc::clone(&tree))));
    let listener = socket::bind(&config.socket_path)?;

    tokio::select! {
        result = socket::serve(listener, handler) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            log_daemon_info!("Received SIGINT, shutting down");
        }
    }

    if let Err(e) = tree.flush() {
        log_daemon_warn!(error = %e, "Failed to flush rule tree on shutdown");
    }
    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        log_daemon_warn!(error = %e, "Failed to remove socket");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_session() {
        let session = SessionConfig::with_defaults("/tmp/sbx-session");
        let config = DaemonConfig::from_session(&session);
        assert_eq!(config.ruletree_path, PathBuf::from("/tmp/sbx-session/RuleTree.bin"));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/sbx-session/vperm.sock"));
        assert_eq!(config.map_size, sbx_config::RULETREE_MAP_SIZE);
    }

    #[test]
    fn test_open_ruletree_creates_file() {
        let temp = tempfile::tempdir().unwrap();
        let session = SessionConfig::with_defaults(temp.path());
        let config = DaemonConfig::from_session(&session);

        let tree = open_ruletree(&config).unwrap();
        assert!(tree.is_writable());
        assert!(config.ruletree_path.exists());
    }
}
