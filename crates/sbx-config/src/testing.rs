//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated session directory (arena file lives here)
//! - A unique permission store socket path
//! - A scratch "host" tree for files the gates operate on
//!
//! # Usage
//!
//! ```ignore
//! use sbx_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new()?;
//! let cfg = env.session_config();
//! // cfg.ruletree_path() and cfg.vperm_socket() point into env's temp dir
//! ```

use crate::SessionConfig;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Session directory for this test
    pub session_dir: PathBuf,
    /// Unique socket path for this test
    pub socket_path: PathBuf,
    /// Scratch tree standing in for the host filesystem
    pub host_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let session_dir = root.join("session");
        let host_root = root.join("host");
        std::fs::create_dir_all(&session_dir)?;
        std::fs::create_dir_all(&host_root)?;

        let socket_path = root.join(format!("sbx-test-{}.sock", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            session_dir,
            socket_path,
            host_root,
            test_id,
        })
    }

    /// Session config pointing at this environment, defaults otherwise.
    pub fn session_config(&self) -> SessionConfig {
        let mut cfg = SessionConfig::with_defaults(&self.session_dir);
        cfg.settings.vperm.socket = Some(self.socket_path.clone());
        cfg
    }

    /// Create a test file under the host root
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.host_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a test directory under the host root
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.host_root.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Environment variables a child process needs to join this session.
    pub fn session_env(&self) -> Vec<(String, String)> {
        vec![
            (
                crate::ENV_SESSION_DIR.to_string(),
                self.session_dir.display().to_string(),
            ),
            (
                crate::ENV_VPERM_SOCKET.to_string(),
                self.socket_path.display().to_string(),
            ),
        ]
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.session_dir.exists());
        assert!(env.host_root.exists());
    }

    #[test]
    fn test_environment_has_unique_socket() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.socket_path, env2.socket_path);
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("etc/passwd", b"root:x:0:0").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"root:x:0:0");
    }

    #[test]
    fn test_session_config_points_into_env() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.session_config();
        assert!(cfg.ruletree_path().starts_with(&env.session_dir));
        assert_eq!(cfg.vperm_socket(), env.socket_path);
        let vars = env.session_env();
        assert!(vars.iter().any(|(k, _)| k == "SBOX_SESSION_DIR"));
    }
}
