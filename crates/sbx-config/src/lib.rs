//! # sbx-config
//!
//! Session configuration for the sbx sandbox runtime.
//!
//! Loads configuration from:
//! 1. `~/.sbx/config.toml` (global)
//! 2. `<session_dir>/sbx.toml` (session-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! The session directory itself only ever comes from the environment
//! (`SBOX_SESSION_DIR`) or from an explicit caller; every runtime component
//! locates its files relative to it.

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

pub use logging::LogLevel;

/// Environment variable naming the session directory.
pub const ENV_SESSION_DIR: &str = "SBOX_SESSION_DIR";
/// Environment variable naming the active mapping mode.
pub const ENV_SESSION_MODE: &str = "SBOX_SESSION_MODE";
pub const ENV_VPERM_SOCKET: &str = "SBOX_VPERM_SOCKET";
pub const ENV_VPERM_UID: &str = "SBOX_VPERM_UID";
pub const ENV_VPERM_GID: &str = "SBOX_VPERM_GID";
pub const ENV_LOG_LEVEL: &str = "SBOX_LOG_LEVEL";

/// Mapping mode used when none is configured.
pub const DEFAULT_MODE: &str = "Default";

/// Arena file name inside the session directory.
pub const RULETREE_FILE_NAME: &str = "RuleTree.bin";

/// Mapping size for the arena (the file never grows past this).
pub const RULETREE_MAP_SIZE: usize = 16 * 1024 * 1024;

static CONFIG: Lazy<RwLock<Option<SessionConfig>>> = Lazy::new(|| RwLock::new(None));

/// Get the process-wide session config, loading it from the environment on
/// first use.
pub fn config() -> Result<SessionConfig> {
    if let Ok(guard) = CONFIG.read() {
        if let Some(cfg) = guard.as_ref() {
            return Ok(cfg.clone());
        }
    }
    reload()
}

/// Reload config from disk and environment
pub fn reload() -> Result<SessionConfig> {
    let cfg = SessionConfig::from_env()?;
    if let Ok(mut guard) = CONFIG.write() {
        *guard = Some(cfg.clone());
    }
    Ok(cfg)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("session directory not set (SBOX_SESSION_DIR is missing)")]
    MissingSessionDir,
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Settings persisted in TOML. The session directory is not part of the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub session: SessionSection,
    pub ruletree: RuleTreeSection,
    pub mapping: MappingSection,
    pub vperm: VpermSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Mapping mode; selects which FS rule catalog is active
    pub mode: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            mode: DEFAULT_MODE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleTreeSection {
    pub file_name: String,
    pub map_size: usize,
}

impl Default for RuleTreeSection {
    fn default() -> Self {
        Self {
            file_name: RULETREE_FILE_NAME.to_string(),
            map_size: RULETREE_MAP_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingSection {
    /// Level of the "pass:"/"mapped:" result lines
    pub result_log_level: LogLevel,
    /// Evaluator bootstrap script, relative to the session directory
    pub entry_point: PathBuf,
}

impl Default for MappingSection {
    fn default() -> Self {
        Self {
            result_log_level: LogLevel::Info,
            entry_point: PathBuf::from("lua_scripts/main.lua"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VpermSection {
    /// Permission store socket (None = `<session_dir>/vperm.sock`)
    pub socket: Option<PathBuf>,
    /// Simulated owner for files created inside the sandbox
    pub virtual_uid: Option<u32>,
    /// Simulated group for files created inside the sandbox
    pub virtual_gid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: LogLevel,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
        }
    }
}

/// Configuration of one sandbox session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_dir: PathBuf,
    pub settings: Settings,
}

impl SessionConfig {
    /// Build a config for `session_dir` from the config files and the
    /// environment.
    pub fn load(session_dir: impl Into<PathBuf>) -> Result<Self> {
        let session_dir = session_dir.into();
        let mut settings = Settings::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                settings = read_settings(&global_path)?;
            }
        }

        let session_path = session_dir.join("sbx.toml");
        if session_path.exists() {
            debug!("Loading session config from {:?}", session_path);
            settings = read_settings(&session_path)?;
        }

        let mut cfg = Self {
            session_dir,
            settings,
        };
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Locate the session from `SBOX_SESSION_DIR`.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(ENV_SESSION_DIR) {
            Some(dir) if !dir.is_empty() => Self::load(PathBuf::from(dir)),
            _ => Err(ConfigError::MissingSessionDir),
        }
    }

    /// Defaults only; no files, no environment.
    pub fn with_defaults(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
            settings: Settings::default(),
        }
    }

    /// Global config path: ~/.sbx/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".sbx/config.toml"))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var(ENV_SESSION_MODE) {
            if !mode.is_empty() {
                self.settings.session.mode = mode;
            }
        }
        if let Ok(socket) = std::env::var(ENV_VPERM_SOCKET) {
            self.settings.vperm.socket = Some(PathBuf::from(socket));
        }
        if let Some(uid) = parse_env_u32(ENV_VPERM_UID)? {
            self.settings.vperm.virtual_uid = Some(uid);
        }
        if let Some(gid) = parse_env_u32(ENV_VPERM_GID)? {
            self.settings.vperm.virtual_gid = Some(gid);
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            self.settings.logging.level =
                level.parse().map_err(|_| ConfigError::InvalidEnv {
                    name: ENV_LOG_LEVEL,
                    value: level.clone(),
                })?;
        }
        Ok(())
    }

    pub fn mode(&self) -> &str {
        &self.settings.session.mode
    }

    /// `<session_dir>/RuleTree.bin`
    pub fn ruletree_path(&self) -> PathBuf {
        self.session_dir.join(&self.settings.ruletree.file_name)
    }

    pub fn evaluator_entry_point(&self) -> PathBuf {
        self.session_dir.join(&self.settings.mapping.entry_point)
    }

    pub fn vperm_socket(&self) -> PathBuf {
        self.settings
            .vperm
            .socket
            .clone()
            .unwrap_or_else(|| self.session_dir.join("vperm.sock"))
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Settings::default()).unwrap_or_default()
    }
}

fn read_settings(path: &Path) -> Result<Settings> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

fn parse_env_u32(name: &'static str) -> Result<Option<u32>> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        _ => Ok(None),
    }
}
