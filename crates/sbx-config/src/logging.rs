//! Structured logging utilities for sbx components.
//!
//! Every event carries a `component` field so a single `EnvFilter` can
//! separate rule tree noise from mapping decisions.
//!
//! # Usage
//!
//! ```ignore
//! use sbx_config::{log_mapping_debug, log_ruletree_warn};
//!
//! log_ruletree_warn!(offset = 42, "not a catalog entry");
//! log_mapping_debug!("virtual_path='{}'", path);
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const RULETREE: &'static str = "RULETREE";
    pub const MAPPING: &'static str = "MAPPING";
    pub const VPERM: &'static str = "VPERM";
    pub const IPC: &'static str = "IPC";
    pub const DAEMON: &'static str = "DAEMON";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" | "noise" => Ok(LogLevel::Trace),
            _ => Err(()),
        }
    }
}

// === RULETREE logging macros ===

#[macro_export]
macro_rules! log_ruletree_error {
    ($($arg:tt)+) => {
        tracing::error!(component = $crate::logging::Component::RULETREE, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_ruletree_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = $crate::logging::Component::RULETREE, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_ruletree_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = $crate::logging::Component::RULETREE, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_ruletree_trace {
    ($($arg:tt)+) => {
        tracing::trace!(component = $crate::logging::Component::RULETREE, $($arg)+)
    };
}

// === MAPPING logging macros ===

#[macro_export]
macro_rules! log_mapping_error {
    ($($arg:tt)+) => {
        tracing::error!(component = $crate::logging::Component::MAPPING, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_mapping_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = $crate::logging::Component::MAPPING, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_mapping_info {
    ($($arg:tt)+) => {
        tracing::info!(component = $crate::logging::Component::MAPPING, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_mapping_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = $crate::logging::Component::MAPPING, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_mapping_trace {
    ($($arg:tt)+) => {
        tracing::trace!(component = $crate::logging::Component::MAPPING, $($arg)+)
    };
}

// === VPERM logging macros ===

#[macro_export]
macro_rules! log_vperm_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = $crate::logging::Component::VPERM, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_vperm_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = $crate::logging::Component::VPERM, $($arg)+)
    };
}

// === IPC logging macros ===

#[macro_export]
macro_rules! log_ipc_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = $crate::logging::Component::IPC, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_ipc_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = $crate::logging::Component::IPC, $($arg)+)
    };
}

// === DAEMON logging macros ===

#[macro_export]
macro_rules! log_daemon_error {
    ($($arg:tt)+) => {
        tracing::error!(component = $crate::logging::Component::DAEMON, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_daemon_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = $crate::logging::Component::DAEMON, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_daemon_info {
    ($($arg:tt)+) => {
        tracing::info!(component = $crate::logging::Component::DAEMON, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_daemon_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = $crate::logging::Component::DAEMON, $($arg)+)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup; later calls are ignored.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env("SBX_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
