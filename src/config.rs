//! Runtime configuration, resolved from the environment.
//!
//! | Variable                            | Default                  |
//! |-------------------------------------|--------------------------|
//! | `SERVICE_FETCHER_SOCKET`            | [`default_socket_path`]  |
//! | `SERVICE_FETCHER_CONNECT_ATTEMPTS`  | 5                        |
//! | `SERVICE_FETCHER_CALL_TIMEOUT_SECS` | 30                       |

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::connection::BindTarget;
use crate::ipc::{DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_CONNECT_ATTEMPTS};

pub const SOCKET_ENV: &str = "SERVICE_FETCHER_SOCKET";
pub const CONNECT_ATTEMPTS_ENV: &str = "SERVICE_FETCHER_CONNECT_ATTEMPTS";
pub const CALL_TIMEOUT_ENV: &str = "SERVICE_FETCHER_CALL_TIMEOUT_SECS";

const SOCKET_FILE_NAME: &str = "service-fetcher.sock";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Resolve the default socket path.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR/service-fetcher.sock` (Linux, per-user)
/// 2. the platform cache directory (`~/Library/Caches` on macOS)
/// 3. `/tmp/service-fetcher.sock`
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join(SOCKET_FILE_NAME);
        }
    }

    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join(SOCKET_FILE_NAME);
    }

    PathBuf::from("/tmp").join(SOCKET_FILE_NAME)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherConfig {
    pub socket_path: PathBuf,
    /// Socket connect tries within one connect attempt.
    pub connect_attempts: u32,
    /// Reply timeout for a single transaction.
    pub call_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }
}

impl FetcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve with an arbitrary variable source; unset and empty values fall
    /// back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(path) = lookup(SOCKET_ENV) {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(value) = lookup(CONNECT_ATTEMPTS_ENV) {
            config.connect_attempts = parse_positive(CONNECT_ATTEMPTS_ENV, &value)?;
        }
        if let Some(value) = lookup(CALL_TIMEOUT_ENV) {
            let secs: u32 = parse_positive(CALL_TIMEOUT_ENV, &value)?;
            config.call_timeout = Duration::from_secs(u64::from(secs));
        }

        Ok(config)
    }

    /// Connection parameters for the service named `name` at the configured
    /// socket.
    pub fn bind_target(&self, name: impl Into<String>) -> BindTarget {
        BindTarget::new(name, self.socket_path.clone())
    }
}

fn parse_positive(name: &'static str, value: &str) -> Result<u32, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
        reason,
    };
    match value.trim().parse::<u32>() {
        Ok(0) => Err(invalid("must be at least 1".to_string())),
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(invalid(e.to_string())),
    }
}
