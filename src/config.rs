//! Configuration for the daemon and clients.
//!
//! Built-in defaults, overridden by `KMODD_*` environment variables (a
//! `.env` file is honored at startup), overridden in turn by command-line
//! flags.

use std::path::PathBuf;

/// Well-known endpoint clients connect to.
pub const DEFAULT_SOCKET_PATH: &str = "/run/kmodd.sock";

/// Modules named here are never loaded.
pub const DEFAULT_BLACKLIST_PATH: &str = "/etc/kmodd.blacklist";

/// Upper bound on a request payload (a module name or alias), in bytes.
pub const MAX_REQUEST_LEN: usize = 2047;

#[derive(Debug, Clone)]
pub struct Config {
    /// Unix socket the daemon listens on.
    pub socket_path: PathBuf,
    /// Explicit module tree override; `None` means the running kernel's
    /// `/lib/modules/<release>`.
    pub module_root: Option<PathBuf>,
    /// Blacklist file; missing file means an empty blacklist.
    pub blacklist_path: PathBuf,
    /// Log destination for the daemon. Without one, a daemonized server's
    /// stderr ends up on /dev/null and its log entries are discarded.
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Self {
        Self {
            socket_path: env_path("KMODD_SOCKET")
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            module_root: env_path("KMODD_MODULE_ROOT"),
            blacklist_path: env_path("KMODD_BLACKLIST")
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BLACKLIST_PATH)),
            log_file: env_path("KMODD_LOG_FILE"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            module_root: None,
            blacklist_path: PathBuf::from(DEFAULT_BLACKLIST_PATH),
            log_file: None,
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
