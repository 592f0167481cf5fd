//! Setup configuration.
//!
//! A [`SetupConfig`] is built once per process and threaded through the
//! dispatcher and every stage. All fields have defaults, so a config file
//! only needs to name what it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::engine::RetryConfig;
use crate::errors::SetupError;

/// Upper bound for [`SetupConfig::max_workers`].
pub const MAX_WORKERS: usize = 4096;

/// Upper bound for the capped retry backoff, in milliseconds (one hour).
pub const MAX_BACKOFF_MS: u64 = 3_600_000;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Maximum nodes worked on at the same time.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Reach nodes through their private address only.
    #[serde(default)]
    pub use_internal_ips: bool,
    /// Root of the per-node log tree.
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,
    /// Root of the cache marker tree.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    /// Per-node retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Control-plane daemon settings.
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    /// Watchdog agent settings.
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

fn default_max_workers() -> usize {
    32
}

fn state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join(".clusterprep")
}

fn default_log_root() -> PathBuf {
    state_dir().join("logs")
}

fn default_cache_root() -> PathBuf {
    state_dir().join("generated")
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            use_internal_ips: false,
            log_root: default_log_root(),
            cache_root: default_cache_root(),
            retry: RetryConfig::default(),
            control_plane: ControlPlaneConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl SetupConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, SetupError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SetupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SetupError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Sets the worker pool width.
    #[must_use]
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Uses private addresses only.
    #[must_use]
    pub fn with_internal_ips(mut self, internal: bool) -> Self {
        self.use_internal_ips = internal;
        self
    }

    /// Sets the log root.
    #[must_use]
    pub fn with_log_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.log_root = root.into();
        self
    }

    /// Sets the cache marker root.
    #[must_use]
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the control-plane settings.
    #[must_use]
    pub fn with_control_plane(mut self, control_plane: ControlPlaneConfig) -> Self {
        self.control_plane = control_plane;
        self
    }

    /// Sets the watchdog settings.
    #[must_use]
    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Checks values that would make setup impossible.
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.max_workers == 0 {
            return Err(SetupError::Config("max_workers must be at least 1".to_string()));
        }
        if self.max_workers > MAX_WORKERS {
            return Err(SetupError::Config(format!(
                "max_workers must be at most {MAX_WORKERS}, got {}",
                self.max_workers
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(SetupError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(SetupError::Config(
                "retry.multiplier must be a finite number of at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(SetupError::Config(
                "retry.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }
        let cap = self
            .retry
            .initial_backoff_ms
            .checked_mul(u64::from(self.retry.max_backoff_factor));
        if cap.map_or(true, |ms| ms > MAX_BACKOFF_MS) {
            return Err(SetupError::Config(format!(
                "retry.initial_backoff_ms * retry.max_backoff_factor must not exceed {MAX_BACKOFF_MS} ms"
            )));
        }
        self.control_plane.validate()
    }
}

/// Control-plane daemon settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Daemon CLI.
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Port the head listens on for workers.
    #[serde(default = "default_primary_port")]
    pub primary_port: u16,
    /// Dashboard port.
    #[serde(default = "default_dashboard_port")]
    pub dashboard_port: u16,
    /// Object manager port.
    #[serde(default = "default_object_manager_port")]
    pub object_manager_port: u16,
    /// Daemon temp dir.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    /// File on the head node holding the port assignment.
    #[serde(default = "default_port_file")]
    pub port_file: String,
    /// Open-file limit requested for daemon processes.
    #[serde(default = "default_fd_limit")]
    pub fd_limit: u64,
    /// `pgrep -f` pattern matching daemon processes.
    #[serde(default = "default_process_pattern")]
    pub process_pattern: String,
    /// Variables removed from the daemon's environment.
    #[serde(default = "default_scrubbed_env")]
    pub scrubbed_env: Vec<String>,
}

fn default_binary() -> String {
    "ray".to_string()
}

fn default_primary_port() -> u16 {
    6380
}

fn default_dashboard_port() -> u16 {
    8266
}

fn default_object_manager_port() -> u16 {
    8076
}

fn default_temp_dir() -> String {
    "/tmp/ray_clusterprep".to_string()
}

fn default_port_file() -> String {
    "~/.clusterprep/ray_port.json".to_string()
}

fn default_fd_limit() -> u64 {
    1_048_576
}

fn default_process_pattern() -> String {
    "raylet/raylet".to_string()
}

fn default_scrubbed_env() -> Vec<String> {
    vec![
        "AWS_ACCESS_KEY_ID".to_string(),
        "AWS_SECRET_ACCESS_KEY".to_string(),
    ]
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            primary_port: default_primary_port(),
            dashboard_port: default_dashboard_port(),
            object_manager_port: default_object_manager_port(),
            temp_dir: default_temp_dir(),
            port_file: default_port_file(),
            fd_limit: default_fd_limit(),
            process_pattern: default_process_pattern(),
            scrubbed_env: default_scrubbed_env(),
        }
    }
}

impl ControlPlaneConfig {
    fn validate(&self) -> Result<(), SetupError> {
        let ports = [self.primary_port, self.dashboard_port, self.object_manager_port];
        if ports.contains(&0) {
            return Err(SetupError::Config(
                "control-plane ports must be non-zero".to_string(),
            ));
        }
        if ports[0] == ports[1] || ports[0] == ports[2] || ports[1] == ports[2] {
            return Err(SetupError::Config(
                "control-plane ports must be distinct".to_string(),
            ));
        }
        Ok(())
    }
}

/// Watchdog agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Version the head node should run.
    #[serde(default = "default_watchdog_version")]
    pub expected_version: String,
    /// Prints the running agent's version; must be fast.
    #[serde(default = "default_version_command")]
    pub version_command: String,
    /// Stops any running agent and starts the expected version.
    #[serde(default = "default_restart_command")]
    pub restart_command: String,
}

fn default_watchdog_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_version_command() -> String {
    "cat ~/.clusterprep/watchdog/VERSION 2> /dev/null".to_string()
}

fn default_restart_command() -> String {
    "(pkill -f clusterprep-watchdog || true); \
     nohup clusterprep-watchdog >> ~/.clusterprep/watchdog.log 2>&1 &"
        .to_string()
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            expected_version: default_watchdog_version(),
            version_command: default_version_command(),
            restart_command: default_restart_command(),
        }
    }
}
