//! Connection parameters handed to the transport.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How to log in to cluster nodes.
///
/// The engine passes this through untouched; only transports read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Login user.
    pub ssh_user: String,
    /// Private key file.
    #[serde(default)]
    pub ssh_private_key: Option<PathBuf>,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional `ProxyCommand`.
    #[serde(default)]
    pub ssh_proxy_command: Option<String>,
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    30
}

impl Credentials {
    /// Creates credentials for a user with default port and timeout.
    #[must_use]
    pub fn new(ssh_user: impl Into<String>) -> Self {
        Self {
            ssh_user: ssh_user.into(),
            ssh_private_key: None,
            port: default_port(),
            ssh_proxy_command: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    /// Sets the private key.
    #[must_use]
    pub fn with_private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_private_key = Some(path.into());
        self
    }

    /// Sets the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the proxy command.
    #[must_use]
    pub fn with_proxy_command(mut self, command: impl Into<String>) -> Self {
        self.ssh_proxy_command = Some(command.into());
        self
    }
}
