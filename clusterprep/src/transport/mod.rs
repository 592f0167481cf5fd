//! Remote execution and file transfer.
//!
//! The engine talks to nodes only through [`CommandRunner`]. Runners are
//! created per node address by a [`RunnerFactory`]; [`SshRunnerFactory`]
//! is the production implementation.

mod ssh;

pub use ssh::{SshCommandRunner, SshRunnerFactory};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cluster::Credentials;
use crate::core::{ExecutionResult, Instruction};
use crate::errors::SetupError;

/// Options for one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// File that receives the command's output.
    pub log_path: PathBuf,
    /// Also echo output lines to the local log as they arrive.
    pub stream_logs: bool,
    /// Capture stdout/stderr into the returned result.
    pub require_outputs: bool,
}

impl RunOptions {
    /// Output goes to `log_path` only and is captured.
    #[must_use]
    pub fn logged(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            stream_logs: false,
            require_outputs: true,
        }
    }
}

/// Blocking command execution against one node.
///
/// A non-zero exit is a normal [`ExecutionResult`]; `Err` is reserved for
/// failures to reach the node or spawn the command.
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Runs one instruction.
    fn run(
        &self,
        instruction: &Instruction,
        options: &RunOptions,
    ) -> Result<ExecutionResult, SetupError>;

    /// Pushes a local file or directory to `destination`, overwriting it.
    fn transfer(
        &self,
        source: &Path,
        destination: &str,
        log_path: &Path,
    ) -> Result<(), SetupError>;
}

/// Creates runners for node addresses.
pub trait RunnerFactory: Send + Sync {
    /// Returns a runner connected to `address`.
    fn runner(&self, address: &str, credentials: &Credentials) -> Arc<dyn CommandRunner>;
}
