//! Error types for cluster setup.
//!
//! Every failure that can leave a node unconfigured is a [`SetupError`].
//! Command failures keep the captured output so the caller can diagnose
//! the node without opening its log file.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::core::NodeOutcome;

/// The main error type for setup operations.
#[derive(Debug, Error)]
pub enum SetupError {
    /// A remote command exited with a non-zero code.
    #[error("{0}")]
    Command(#[from] CommandFailure),

    /// The transport could not reach or talk to a node.
    #[error("Transport error on {address}: {message}")]
    Transport {
        /// Address the runner was connected to.
        address: String,
        /// What went wrong.
        message: String,
    },

    /// Pushing a local path to a node failed.
    #[error("Failed to sync {source_path} -> {destination}: {message}")]
    Transfer {
        /// Local source path.
        source_path: PathBuf,
        /// Remote destination path.
        destination: String,
        /// What went wrong.
        message: String,
    },

    /// Reading or writing a cache marker failed.
    #[error("Cache marker error at {}: {message}", path.display())]
    Marker {
        /// Path of the marker file.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// A cluster, node or stage name cannot be used as a path component.
    #[error("Invalid {kind} name '{value}'")]
    InvalidName {
        /// Which kind of name was rejected.
        kind: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The cluster metadata is inconsistent.
    #[error("Invalid cluster metadata: {0}")]
    InvalidCluster(String),

    /// A head-only stage was requested on a cluster without a head node.
    #[error("Cluster '{cluster}' has no head node")]
    NoHeadNode {
        /// The cluster name.
        cluster: String,
    },

    /// One or more nodes failed during a dispatch round.
    #[error("{0}")]
    Dispatch(#[from] DispatchFailure),

    /// A node task panicked on its worker thread.
    #[error("Task for node '{node_id}' panicked: {message}")]
    TaskPanicked {
        /// The node the task was running for.
        node_id: String,
        /// Panic or join error message.
        message: String,
    },

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SetupError {
    /// Creates a transport error.
    #[must_use]
    pub fn transport(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Creates a marker store error.
    #[must_use]
    pub fn marker(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self::Marker {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Returns the captured command failure, looking through dispatch failures.
    #[must_use]
    pub fn command_failure(&self) -> Option<&CommandFailure> {
        match self {
            Self::Command(failure) => Some(failure),
            Self::Dispatch(dispatch) => dispatch.first.command_failure(),
            _ => None,
        }
    }
}

/// A remote command that exited with a non-zero code, with its output.
#[derive(Debug, Clone, Error)]
#[error(
    "{description} (exit code {exit_code}). Error: ===== stdout ===== \n{stdout}\n===== stderr ====={stderr}"
)]
pub struct CommandFailure {
    /// What the command was supposed to do.
    pub description: String,
    /// The rendered command line.
    pub command: String,
    /// The exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Failure of one dispatch round.
///
/// `first` is the failure of the earliest-submitted failing node and is
/// exposed as [`std::error::Error::source`]. `outcomes` holds every node's
/// terminal state, failed or not, in submission order.
#[derive(Debug)]
pub struct DispatchFailure {
    /// The stage that was dispatched.
    pub stage: String,
    /// Node whose failure is carried in `first`.
    pub first_node: String,
    /// The representative failure.
    pub first: Box<SetupError>,
    /// Terminal outcome of every node.
    pub outcomes: Vec<NodeOutcome>,
}

impl DispatchFailure {
    /// Ids of all nodes that ended in a failed state.
    #[must_use]
    pub fn failed_nodes(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.state.is_failure())
            .map(|o| o.node_id.as_str())
            .collect()
    }
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failed_nodes();
        write!(
            f,
            "Stage '{}' failed on {} of {} nodes ({}). First failure on '{}': {}",
            self.stage,
            failed.len(),
            self.outcomes.len(),
            failed.join(", "),
            self.first_node,
            self.first
        )
    }
}

impl std::error::Error for DispatchFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.first.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeState;
    use std::error::Error as _;

    fn failure() -> CommandFailure {
        CommandFailure {
            description: "Failed to run setup commands on an instance.".to_string(),
            command: "false".to_string(),
            exit_code: 1,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        }
    }

    fn outcome(node: &str, state: NodeState) -> NodeOutcome {
        NodeOutcome {
            node_id: node.to_string(),
            address: "10.0.0.1".to_string(),
            state,
            attempts: 1,
            duration_ms: 0,
            log_path: PathBuf::from("/tmp/x.log"),
            error: None,
        }
    }

    #[test]
    fn test_command_failure_message_carries_output() {
        let err = SetupError::from(failure());
        let message = err.to_string();

        assert!(message.contains("exit code 1"));
        assert!(message.contains("out"));
        assert!(message.contains("err"));
    }

    #[test]
    fn test_dispatch_failure_lists_failed_nodes() {
        let dispatch = DispatchFailure {
            stage: "setup".to_string(),
            first_node: "b".to_string(),
            first: Box::new(SetupError::from(failure())),
            outcomes: vec![
                outcome("a", NodeState::Succeeded),
                outcome("b", NodeState::Failed),
                outcome("c", NodeState::Failed),
            ],
        };

        assert_eq!(dispatch.failed_nodes(), vec!["b", "c"]);
        let message = dispatch.to_string();
        assert!(message.contains("2 of 3 nodes (b, c)"));
        assert!(dispatch.source().is_some());
    }

    #[test]
    fn test_command_failure_found_through_dispatch() {
        let err = SetupError::from(DispatchFailure {
            stage: "setup".to_string(),
            first_node: "a".to_string(),
            first: Box::new(SetupError::from(failure())),
            outcomes: vec![outcome("a", NodeState::Failed)],
        });

        assert_eq!(err.command_failure().map(|f| f.exit_code), Some(1));
    }
}
