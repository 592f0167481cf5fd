//! Lifecycle of one (node, stage) unit.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one node's stage execution within a dispatch.
///
/// `Init -> CacheCheck -> {Skipped | Executing}`, then
/// `Executing -> {Succeeded | Retrying -> Executing | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Submitted, not started.
    Init,
    /// Comparing the stored marker with the stage digest.
    CacheCheck,
    /// Marker matched; nothing was run.
    Skipped,
    /// An attempt is running.
    Executing,
    /// An attempt failed and the next one is scheduled.
    Retrying,
    /// The stage completed and its marker was written.
    Succeeded,
    /// Every attempt failed.
    Failed,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Init
    }
}

impl NodeState {
    /// Returns true for states a unit never leaves.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Succeeded | Self::Failed)
    }

    /// Returns true for the failed state.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Returns true when the node ended up configured.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Skipped | Self::Succeeded)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::CacheCheck => write!(f, "cache_check"),
            Self::Skipped => write!(f, "skipped"),
            Self::Executing => write!(f, "executing"),
            Self::Retrying => write!(f, "retrying"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(NodeState::Skipped.is_terminal());
        assert!(NodeState::Succeeded.is_terminal());
        assert!(NodeState::Failed.is_terminal());
        assert!(!NodeState::Executing.is_terminal());
        assert!(!NodeState::Retrying.is_terminal());
    }

    #[test]
    fn test_display_matches_serde() {
        let json = serde_json::to_string(&NodeState::CacheCheck).unwrap();
        assert_eq!(json, "\"cache_check\"");
        assert_eq!(NodeState::CacheCheck.to_string(), "cache_check");
    }
}
