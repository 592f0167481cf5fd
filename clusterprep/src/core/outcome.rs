//! Per-node result of a dispatch round.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::NodeState;

/// Terminal record of one node in one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutcome {
    /// Instance id of the node.
    pub node_id: String,
    /// Address the runner connected to.
    pub address: String,
    /// Terminal state.
    pub state: NodeState,
    /// Attempts made (zero when skipped).
    pub attempts: u32,
    /// Wall time spent on the node.
    pub duration_ms: u64,
    /// Where the node's output for this stage was written.
    pub log_path: PathBuf,
    /// Error message for failed nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
