//! Setup stages.
//!
//! Each stage is a method on [`ClusterSetup`] that builds its instructions,
//! picks its target nodes and hands a per-node operation to the
//! [`ParallelDispatcher`]. Stages with a digest are skipped on nodes whose
//! marker already matches; the others run every time.

mod control_plane;
mod dependencies;
mod file_sync;
mod watchdog;

mod scenario_tests;

pub use control_plane::{
    head_start_instructions, worker_start_plan, WorkerStartMode, WorkerStartPlan,
};
pub use file_sync::{expand_local_path, file_sync_digest, remote_parent};

use std::sync::Arc;

use crate::cache::validate_name;
use crate::cluster::{ClusterMetadata, Credentials, NodeMetadata};
use crate::engine::{DispatchRequest, ParallelDispatcher};
use crate::errors::SetupError;

/// Stage name of the dependency install.
pub const DEPENDENCIES_STAGE: &str = "internal_dependencies_setup";
/// Stage name of the control-plane bootstrap, head and workers alike.
pub const CONTROL_PLANE_STAGE: &str = "ray_cluster";
/// Stage name of the watchdog agent start.
pub const WATCHDOG_STAGE: &str = "watchdog";
/// Stage name of the file sync.
pub const FILE_SYNC_STAGE: &str = "internal_file_mounts";

/// Runs setup stages against one cluster.
#[derive(Debug, Clone)]
pub struct ClusterSetup {
    dispatcher: Arc<ParallelDispatcher>,
    cluster_name: String,
    metadata: ClusterMetadata,
    credentials: Credentials,
}

impl ClusterSetup {
    /// Creates a setup driver for `cluster_name`.
    pub fn new(
        dispatcher: Arc<ParallelDispatcher>,
        cluster_name: impl Into<String>,
        metadata: ClusterMetadata,
        credentials: Credentials,
    ) -> Result<Self, SetupError> {
        let cluster_name = cluster_name.into();
        validate_name("cluster", &cluster_name)?;
        Ok(Self {
            dispatcher,
            cluster_name,
            metadata,
            credentials,
        })
    }

    /// Cluster name.
    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Cluster metadata.
    #[must_use]
    pub fn metadata(&self) -> &ClusterMetadata {
        &self.metadata
    }

    /// The dispatcher stages run on.
    #[must_use]
    pub fn dispatcher(&self) -> &ParallelDispatcher {
        &self.dispatcher
    }

    fn head(&self) -> Result<&NodeMetadata, SetupError> {
        self.metadata.head().ok_or_else(|| SetupError::NoHeadNode {
            cluster: self.cluster_name.clone(),
        })
    }

    fn request<I>(&self, stage: &str, nodes: I) -> DispatchRequest
    where
        I: IntoIterator<Item = NodeMetadata>,
    {
        DispatchRequest::new(&self.cluster_name, stage, self.credentials.clone()).with_nodes(nodes)
    }
}
