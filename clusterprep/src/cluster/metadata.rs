//! Node and cluster metadata.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::cache::validate_name;
use crate::errors::SetupError;

/// One reachable node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Provider instance id.
    pub instance_id: String,
    /// Public address, if the node has one.
    #[serde(default)]
    pub public_ip: Option<String>,
    /// Address inside the cluster network.
    pub private_ip: String,
    /// Whether this node is the head.
    #[serde(default)]
    pub is_head: bool,
}

impl NodeMetadata {
    /// Creates a worker node.
    #[must_use]
    pub fn new(instance_id: impl Into<String>, private_ip: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            public_ip: None,
            private_ip: private_ip.into(),
            is_head: false,
        }
    }

    /// Sets the public address.
    #[must_use]
    pub fn with_public_ip(mut self, ip: impl Into<String>) -> Self {
        self.public_ip = Some(ip.into());
        self
    }

    /// Marks the node as head.
    #[must_use]
    pub fn head(mut self) -> Self {
        self.is_head = true;
        self
    }

    /// Address used to reach the node.
    ///
    /// The public address is preferred unless `use_internal_ips` is set;
    /// the private address is the fallback.
    #[must_use]
    pub fn feasible_address(&self, use_internal_ips: bool) -> &str {
        if use_internal_ips {
            return &self.private_ip;
        }
        self.public_ip.as_deref().unwrap_or(&self.private_ip)
    }
}

/// All nodes of one cluster, in provider order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    nodes: Vec<NodeMetadata>,
}

impl ClusterMetadata {
    /// Creates cluster metadata, rejecting duplicate ids and multiple heads.
    ///
    /// Instance ids name per-node log and marker directories, so each must
    /// be a single plain path component.
    pub fn new(nodes: Vec<NodeMetadata>) -> Result<Self, SetupError> {
        let mut seen = HashSet::new();
        for node in &nodes {
            validate_name("node", &node.instance_id)?;
            if !seen.insert(node.instance_id.as_str()) {
                return Err(SetupError::InvalidCluster(format!(
                    "duplicate instance id '{}'",
                    node.instance_id
                )));
            }
        }
        let heads = nodes.iter().filter(|n| n.is_head).count();
        if heads > 1 {
            return Err(SetupError::InvalidCluster(format!(
                "expected at most one head node, found {heads}"
            )));
        }
        Ok(Self { nodes })
    }

    /// All nodes.
    #[must_use]
    pub fn nodes(&self) -> &[NodeMetadata] {
        &self.nodes
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true when the cluster has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The head node, if any.
    #[must_use]
    pub fn head(&self) -> Option<&NodeMetadata> {
        self.nodes.iter().find(|n| n.is_head)
    }

    /// Id of the head node, if any.
    #[must_use]
    pub fn head_instance_id(&self) -> Option<&str> {
        self.head().map(|n| n.instance_id.as_str())
    }

    /// All non-head nodes.
    #[must_use]
    pub fn workers(&self) -> Vec<&NodeMetadata> {
        self.nodes.iter().filter(|n| !n.is_head).collect()
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn get(&self, instance_id: &str) -> Option<&NodeMetadata> {
        self.nodes.iter().find(|n| n.instance_id == instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> ClusterMetadata {
        ClusterMetadata::new(vec![
            NodeMetadata::new("i-head", "10.0.0.1")
                .with_public_ip("34.1.1.1")
                .head(),
            NodeMetadata::new("i-w1", "10.0.0.2"),
            NodeMetadata::new("i-w2", "10.0.0.3").with_public_ip("34.1.1.3"),
        ])
        .unwrap()
    }

    #[test]
    fn test_feasible_address_prefers_public() {
        let c = cluster();
        assert_eq!(c.get("i-head").unwrap().feasible_address(false), "34.1.1.1");
        assert_eq!(c.get("i-w1").unwrap().feasible_address(false), "10.0.0.2");
        assert_eq!(c.get("i-w2").unwrap().feasible_address(true), "10.0.0.3");
    }

    #[test]
    fn test_head_and_workers() {
        let c = cluster();
        assert_eq!(c.head_instance_id(), Some("i-head"));
        let workers: Vec<_> = c.workers().iter().map(|n| n.instance_id.as_str()).collect();
        assert_eq!(workers, vec!["i-w1", "i-w2"]);
    }

    #[test]
    fn test_rejects_two_heads() {
        let err = ClusterMetadata::new(vec![
            NodeMetadata::new("a", "10.0.0.1").head(),
            NodeMetadata::new("b", "10.0.0.2").head(),
        ])
        .unwrap_err();
        assert!(matches!(err, SetupError::InvalidCluster(_)));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let err = ClusterMetadata::new(vec![
            NodeMetadata::new("a", "10.0.0.1"),
            NodeMetadata::new("a", "10.0.0.2"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_path_like_ids() {
        for id in ["/etc", "../outside", "a/b", ""] {
            let err = ClusterMetadata::new(vec![NodeMetadata::new(id, "10.0.0.1")]).unwrap_err();
            assert!(
                matches!(err, SetupError::InvalidName { kind: "node", .. }),
                "{id:?} was accepted"
            );
        }
    }

    #[test]
    fn test_headless_cluster_is_allowed() {
        let c = ClusterMetadata::new(vec![NodeMetadata::new("solo", "10.0.0.9")]).unwrap();
        assert!(c.head().is_none());
        assert_eq!(c.len(), 1);
    }
}
