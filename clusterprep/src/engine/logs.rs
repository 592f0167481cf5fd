//! Per-node log file layout: `<root>/<cluster>/<node>/<stage>.log`.

use std::path::{Path, PathBuf};

/// Where stage output for each node is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLayout {
    root: PathBuf,
}

impl LogLayout {
    /// Creates a layout under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one node's logs.
    #[must_use]
    pub fn node_dir(&self, cluster: &str, node: &str) -> PathBuf {
        self.root.join(cluster).join(node)
    }

    /// Log file for one node and stage.
    #[must_use]
    pub fn stage_log_path(&self, cluster: &str, node: &str, stage: &str) -> PathBuf {
        self.node_dir(cluster, node).join(format!("{stage}.log"))
    }

    /// Creates the directory that will hold `log_path`.
    pub fn prepare(log_path: &Path) -> std::io::Result<()> {
        match log_path.parent() {
            Some(dir) => std::fs::create_dir_all(dir),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_log_path() {
        let layout = LogLayout::new("/var/log/clusterprep");
        assert_eq!(
            layout.stage_log_path("demo", "i-1", "ray_cluster"),
            PathBuf::from("/var/log/clusterprep/demo/i-1/ray_cluster.log")
        );
    }

    #[test]
    fn test_prepare_creates_node_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = LogLayout::new(dir.path());
        let path = layout.stage_log_path("demo", "i-1", "setup");

        LogLayout::prepare(&path).unwrap();
        assert!(layout.node_dir("demo", "i-1").is_dir());
    }
}
