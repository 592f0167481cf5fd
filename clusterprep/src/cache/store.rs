//! Marker storage backends.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::core::StageDigest;
use crate::errors::SetupError;

static NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").ok());

/// Checks that a name is safe to use as a single path component.
pub(crate) fn validate_name(kind: &'static str, value: &str) -> Result<(), SetupError> {
    let valid = NAME_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(value));
    if valid {
        Ok(())
    } else {
        Err(SetupError::InvalidName {
            kind,
            value: value.to_string(),
        })
    }
}

/// Identifies one marker: (cluster, node, stage).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarkerKey {
    cluster: String,
    node: String,
    stage: String,
}

impl MarkerKey {
    /// Creates a key, validating each component.
    pub fn new(
        cluster: impl Into<String>,
        node: impl Into<String>,
        stage: impl Into<String>,
    ) -> Result<Self, SetupError> {
        let key = Self {
            cluster: cluster.into(),
            node: node.into(),
            stage: stage.into(),
        };
        validate_name("cluster", &key.cluster)?;
        validate_name("node", &key.node)?;
        validate_name("stage", &key.stage)?;
        Ok(key)
    }

    /// Cluster name.
    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Node id.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }
}

/// Persisted record of the last successful run of a stage on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMarker {
    /// Digest of the stage content that succeeded.
    pub digest: StageDigest,
    /// When the marker was written.
    pub updated_at: DateTime<Utc>,
}

impl CacheMarker {
    /// Creates a marker stamped with the current time.
    #[must_use]
    pub fn new(digest: StageDigest) -> Self {
        Self {
            digest,
            updated_at: Utc::now(),
        }
    }
}

/// Storage for cache markers.
///
/// Reads and writes must be atomic per key: a reader sees either the old
/// marker or the new one, never a partial write.
pub trait MarkerStore: Send + Sync {
    /// Reads a marker. `Ok(None)` when absent or unreadable.
    fn read(&self, key: &MarkerKey) -> Result<Option<CacheMarker>, SetupError>;

    /// Writes or replaces a marker.
    fn write(&self, key: &MarkerKey, marker: &CacheMarker) -> Result<(), SetupError>;

    /// Removes a marker so the stage runs again.
    fn remove(&self, key: &MarkerKey) -> Result<(), SetupError>;

    /// Removes every marker of a cluster.
    fn clear_cluster(&self, cluster: &str) -> Result<(), SetupError>;
}

/// Marker store backed by one JSON file per key:
/// `<root>/<cluster>/<node>/<stage>.json`.
#[derive(Debug, Clone)]
pub struct FileMarkerStore {
    root: PathBuf,
}

impl FileMarkerStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the marker for `key`.
    #[must_use]
    pub fn marker_path(&self, key: &MarkerKey) -> PathBuf {
        self.root
            .join(&key.cluster)
            .join(&key.node)
            .join(format!("{}.json", key.stage))
    }
}

impl MarkerStore for FileMarkerStore {
    fn read(&self, key: &MarkerKey) -> Result<Option<CacheMarker>, SetupError> {
        let path = self.marker_path(key);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SetupError::marker(path, e)),
        };
        match serde_json::from_str(&contents) {
            Ok(marker) => Ok(Some(marker)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Ignoring unreadable cache marker"
                );
                Ok(None)
            }
        }
    }

    fn write(&self, key: &MarkerKey, marker: &CacheMarker) -> Result<(), SetupError> {
        let path = self.marker_path(key);
        let dir = path
            .parent()
            .ok_or_else(|| SetupError::marker(&path, "marker path has no parent"))?;
        std::fs::create_dir_all(dir).map_err(|e| SetupError::marker(&path, e))?;

        let json = serde_json::to_vec_pretty(marker)
            .map_err(|e| SetupError::Serialization(e.to_string()))?;
        let mut staged =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| SetupError::marker(&path, e))?;
        staged
            .write_all(&json)
            .and_then(|()| staged.as_file().sync_all())
            .map_err(|e| SetupError::marker(&path, e))?;
        staged
            .persist(&path)
            .map_err(|e| SetupError::marker(&path, e.error))?;
        Ok(())
    }

    fn remove(&self, key: &MarkerKey) -> Result<(), SetupError> {
        let path = self.marker_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SetupError::marker(path, e)),
        }
    }

    fn clear_cluster(&self, cluster: &str) -> Result<(), SetupError> {
        validate_name("cluster", cluster)?;
        let dir = self.root.join(cluster);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SetupError::marker(dir, e)),
        }
    }
}

/// In-memory marker store.
#[derive(Debug, Default)]
pub struct InMemoryMarkerStore {
    entries: DashMap<MarkerKey, CacheMarker>,
}

impl InMemoryMarkerStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MarkerStore for InMemoryMarkerStore {
    fn read(&self, key: &MarkerKey) -> Result<Option<CacheMarker>, SetupError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn write(&self, key: &MarkerKey, marker: &CacheMarker) -> Result<(), SetupError> {
        self.entries.insert(key.clone(), marker.clone());
        Ok(())
    }

    fn remove(&self, key: &MarkerKey) -> Result<(), SetupError> {
        self.entries.remove(key);
        Ok(())
    }

    fn clear_cluster(&self, cluster: &str) -> Result<(), SetupError> {
        self.entries.retain(|key, _| key.cluster != cluster);
        Ok(())
    }
}
