//! One-way push of local files and directories to every node.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{ClusterSetup, FILE_SYNC_STAGE};
use crate::core::{quote_remote_path, Instruction, StageDigest};
use crate::engine::DispatchReport;
use crate::errors::SetupError;

/// Directory part of a remote path.
///
/// `"~/a/b.txt"` gives `"~/a"`, `"/b.txt"` gives `"/"`, a bare name gives `"."`.
#[must_use]
pub fn remote_parent(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => ".",
    }
}

/// Expands a leading `~` against `$HOME`.
#[must_use]
pub fn expand_local_path(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Digest of a mount table plus the caller's hash of the pushed content.
#[must_use]
pub fn file_sync_digest(mounts: &BTreeMap<String, PathBuf>, content_hash: &str) -> StageDigest {
    let sources: Vec<(&str, String)> = mounts
        .iter()
        .map(|(destination, source)| (destination.as_str(), source.to_string_lossy().into_owned()))
        .collect();
    StageDigest::from_parts(
        std::iter::once(("content_hash", content_hash))
            .chain(sources.iter().map(|(dst, src)| (*dst, src.as_str()))),
    )
}

#[derive(Debug, Clone)]
struct SyncStep {
    source: PathBuf,
    destination: String,
    mkdir: Instruction,
}

impl SyncStep {
    fn new(destination: &str, source: &Path) -> Self {
        let source = expand_local_path(source);
        let target_dir = if source.is_file() {
            remote_parent(destination)
        } else {
            destination
        };
        Self {
            mkdir: Instruction::new(format!("mkdir -p {}", quote_remote_path(target_dir))),
            source,
            destination: destination.to_string(),
        }
    }
}

impl ClusterSetup {
    /// Pushes every `(destination, source)` mount to every node.
    ///
    /// Nodes whose marker matches the mount table and `content_hash` are
    /// skipped.
    pub async fn sync_files(
        &self,
        mounts: &BTreeMap<String, PathBuf>,
        content_hash: &str,
    ) -> Result<DispatchReport, SetupError> {
        let digest = file_sync_digest(mounts, content_hash);
        let steps: Vec<SyncStep> = mounts
            .iter()
            .map(|(destination, source)| SyncStep::new(destination, source))
            .collect();
        let request = self
            .request(FILE_SYNC_STAGE, self.metadata.nodes().to_vec())
            .with_digest(digest);

        self.dispatcher
            .dispatch(request, move |task| {
                for step in &steps {
                    task.run_checked(
                        &step.mkdir,
                        &format!(
                            "Failed to run command before rsync {} -> {}.",
                            step.source.display(),
                            step.destination
                        ),
                    )?;
                    task.transfer(&step.source, &step.destination)?;
                }
                Ok(())
            })
            .await
    }
}
