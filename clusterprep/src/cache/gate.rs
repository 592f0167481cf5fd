//! Skip-if-unchanged gate around a stage operation.

use super::{CacheMarker, MarkerKey, MarkerStore};
use crate::core::StageDigest;
use crate::errors::SetupError;

/// What the gate did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The stored digest matched; the operation was not called.
    Skipped,
    /// The operation ran and succeeded; the marker was written.
    Executed,
}

/// Runs an operation unless the stored marker already matches its digest.
pub struct CacheGate<'a> {
    store: &'a dyn MarkerStore,
}

impl<'a> CacheGate<'a> {
    /// Creates a gate over `store`.
    #[must_use]
    pub fn new(store: &'a dyn MarkerStore) -> Self {
        Self { store }
    }

    /// Returns true when the stored marker for `key` equals `digest`.
    pub fn is_current(&self, key: &MarkerKey, digest: &StageDigest) -> Result<bool, SetupError> {
        Ok(self
            .store
            .read(key)?
            .is_some_and(|marker| &marker.digest == digest))
    }

    /// Runs `operation` if needed.
    ///
    /// The marker is written only after `operation` returns `Ok`. On error it
    /// is left as it was, so the next call starts over.
    pub fn run<F>(
        &self,
        key: &MarkerKey,
        digest: &StageDigest,
        operation: F,
    ) -> Result<GateDecision, SetupError>
    where
        F: FnOnce() -> Result<(), SetupError>,
    {
        if self.is_current(key, digest)? {
            tracing::debug!(
                cluster = key.cluster(),
                node = key.node(),
                stage = key.stage(),
                "Stage digest unchanged, skipping"
            );
            return Ok(GateDecision::Skipped);
        }

        operation()?;
        self.store.write(key, &CacheMarker::new(digest.clone()))?;
        Ok(GateDecision::Executed)
    }
}
