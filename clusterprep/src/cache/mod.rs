//! Per-node stage markers and the gate that consults them.
//!
//! A marker records the digest of the last successful run of a stage on a
//! node. [`CacheGate`] skips the stage when the stored digest matches and
//! writes the marker only after the stage succeeds.

mod gate;
mod store;

pub use gate::{CacheGate, GateDecision};
pub(crate) use store::validate_name;
pub use store::{CacheMarker, FileMarkerStore, InMemoryMarkerStore, MarkerKey, MarkerStore};
