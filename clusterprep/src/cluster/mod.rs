//! Cluster description consumed by the setup stages.

mod credentials;
mod metadata;

pub use credentials::Credentials;
pub use metadata::{ClusterMetadata, NodeMetadata};
