//! # Clusterprep
//!
//! Cached, retried, parallel setup of freshly provisioned cluster nodes.
//!
//! Clusterprep runs named setup stages against every node of a cluster over
//! a remote transport:
//!
//! - **Parallel dispatch**: one unit of work per node, bounded by a worker pool
//! - **Retries**: every node unit is retried with jittered exponential backoff
//! - **Per-node caching**: a stage whose content digest is unchanged is skipped
//! - **Structured instructions**: commands carry their environment as data
//! - **Event-driven observability**: every node state transition is emitted
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use clusterprep::prelude::*;
//! use std::sync::Arc;
//!
//! let config = SetupConfig::from_file("setup.json")?;
//! let markers = Arc::new(FileMarkerStore::new(config.cache_root.clone()));
//! let dispatcher = ParallelDispatcher::new(config, Arc::new(SshRunnerFactory), markers)
//!     .with_events(Arc::new(LoggingEventSink::info()));
//!
//! let setup = ClusterSetup::new(Arc::new(dispatcher), "demo", metadata, credentials)?;
//! setup.internal_dependencies_setup(vec![Instruction::new("pip install ray")]).await?;
//! setup.start_control_plane_head(None).await?;
//! setup.start_control_plane_workers(WorkerStartMode::NoRestart, None).await?;
//! setup.start_watchdog().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod cluster;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod observability;
pub mod stages;
pub mod testing;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{
        CacheGate, CacheMarker, FileMarkerStore, GateDecision, InMemoryMarkerStore, MarkerKey,
        MarkerStore,
    };
    pub use crate::cluster::{ClusterMetadata, Credentials, NodeMetadata};
    pub use crate::config::{ControlPlaneConfig, SetupConfig, WatchdogConfig};
    pub use crate::core::{ExecutionResult, Instruction, NodeOutcome, NodeState, StageDigest};
    pub use crate::engine::{
        retry_blocking, DispatchReport, DispatchRequest, NodeTask, ParallelDispatcher,
        RetryConfig,
    };
    pub use crate::errors::{CommandFailure, DispatchFailure, SetupError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::stages::{ClusterSetup, WorkerStartMode};
    pub use crate::transport::{
        CommandRunner, RunOptions, RunnerFactory, SshCommandRunner, SshRunnerFactory,
    };
}
