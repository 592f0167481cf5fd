//! Bounded fan-out of one stage across cluster nodes.
//!
//! Every node gets its own unit: cache check, then the retried operation,
//! on a blocking worker thread. A semaphore caps how many units run at once.
//! All units are submitted before any is awaited, and the dispatcher always
//! waits for every unit, so one node failing never cancels its siblings.

use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{info, warn};
use uuid::Uuid;

use super::{retry_blocking, LogLayout, RetryConfig};
use crate::cache::{validate_name, CacheGate, GateDecision, MarkerKey, MarkerStore};
use crate::cluster::{Credentials, NodeMetadata};
use crate::config::SetupConfig;
use crate::core::{ExecutionResult, Instruction, NodeOutcome, NodeState, StageDigest};
use crate::errors::{DispatchFailure, SetupError};
use crate::events::{EventSink, NoOpEventSink};
use crate::transport::{CommandRunner, RunOptions, RunnerFactory};

type Operation = dyn Fn(&NodeTask) -> Result<(), SetupError> + Send + Sync;

/// One stage to run across a set of nodes.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Cluster the nodes belong to.
    pub cluster_name: String,
    /// Stage name; also names the per-node log file.
    pub stage: String,
    /// Content digest. `None` runs the stage every time.
    pub digest: Option<StageDigest>,
    /// Target nodes, in submission order.
    pub nodes: Vec<NodeMetadata>,
    /// Handed to the runner factory.
    pub credentials: Credentials,
}

impl DispatchRequest {
    /// Creates a request with no nodes and no digest.
    #[must_use]
    pub fn new(
        cluster_name: impl Into<String>,
        stage: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            stage: stage.into(),
            digest: None,
            nodes: Vec::new(),
            credentials,
        }
    }

    /// Enables the cache gate with `digest`.
    #[must_use]
    pub fn with_digest(mut self, digest: StageDigest) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Sets the target nodes.
    #[must_use]
    pub fn with_nodes<I>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = NodeMetadata>,
    {
        self.nodes = nodes.into_iter().collect();
        self
    }

    /// Rejects names that cannot serve as a single log or marker path
    /// component.
    fn validate(&self) -> Result<(), SetupError> {
        validate_name("cluster", &self.cluster_name)?;
        validate_name("stage", &self.stage)?;
        self.nodes
            .iter()
            .try_for_each(|node| validate_name("node", &node.instance_id))
    }
}

/// What a per-node operation gets to work with.
pub struct NodeTask {
    cluster_name: String,
    stage: String,
    node: NodeMetadata,
    address: String,
    log_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl NodeTask {
    /// The node being configured.
    #[must_use]
    pub fn node(&self) -> &NodeMetadata {
        &self.node
    }

    /// Cluster name.
    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Address the runner is connected to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Log file for this node and stage.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Runs one instruction, logging to the node's stage log.
    pub fn run(&self, instruction: &Instruction) -> Result<ExecutionResult, SetupError> {
        self.runner
            .run(instruction, &RunOptions::logged(&self.log_path))
    }

    /// Runs one instruction and turns a non-zero exit into an error,
    /// unless the instruction tolerates failure.
    pub fn run_checked(
        &self,
        instruction: &Instruction,
        description: &str,
    ) -> Result<ExecutionResult, SetupError> {
        let result = self.run(instruction)?;
        if instruction.tolerate_failure {
            return Ok(result);
        }
        Ok(result.ensure_success(description, instruction)?)
    }

    /// Runs instructions in order, stopping at the first failure.
    pub fn run_sequence(
        &self,
        instructions: &[Instruction],
        description: &str,
    ) -> Result<(), SetupError> {
        for instruction in instructions {
            self.run_checked(instruction, description)?;
        }
        Ok(())
    }

    /// Pushes a local path to the node.
    pub fn transfer(&self, source: &Path, destination: &str) -> Result<(), SetupError> {
        self.runner.transfer(source, destination, &self.log_path)
    }
}

/// Result of a dispatch in which every node ended up configured.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    /// Id shared by all events of this dispatch.
    pub dispatch_id: Uuid,
    /// Stage name.
    pub stage: String,
    /// Per-node outcomes in submission order.
    pub outcomes: Vec<NodeOutcome>,
}

impl DispatchReport {
    /// A report for a dispatch that targeted no nodes.
    #[must_use]
    pub fn empty(stage: impl Into<String>) -> Self {
        Self {
            dispatch_id: Uuid::new_v4(),
            stage: stage.into(),
            outcomes: Vec::new(),
        }
    }

    /// Nodes on which the stage actually ran.
    #[must_use]
    pub fn executed(&self) -> usize {
        self.count(NodeState::Succeeded)
    }

    /// Nodes skipped by the cache gate.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(NodeState::Skipped)
    }

    /// Returns true when every node was a cache hit.
    #[must_use]
    pub fn all_skipped(&self) -> bool {
        self.outcomes.iter().all(|o| o.state == NodeState::Skipped)
    }

    /// Outcome for one node.
    #[must_use]
    pub fn outcome(&self, node_id: &str) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| o.node_id == node_id)
    }

    fn count(&self, state: NodeState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }
}

/// Runs one gated, retried operation on many nodes at once.
pub struct ParallelDispatcher {
    config: Arc<SetupConfig>,
    runners: Arc<dyn RunnerFactory>,
    markers: Arc<dyn MarkerStore>,
    events: Arc<dyn EventSink>,
    logs: LogLayout,
}

impl ParallelDispatcher {
    /// Creates a dispatcher that discards events.
    #[must_use]
    pub fn new(
        config: SetupConfig,
        runners: Arc<dyn RunnerFactory>,
        markers: Arc<dyn MarkerStore>,
    ) -> Self {
        let logs = LogLayout::new(config.log_root.clone());
        Self {
            config: Arc::new(config),
            runners,
            markers,
            events: Arc::new(NoOpEventSink),
            logs,
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &SetupConfig {
        &self.config
    }

    /// The marker store.
    #[must_use]
    pub fn markers(&self) -> &Arc<dyn MarkerStore> {
        &self.markers
    }

    /// The log layout.
    #[must_use]
    pub fn logs(&self) -> &LogLayout {
        &self.logs
    }

    /// Runs `operation` on every node of `request`.
    ///
    /// Returns once every node reached a terminal state. On failure the
    /// error is a [`DispatchFailure`] holding the earliest-submitted failing
    /// node's error and the outcome of every node. A request carrying an
    /// invalid cluster, stage or node name fails with
    /// [`SetupError::InvalidName`] before any node is touched.
    pub async fn dispatch<F>(
        &self,
        request: DispatchRequest,
        operation: F,
    ) -> Result<DispatchReport, SetupError>
    where
        F: Fn(&NodeTask) -> Result<(), SetupError> + Send + Sync + 'static,
    {
        request.validate()?;
        let DispatchRequest {
            cluster_name,
            stage,
            digest,
            nodes,
            credentials,
        } = request;
        let dispatch_id = Uuid::new_v4();
        let operation: Arc<Operation> = Arc::new(operation);
        let permits = Arc::new(Semaphore::new(
            self.config.max_workers.clamp(1, Semaphore::MAX_PERMITS),
        ));

        self.events.emit(
            "dispatch.started",
            Some(json!({
                "dispatch_id": dispatch_id.to_string(),
                "cluster": cluster_name,
                "stage": stage,
                "nodes": nodes.len(),
                "cached": digest.is_some(),
            })),
        );

        let mut submitted = Vec::with_capacity(nodes.len());
        let mut handles = Vec::with_capacity(nodes.len());
        for node in nodes {
            let address = node
                .feasible_address(self.config.use_internal_ips)
                .to_string();
            let log_path = self
                .logs
                .stage_log_path(&cluster_name, &node.instance_id, &stage);
            info!(
                stage = %stage,
                node = %node.instance_id,
                "Running {} on {} - logging to {}",
                stage,
                node.instance_id,
                log_path.display()
            );
            submitted.push((node.instance_id.clone(), address.clone(), log_path.clone()));

            let unit = NodeUnit {
                task: NodeTask {
                    cluster_name: cluster_name.clone(),
                    stage: stage.clone(),
                    runner: self.runners.runner(&address, &credentials),
                    node,
                    address,
                    log_path,
                },
                digest: digest.clone(),
                retry: self.config.retry.clone(),
                markers: Arc::clone(&self.markers),
                events: Arc::clone(&self.events),
                dispatch_id,
                operation: Arc::clone(&operation),
            };
            unit.transition(NodeState::Init, 0);

            let permits = Arc::clone(&permits);
            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                tokio::task::spawn_blocking(move || unit.execute()).await
            }));
        }

        let joined = join_all(handles).await;

        let mut outcomes = Vec::with_capacity(joined.len());
        let mut first_failure: Option<(String, SetupError)> = None;
        for ((node_id, address, log_path), joined) in submitted.into_iter().zip(joined) {
            let result = match joined {
                Ok(Ok(result)) => result,
                Ok(Err(e)) | Err(e) => {
                    emit_node_state(
                        self.events.as_ref(),
                        dispatch_id,
                        &stage,
                        &node_id,
                        NodeState::Failed,
                        0,
                    );
                    UnitResult::panicked(&node_id, &e)
                }
            };
            if let Some(ref error) = result.error {
                warn!(
                    stage = %stage,
                    node = %node_id,
                    attempts = result.attempts,
                    error = %error,
                    "Stage failed on node, see {}",
                    log_path.display()
                );
            }
            outcomes.push(NodeOutcome {
                node_id: node_id.clone(),
                address,
                state: result.state,
                attempts: result.attempts,
                duration_ms: result.duration_ms,
                log_path,
                error: result.error.as_ref().map(ToString::to_string),
            });
            if let Some(error) = result.error {
                if first_failure.is_none() {
                    first_failure = Some((node_id, error));
                }
            }
        }

        let failed = outcomes.iter().filter(|o| o.state.is_failure()).count();
        let skipped = outcomes
            .iter()
            .filter(|o| o.state == NodeState::Skipped)
            .count();
        self.events.emit(
            "dispatch.completed",
            Some(json!({
                "dispatch_id": dispatch_id.to_string(),
                "stage": stage,
                "nodes": outcomes.len(),
                "failed": failed,
                "skipped": skipped,
            })),
        );

        match first_failure {
            None => Ok(DispatchReport {
                dispatch_id,
                stage,
                outcomes,
            }),
            Some((first_node, first)) => Err(DispatchFailure {
                stage,
                first_node,
                first: Box::new(first),
                outcomes,
            }
            .into()),
        }
    }
}

impl std::fmt::Debug for ParallelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelDispatcher")
            .field("max_workers", &self.config.max_workers)
            .field("logs", &self.logs)
            .finish_non_exhaustive()
    }
}

/// Everything one node needs on its worker thread.
struct NodeUnit {
    task: NodeTask,
    digest: Option<StageDigest>,
    retry: RetryConfig,
    markers: Arc<dyn MarkerStore>,
    events: Arc<dyn EventSink>,
    dispatch_id: Uuid,
    operation: Arc<Operation>,
}

struct UnitResult {
    state: NodeState,
    attempts: u32,
    duration_ms: u64,
    error: Option<SetupError>,
}

impl UnitResult {
    fn panicked(node_id: &str, error: &JoinError) -> Self {
        Self {
            state: NodeState::Failed,
            attempts: 0,
            duration_ms: 0,
            error: Some(SetupError::TaskPanicked {
                node_id: node_id.to_string(),
                message: error.to_string(),
            }),
        }
    }
}

fn emit_node_state(
    events: &dyn EventSink,
    dispatch_id: Uuid,
    stage: &str,
    node: &str,
    state: NodeState,
    attempt: u32,
) {
    events.emit(
        "node.state",
        Some(json!({
            "dispatch_id": dispatch_id.to_string(),
            "stage": stage,
            "node": node,
            "state": state.to_string(),
            "attempt": attempt,
        })),
    );
}

impl NodeUnit {
    fn transition(&self, state: NodeState, attempt: u32) {
        emit_node_state(
            self.events.as_ref(),
            self.dispatch_id,
            &self.task.stage,
            &self.task.node.instance_id,
            state,
            attempt,
        );
    }

    fn execute(self) -> UnitResult {
        let started = Instant::now();
        let attempts = Cell::new(0);
        let (state, error) = match self.execute_gated(&attempts) {
            Ok(GateDecision::Skipped) => (NodeState::Skipped, None),
            Ok(GateDecision::Executed) => (NodeState::Succeeded, None),
            Err(e) => (NodeState::Failed, Some(e)),
        };
        self.transition(state, attempts.get());
        UnitResult {
            state,
            attempts: attempts.get(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            error,
        }
    }

    fn execute_gated(&self, attempts: &Cell<u32>) -> Result<GateDecision, SetupError> {
        LogLayout::prepare(&self.task.log_path)?;
        match self.digest {
            Some(ref digest) => {
                let key = MarkerKey::new(
                    &self.task.cluster_name,
                    &self.task.node.instance_id,
                    &self.task.stage,
                )?;
                self.transition(NodeState::CacheCheck, 0);
                CacheGate::new(self.markers.as_ref())
                    .run(&key, digest, || self.execute_with_retry(attempts))
            }
            None => self
                .execute_with_retry(attempts)
                .map(|()| GateDecision::Executed),
        }
    }

    fn execute_with_retry(&self, attempts: &Cell<u32>) -> Result<(), SetupError> {
        let label = format!("{}@{}", self.task.stage, self.task.node.instance_id);
        retry_blocking(&self.retry, &label, |attempt| {
            if attempt > 1 {
                self.transition(NodeState::Retrying, attempt - 1);
            }
            attempts.set(attempt);
            self.transition(NodeState::Executing, attempt);
            (self.operation)(&self.task)
        })
    }
}
