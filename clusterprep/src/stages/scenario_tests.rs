//! End-to-end setup scenarios over a scripted transport.

#[cfg(test)]
mod tests {
    use crate::cache::FileMarkerStore;
    use crate::cluster::{ClusterMetadata, Credentials, NodeMetadata};
    use crate::config::{ControlPlaneConfig, SetupConfig};
    use crate::core::{ExecutionResult, Instruction, NodeState};
    use crate::engine::{ParallelDispatcher, RetryConfig};
    use crate::errors::SetupError;
    use crate::events::CollectingEventSink;
    use crate::stages::{worker_start_plan, ClusterSetup, WorkerStartMode};
    use crate::testing::ScriptedTransport;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const HEAD: &str = "34.0.0.1";
    const WORKER_1: &str = "34.0.0.2";
    const WORKER_2: &str = "34.0.0.3";

    struct Scenario {
        transport: Arc<ScriptedTransport>,
        events: Arc<CollectingEventSink>,
        setup: ClusterSetup,
        _state: tempfile::TempDir,
    }

    fn scenario(nodes: Vec<NodeMetadata>) -> Scenario {
        let state = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let events = Arc::new(CollectingEventSink::new());
        let config = SetupConfig::new()
            .with_log_root(state.path().join("logs"))
            .with_cache_root(state.path().join("generated"))
            .with_retry(RetryConfig::new().with_initial_backoff_ms(1).with_jitter(0.0));
        let markers = Arc::new(FileMarkerStore::new(config.cache_root.clone()));
        let dispatcher = ParallelDispatcher::new(config, transport.clone(), markers)
            .with_events(events.clone());
        let setup = ClusterSetup::new(
            Arc::new(dispatcher),
            "demo",
            ClusterMetadata::new(nodes).unwrap(),
            Credentials::new("ubuntu"),
        )
        .unwrap();
        Scenario {
            transport,
            events,
            setup,
            _state: state,
        }
    }

    fn three_nodes() -> Vec<NodeMetadata> {
        vec![
            NodeMetadata::new("head", "10.0.0.1")
                .with_public_ip(HEAD)
                .head(),
            NodeMetadata::new("w1", "10.0.0.2").with_public_ip(WORKER_1),
            NodeMetadata::new("w2", "10.0.0.3").with_public_ip(WORKER_2),
        ]
    }

    fn deps() -> Vec<Instruction> {
        vec![Instruction::new("pip install ray")]
    }

    #[tokio::test]
    async fn test_three_node_bring_up() {
        let s = scenario(three_nodes());

        let report = s.setup.internal_dependencies_setup(deps()).await.unwrap();
        assert_eq!(report.executed(), 3);
        assert_eq!(s.transport.count_matching("pip install ray"), 3);

        s.setup.start_control_plane_head(None).await.unwrap();
        let head_commands = s.transport.commands_for(HEAD);
        assert!(head_commands.iter().any(|c| c.contains("ray start") && c.contains("--head")));
        assert!(head_commands.iter().any(|c| c.contains("ray_port.json")));
        for worker in [WORKER_1, WORKER_2] {
            assert!(!s
                .transport
                .commands_for(worker)
                .iter()
                .any(|c| c.contains("ray start")));
        }

        let report = s
            .setup
            .start_control_plane_workers(WorkerStartMode::NoRestart, None)
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 2);
        let status_check = worker_start_plan(
            &ControlPlaneConfig::default(),
            "10.0.0.1",
            WorkerStartMode::NoRestart,
            None,
        )
        .status_check
        .unwrap()
        .render();
        for worker in [WORKER_1, WORKER_2] {
            assert_eq!(
                s.transport.commands_for(worker),
                vec!["pip install ray".to_string(), status_check.clone()]
            );
        }
    }

    #[tokio::test]
    async fn test_unhealthy_worker_joins_head_private_address() {
        let s = scenario(three_nodes());
        s.transport
            .respond_on(WORKER_2, "ray status", ExecutionResult::failed(1, "not running"));

        s.setup
            .start_control_plane_workers(WorkerStartMode::NoRestart, None)
            .await
            .unwrap();

        assert_eq!(s.transport.commands_for(WORKER_1).len(), 1);
        let joined = s.transport.commands_for(WORKER_2);
        assert_eq!(joined.len(), 3);
        assert!(joined[1].contains("ray start --disable-usage-stats --address=10.0.0.1:6380"));
        assert!(joined[1].starts_with("unset AWS_ACCESS_KEY_ID AWS_SECRET_ACCESS_KEY"));
    }

    #[tokio::test]
    async fn test_force_restart_stops_before_joining() {
        let s = scenario(three_nodes());

        s.setup
            .start_control_plane_workers(WorkerStartMode::ForceRestart, Some("{\"GPU\": 1}"))
            .await
            .unwrap();

        let commands = s.transport.commands_for(WORKER_1);
        assert_eq!(commands[0], "ray stop");
        assert!(commands[1].ends_with("--resources='{\"GPU\": 1}'"));
        assert_eq!(s.transport.count_matching("ray status"), 0);
    }

    #[tokio::test]
    async fn test_single_node_cluster_has_no_workers_to_start() {
        let s = scenario(vec![NodeMetadata::new("head", "10.0.0.1").head()]);

        let report = s
            .setup
            .start_control_plane_workers(WorkerStartMode::ForceRestart, None)
            .await
            .unwrap();

        assert!(report.outcomes.is_empty());
        assert_eq!(s.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rerun_after_partial_failure() {
        let s = scenario(three_nodes());
        s.transport
            .respond_on(WORKER_1, "pip install", ExecutionResult::failed(1, "network"));

        let err = s
            .setup
            .internal_dependencies_setup(deps())
            .await
            .unwrap_err();
        let SetupError::Dispatch(failure) = err else {
            panic!("expected a dispatch failure");
        };
        assert_eq!(failure.failed_nodes(), vec!["w1"]);
        assert_eq!(failure.outcomes.len(), 3);
        assert_eq!(s.transport.commands_for(WORKER_1).len(), 5);

        s.transport.reset_calls();
        let report = s.setup.internal_dependencies_setup(deps()).await;
        assert!(report.is_err());
        assert!(s.transport.commands_for(HEAD).is_empty());
        assert!(s.transport.commands_for(WORKER_2).is_empty());
        assert_eq!(s.transport.commands_for(WORKER_1).len(), 5);
    }

    #[tokio::test]
    async fn test_markers_persist_on_disk() {
        let s = scenario(three_nodes());
        s.setup.internal_dependencies_setup(deps()).await.unwrap();

        let marker_dir = s
            .setup
            .dispatcher()
            .config()
            .cache_root
            .join("demo")
            .join("w2");
        assert!(marker_dir.join("internal_dependencies_setup.json").is_file());

        s.events.clear();
        s.setup.internal_dependencies_setup(deps()).await.unwrap();
        assert_eq!(
            s.events.node_states("w2"),
            vec!["init", "cache_check", "skipped"]
        );
    }

    #[tokio::test]
    async fn test_head_failure_reports_captured_output() {
        let s = scenario(three_nodes());
        s.transport.respond_on(
            HEAD,
            "ray start",
            ExecutionResult::failed(1, "port 6380 already in use"),
        );

        let err = s.setup.start_control_plane_head(None).await.unwrap_err();

        let SetupError::Dispatch(failure) = err else {
            panic!("expected a dispatch failure");
        };
        assert_eq!(failure.outcomes[0].state, NodeState::Failed);
        let message = failure.first.to_string();
        assert!(message.starts_with("Failed to start ray on the head node (exit code 1)"));
        assert!(message.contains("port 6380 already in use"));
        assert_eq!(s.transport.count_matching("ray_port.json"), 0);
    }
}
