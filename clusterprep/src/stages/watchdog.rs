//! Watchdog agent start on the head node.

use tracing::{debug, info};

use super::{ClusterSetup, WATCHDOG_STAGE};
use crate::core::Instruction;
use crate::engine::DispatchReport;
use crate::errors::SetupError;

impl ClusterSetup {
    /// Makes sure the head node runs the expected watchdog version.
    ///
    /// The agent is restarted only when the reported version differs.
    pub async fn start_watchdog(&self) -> Result<DispatchReport, SetupError> {
        let head = self.head()?.clone();
        let config = self.dispatcher.config().watchdog.clone();
        let version_check = Instruction::new(&config.version_command);
        let restart = Instruction::new(&config.restart_command);

        self.dispatcher
            .dispatch(self.request(WATCHDOG_STAGE, [head]), move |task| {
                let reported = task.run(&version_check)?;
                let running = reported.stdout.trim();
                if reported.success() && running == config.expected_version {
                    debug!(version = %running, "Watchdog agent is up to date");
                    return Ok(());
                }
                info!(
                    running = %running,
                    expected = %config.expected_version,
                    "Restarting watchdog agent"
                );
                task.run_checked(&restart, "Failed to start the watchdog agent on the head node")?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::InMemoryMarkerStore;
    use crate::cluster::{ClusterMetadata, Credentials, NodeMetadata};
    use crate::config::{SetupConfig, WatchdogConfig};
    use crate::core::ExecutionResult;
    use crate::engine::ParallelDispatcher;
    use crate::errors::SetupError;
    use crate::stages::ClusterSetup;
    use crate::testing::ScriptedTransport;
    use std::sync::Arc;

    fn setup(
        transport: &Arc<ScriptedTransport>,
        logs: &tempfile::TempDir,
        nodes: Vec<NodeMetadata>,
    ) -> ClusterSetup {
        let config = SetupConfig::new()
            .with_log_root(logs.path())
            .with_watchdog(WatchdogConfig {
                expected_version: "1.4.0".to_string(),
                version_command: "cat ~/.watchdog/VERSION".to_string(),
                restart_command: "restart-watchdog".to_string(),
            });
        let dispatcher = ParallelDispatcher::new(
            config,
            transport.clone(),
            Arc::new(InMemoryMarkerStore::new()),
        );
        ClusterSetup::new(
            Arc::new(dispatcher),
            "demo",
            ClusterMetadata::new(nodes).unwrap(),
            Credentials::new("ubuntu"),
        )
        .unwrap()
    }

    fn nodes() -> Vec<NodeMetadata> {
        vec![
            NodeMetadata::new("head", "10.0.0.1").head(),
            NodeMetadata::new("w1", "10.0.0.2"),
        ]
    }

    #[tokio::test]
    async fn test_matching_version_is_left_alone() {
        let logs = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("VERSION", ExecutionResult::ok_with_stdout("1.4.0\n"));

        setup(&transport, &logs, nodes()).start_watchdog().await.unwrap();

        assert_eq!(
            transport.commands_for("10.0.0.1"),
            vec!["cat ~/.watchdog/VERSION"]
        );
        assert!(transport.commands_for("10.0.0.2").is_empty());
    }

    #[tokio::test]
    async fn test_stale_or_missing_version_restarts() {
        for reply in [
            ExecutionResult::ok_with_stdout("1.3.9"),
            ExecutionResult::failed(1, ""),
        ] {
            let logs = tempfile::tempdir().unwrap();
            let transport = Arc::new(ScriptedTransport::new());
            transport.respond("VERSION", reply);

            setup(&transport, &logs, nodes()).start_watchdog().await.unwrap();

            assert_eq!(
                transport.commands_for("10.0.0.1"),
                vec!["cat ~/.watchdog/VERSION", "restart-watchdog"]
            );
        }
    }

    #[tokio::test]
    async fn test_requires_head_node() {
        let logs = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let workers_only = vec![NodeMetadata::new("w1", "10.0.0.2")];

        let err = setup(&transport, &logs, workers_only)
            .start_watchdog()
            .await
            .unwrap_err();

        assert!(matches!(err, SetupError::NoHeadNode { .. }));
        assert_eq!(transport.call_count(), 0);
    }
}
