//! Internal dependency install on every node.

use super::{ClusterSetup, DEPENDENCIES_STAGE};
use crate::core::{Instruction, StageDigest};
use crate::engine::DispatchReport;
use crate::errors::SetupError;

impl ClusterSetup {
    /// Runs `commands` in order on every node.
    ///
    /// The first non-zero exit on a node aborts that node's attempt; the
    /// attempt is retried from the first command. Nodes whose marker matches
    /// the digest of `commands` are skipped.
    pub async fn internal_dependencies_setup(
        &self,
        commands: Vec<Instruction>,
    ) -> Result<DispatchReport, SetupError> {
        let digest = StageDigest::of_instructions(&commands);
        let request = self
            .request(DEPENDENCIES_STAGE, self.metadata.nodes().to_vec())
            .with_digest(digest);

        self.dispatcher
            .dispatch(request, move |task| {
                task.run_sequence(
                    &commands,
                    "Failed to run setup commands on an instance.",
                )
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::InMemoryMarkerStore;
    use crate::cluster::{ClusterMetadata, Credentials, NodeMetadata};
    use crate::config::SetupConfig;
    use crate::core::{ExecutionResult, Instruction, NodeState};
    use crate::engine::{ParallelDispatcher, RetryConfig};
    use crate::errors::SetupError;
    use crate::stages::ClusterSetup;
    use crate::testing::ScriptedTransport;
    use std::sync::Arc;

    fn setup(transport: &Arc<ScriptedTransport>, logs: &tempfile::TempDir) -> ClusterSetup {
        let config = SetupConfig::new()
            .with_log_root(logs.path())
            .with_retry(
                RetryConfig::new()
                    .with_max_attempts(2)
                    .with_initial_backoff_ms(1)
                    .with_jitter(0.0),
            );
        let dispatcher = ParallelDispatcher::new(
            config,
            transport.clone(),
            Arc::new(InMemoryMarkerStore::new()),
        );
        let metadata = ClusterMetadata::new(vec![
            NodeMetadata::new("n1", "10.0.0.1").head(),
            NodeMetadata::new("n2", "10.0.0.2"),
        ])
        .unwrap();
        ClusterSetup::new(Arc::new(dispatcher), "demo", metadata, Credentials::new("ubuntu"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_commands_run_in_order_on_every_node() {
        let logs = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let setup = setup(&transport, &logs);

        let report = setup
            .internal_dependencies_setup(vec![
                Instruction::new("apt-get install -y rsync"),
                Instruction::new("pip install ray"),
            ])
            .await
            .unwrap();

        assert_eq!(report.executed(), 2);
        for address in ["10.0.0.1", "10.0.0.2"] {
            assert_eq!(
                transport.commands_for(address),
                vec!["apt-get install -y rsync", "pip install ray"]
            );
        }
    }

    #[tokio::test]
    async fn test_first_failing_command_aborts_the_rest() {
        let logs = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond_on(
            "10.0.0.2",
            "apt-get",
            ExecutionResult {
                exit_code: 100,
                stdout: "Reading package lists...".to_string(),
                stderr: "E: Unable to locate package rsync".to_string(),
            },
        );
        let setup = setup(&transport, &logs);

        let err = setup
            .internal_dependencies_setup(vec![
                Instruction::new("apt-get install -y rsync"),
                Instruction::new("pip install ray"),
            ])
            .await
            .unwrap_err();

        let SetupError::Dispatch(failure) = err else {
            panic!("expected a dispatch failure");
        };
        let message = failure.first.to_string();
        assert!(message.starts_with("Failed to run setup commands on an instance. (exit code 100)"));
        assert!(message.contains("E: Unable to locate package rsync"));
        assert_eq!(failure.outcomes[0].state, NodeState::Succeeded);
        assert_eq!(
            transport.commands_for("10.0.0.2"),
            vec!["apt-get install -y rsync", "apt-get install -y rsync"]
        );
    }

    #[tokio::test]
    async fn test_unchanged_commands_are_skipped() {
        let logs = tempfile::tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let setup = setup(&transport, &logs);
        let commands = vec![Instruction::new("pip install ray")];

        setup.internal_dependencies_setup(commands.clone()).await.unwrap();
        transport.reset_calls();
        let report = setup.internal_dependencies_setup(commands).await.unwrap();

        assert!(report.all_skipped());
        assert_eq!(transport.call_count(), 0);
    }
}
