//! Control-plane daemon bootstrap: head first, then workers.

use serde_json::json;
use tracing::debug;

use super::{remote_parent, ClusterSetup, CONTROL_PLANE_STAGE};
use crate::config::ControlPlaneConfig;
use crate::core::{quote_remote_path, shell_quote, Instruction};
use crate::engine::DispatchReport;
use crate::errors::SetupError;

/// Variables set for every daemon start.
const DAEMON_ENV: [(&str, &str); 2] = [("RAY_SCHEDULER_EVENTS", "0"), ("RAY_DEDUP_LOGS", "0")];

/// How to treat a daemon that is already running on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerStartMode {
    /// Keep a healthy daemon; join only when the status check fails.
    #[default]
    NoRestart,
    /// Stop whatever runs and join again.
    ForceRestart,
}

/// What a worker runs: an optional health check, then the join sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStartPlan {
    /// When present and successful, the join sequence is skipped.
    pub status_check: Option<Instruction>,
    /// Stop (if restarting), start, raise fd limit.
    pub join: Vec<Instruction>,
}

fn with_resources(mut options: String, custom_resource: Option<&str>) -> String {
    if let Some(resources) = custom_resource {
        options.push_str(" --resources=");
        options.push_str(&shell_quote(resources));
    }
    options
}

fn stop_instruction(config: &ControlPlaneConfig) -> Instruction {
    Instruction::new(format!("{} stop", config.binary)).tolerate_failure()
}

fn start_instruction(config: &ControlPlaneConfig, options: &str) -> Instruction {
    DAEMON_ENV.iter().fold(
        Instruction::new(format!(
            "{} start --disable-usage-stats {options}",
            config.binary
        ))
        .with_unset(config.scrubbed_env.iter().cloned()),
        |instruction, (key, value)| instruction.with_env(*key, *value),
    )
}

/// Best-effort raise of the daemon's open-file limit.
fn fd_limit_instruction(config: &ControlPlaneConfig) -> Instruction {
    Instruction::new(format!(
        "which prlimit && for id in $(pgrep -f {pattern}); \
         do sudo prlimit --nofile={limit}:{limit} --pid=$id || true; done",
        pattern = shell_quote(&config.process_pattern),
        limit = config.fd_limit,
    ))
    .tolerate_failure()
}

fn port_file_instruction(config: &ControlPlaneConfig) -> Instruction {
    let ports = json!({
        "ray_port": config.primary_port,
        "ray_dashboard_port": config.dashboard_port,
    });
    Instruction::new(format!(
        "mkdir -p {dir} && printf '%s' {ports} > {file}",
        dir = quote_remote_path(remote_parent(&config.port_file)),
        ports = shell_quote(&ports.to_string()),
        file = quote_remote_path(&config.port_file),
    ))
}

/// Daemon health check against the port recorded in the port file.
///
/// Falls back to the configured primary port when the file is missing or
/// has no `ray_port` entry.
fn status_check_instruction(config: &ControlPlaneConfig) -> Instruction {
    Instruction::new(format!(
        "RAY_PORT=$(sed -n {script} {file} 2> /dev/null); \
         {binary} status --address=127.0.0.1:${{RAY_PORT:-{port}}}",
        script = shell_quote(r#"s/.*"ray_port": *\([0-9][0-9]*\).*/\1/p"#),
        file = quote_remote_path(&config.port_file),
        binary = config.binary,
        port = config.primary_port,
    ))
}

/// Instructions that (re)start the daemon on the head node.
#[must_use]
pub fn head_start_instructions(
    config: &ControlPlaneConfig,
    custom_resource: Option<&str>,
) -> Vec<Instruction> {
    let options = with_resources(
        format!(
            "--head --port={} --dashboard-port={} --object-manager-port={} --temp-dir={}",
            config.primary_port,
            config.dashboard_port,
            config.object_manager_port,
            shell_quote(&config.temp_dir),
        ),
        custom_resource,
    );
    vec![
        stop_instruction(config),
        start_instruction(config, &options),
        fd_limit_instruction(config),
        port_file_instruction(config),
    ]
}

/// What each worker runs to join the head at `head_private_ip`.
#[must_use]
pub fn worker_start_plan(
    config: &ControlPlaneConfig,
    head_private_ip: &str,
    mode: WorkerStartMode,
    custom_resource: Option<&str>,
) -> WorkerStartPlan {
    let options = with_resources(
        format!(
            "--address={}:{} --object-manager-port={} --temp-dir={}",
            head_private_ip,
            config.primary_port,
            config.object_manager_port,
            shell_quote(&config.temp_dir),
        ),
        custom_resource,
    );

    let mut join = Vec::with_capacity(3);
    let status_check = match mode {
        WorkerStartMode::NoRestart => Some(status_check_instruction(config)),
        WorkerStartMode::ForceRestart => {
            join.push(stop_instruction(config));
            None
        }
    };
    join.push(start_instruction(config, &options));
    join.push(fd_limit_instruction(config));

    WorkerStartPlan { status_check, join }
}

impl ClusterSetup {
    /// Starts the control-plane daemon on the head node.
    ///
    /// Runs every time; a running daemon is stopped first.
    pub async fn start_control_plane_head(
        &self,
        custom_resource: Option<&str>,
    ) -> Result<DispatchReport, SetupError> {
        let head = self.head()?.clone();
        let instructions =
            head_start_instructions(&self.dispatcher.config().control_plane, custom_resource);

        self.dispatcher
            .dispatch(self.request(CONTROL_PLANE_STAGE, [head]), move |task| {
                task.run_sequence(&instructions, "Failed to start ray on the head node")
            })
            .await
    }

    /// Joins every worker to the head's daemon.
    ///
    /// A cluster with one node or fewer has no workers and nothing runs.
    pub async fn start_control_plane_workers(
        &self,
        mode: WorkerStartMode,
        custom_resource: Option<&str>,
    ) -> Result<DispatchReport, SetupError> {
        if self.metadata.len() <= 1 {
            return Ok(DispatchReport::empty(CONTROL_PLANE_STAGE));
        }
        let head = self.head()?;
        let plan = worker_start_plan(
            &self.dispatcher.config().control_plane,
            &head.private_ip,
            mode,
            custom_resource,
        );
        let workers: Vec<_> = self.metadata.workers().into_iter().cloned().collect();

        self.dispatcher
            .dispatch(self.request(CONTROL_PLANE_STAGE, workers), move |task| {
                if let Some(ref check) = plan.status_check {
                    if task.run(check)?.success() {
                        debug!(node = %task.node().instance_id, "Daemon already running, not joining");
                        return Ok(());
                    }
                }
                task.run_sequence(&plan.join, "Failed to start ray on the worker node")
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_head_instructions() {
        let config = ControlPlaneConfig::default();
        let instructions = head_start_instructions(&config, Some(r#"{"TPU": 4}"#));

        assert_eq!(instructions.len(), 4);
        assert_eq!(instructions[0].command, "ray stop");
        assert!(instructions[0].tolerate_failure);

        let start = instructions[1].render();
        assert!(start.starts_with("unset AWS_ACCESS_KEY_ID AWS_SECRET_ACCESS_KEY; "));
        assert!(start.contains("export RAY_DEDUP_LOGS=0; export RAY_SCHEDULER_EVENTS=0"));
        assert!(start.contains(
            "ray start --disable-usage-stats --head --port=6380 --dashboard-port=8266 \
             --object-manager-port=8076 --temp-dir=/tmp/ray_clusterprep"
        ));
        assert!(start.ends_with(r#"--resources='{"TPU": 4}'"#));
        assert!(!instructions[1].tolerate_failure);

        assert!(instructions[2].tolerate_failure);
        assert!(instructions[2]
            .command
            .contains("prlimit --nofile=1048576:1048576"));

        assert_eq!(
            instructions[3].command,
            r#"mkdir -p ~/.clusterprep && printf '%s' '{"ray_dashboard_port":8266,"ray_port":6380}' > ~/.clusterprep/ray_port.json"#
        );
    }

    #[test]
    fn test_worker_plan_no_restart() {
        let plan = worker_start_plan(
            &ControlPlaneConfig::default(),
            "10.0.0.1",
            WorkerStartMode::NoRestart,
            None,
        );

        assert_eq!(
            plan.status_check.unwrap().command,
            r#"RAY_PORT=$(sed -n 's/.*"ray_port": *\([0-9][0-9]*\).*/\1/p' ~/.clusterprep/ray_port.json 2> /dev/null); ray status --address=127.0.0.1:${RAY_PORT:-6380}"#
        );
        assert_eq!(plan.join.len(), 2);
        assert!(plan.join[0].command.contains("--address=10.0.0.1:6380"));
        assert!(!plan.join[0].command.contains("--head"));
    }

    #[cfg(unix)]
    fn status_address(config: &ControlPlaneConfig) -> String {
        let check = status_check_instruction(config);
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(&check.command)
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    #[cfg(unix)]
    #[test]
    fn test_status_check_reads_recorded_port() {
        let dir = tempfile::tempdir().unwrap();
        let port_file = dir.path().join("ray_port.json");
        let config = ControlPlaneConfig {
            binary: "echo".to_string(),
            port_file: port_file.to_string_lossy().into_owned(),
            ..ControlPlaneConfig::default()
        };

        assert_eq!(status_address(&config), "status --address=127.0.0.1:6380");

        let recorded = ControlPlaneConfig {
            primary_port: 7001,
            ..config.clone()
        };
        let written = port_file_instruction(&recorded);
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(&written.command)
            .status()
            .unwrap();
        assert!(status.success());

        assert_eq!(status_address(&config), "status --address=127.0.0.1:7001");
    }

    #[test]
    fn test_worker_plan_force_restart() {
        let plan = worker_start_plan(
            &ControlPlaneConfig::default(),
            "10.0.0.1",
            WorkerStartMode::ForceRestart,
            None,
        );

        assert!(plan.status_check.is_none());
        assert_eq!(plan.join[0].command, "ray stop");
        assert!(plan.join[1].command.starts_with("ray start"));
    }
}
