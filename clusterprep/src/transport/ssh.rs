//! SSH/rsync transport.
//!
//! Commands run as `ssh <opts> user@host bash --login -c '<instruction>'`;
//! pushes go through `rsync -e 'ssh <opts>'`. Output of both is appended to
//! the per-node log file line by line while the process runs.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::ScopedJoinHandle;

use super::{CommandRunner, RunOptions, RunnerFactory};
use crate::cluster::Credentials;
use crate::core::{shell_quote, ExecutionResult, Instruction};
use crate::errors::SetupError;

/// Runner that reaches one node over SSH.
///
/// `ssh` exits with 255 when it cannot reach the node, so a remote command
/// that itself exits with 255, or a session killed by a signal, is reported
/// as [`SetupError::Transport`]. The error message carries whatever the
/// command printed.
#[derive(Debug, Clone)]
pub struct SshCommandRunner {
    address: String,
    credentials: Credentials,
}

impl SshCommandRunner {
    /// Creates a runner for `address`.
    #[must_use]
    pub fn new(address: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            address: address.into(),
            credentials,
        }
    }

    /// `user@host`.
    #[must_use]
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.credentials.ssh_user, self.address)
    }

    /// Options shared by `ssh` and the rsync remote shell.
    #[must_use]
    pub fn ssh_options(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.credentials.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.credentials.connect_timeout_secs),
        ];
        if let Some(ref key) = self.credentials.ssh_private_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        if let Some(ref proxy) = self.credentials.ssh_proxy_command {
            args.push("-o".to_string());
            args.push(format!("ProxyCommand={proxy}"));
        }
        args
    }

    /// Full `ssh` argument vector for an instruction.
    #[must_use]
    pub fn build_ssh_args(&self, instruction: &Instruction) -> Vec<String> {
        let mut args = vec!["-T".to_string()];
        args.extend(self.ssh_options());
        args.push(self.user_at_host());
        args.push(format!("bash --login -c {}", shell_quote(&instruction.render())));
        args
    }

    /// Full `rsync` argument vector for a push.
    #[must_use]
    pub fn build_rsync_args(&self, source: &Path, destination: &str) -> Vec<String> {
        let ssh_command = std::iter::once("ssh".to_string())
            .chain(self.ssh_options().iter().map(|a| shell_quote(a)))
            .collect::<Vec<_>>()
            .join(" ");
        let mut source_arg = source.display().to_string();
        if source.is_dir() && !source_arg.ends_with('/') {
            source_arg.push('/');
        }
        vec![
            "-Pavz".to_string(),
            "-e".to_string(),
            ssh_command,
            source_arg,
            format!("{}:{}", self.user_at_host(), destination),
        ]
    }
}

/// Output of a finished child process.
#[derive(Debug)]
struct Captured {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

/// Opens `log_path` for appending and writes the `+ header` line.
fn open_log(log_path: &Path, header: &str) -> Result<File, SetupError> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;
    writeln!(file, "+ {header}")?;
    Ok(file)
}

fn spawn_piped(command: &mut Command) -> io::Result<Child> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

/// Copies lines from `source` into `log` as they arrive and returns them.
///
/// With `echo` set, every line is also logged under that address.
fn copy_lines(source: impl Read, log: &Mutex<File>, echo: Option<&str>) -> io::Result<String> {
    let mut reader = BufReader::new(source);
    let mut captured = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(captured);
        }
        log.lock().write_all(&line)?;
        let text = String::from_utf8_lossy(&line);
        if let Some(address) = echo {
            tracing::info!(address, "{}", text.trim_end());
        }
        captured.push_str(&text);
    }
}

fn join_reader(handle: ScopedJoinHandle<'_, io::Result<String>>) -> io::Result<String> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("output reader panicked")))
}

/// Drains both pipes of `child` into `log` and waits for it to exit.
fn stream_child(mut child: Child, log: File, echo: Option<&str>) -> io::Result<Captured> {
    let log = Mutex::new(log);
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr) = std::thread::scope(|scope| {
        let log = &log;
        let out = scope.spawn(move || {
            stdout.map_or_else(|| Ok(String::new()), |pipe| copy_lines(pipe, log, echo))
        });
        let err = scope.spawn(move || {
            stderr.map_or_else(|| Ok(String::new()), |pipe| copy_lines(pipe, log, echo))
        });
        (join_reader(out), join_reader(err))
    });
    let status = child.wait()?;
    Ok(Captured {
        status,
        stdout: stdout?,
        stderr: stderr?,
    })
}

/// Turns a finished ssh session into a command result.
///
/// `code` is `None` when the session was killed by a signal.
fn session_result(
    address: &str,
    code: Option<i32>,
    stdout: String,
    stderr: String,
    require_outputs: bool,
) -> Result<ExecutionResult, SetupError> {
    let exit_code = match code {
        Some(255) | None => {
            let mut message = code.map_or_else(
                || "ssh terminated by a signal".to_string(),
                |c| format!("ssh exited with {c}"),
            );
            for (stream, text) in [("stderr", stderr.trim()), ("stdout", stdout.trim())] {
                if !text.is_empty() {
                    message.push_str(&format!("\n{stream}: {text}"));
                }
            }
            return Err(SetupError::transport(address, message));
        }
        Some(code) => code,
    };

    if require_outputs {
        Ok(ExecutionResult {
            exit_code,
            stdout,
            stderr,
        })
    } else {
        Ok(ExecutionResult {
            exit_code,
            ..ExecutionResult::default()
        })
    }
}

impl CommandRunner for SshCommandRunner {
    fn run(
        &self,
        instruction: &Instruction,
        options: &RunOptions,
    ) -> Result<ExecutionResult, SetupError> {
        let log = open_log(&options.log_path, &instruction.command)?;
        let child = spawn_piped(Command::new("ssh").args(self.build_ssh_args(instruction)))
            .map_err(|e| SetupError::transport(&self.address, format!("failed to spawn ssh: {e}")))?;
        let echo = options.stream_logs.then_some(self.address.as_str());
        let captured = stream_child(child, log, echo)?;

        session_result(
            &self.address,
            captured.status.code(),
            captured.stdout,
            captured.stderr,
            options.require_outputs,
        )
    }

    fn transfer(
        &self,
        source: &Path,
        destination: &str,
        log_path: &Path,
    ) -> Result<(), SetupError> {
        let args = self.build_rsync_args(source, destination);
        let log = open_log(log_path, &format!("rsync {}", args.join(" ")))?;
        let child = spawn_piped(Command::new("rsync").args(&args)).map_err(|e| {
            SetupError::Transfer {
                source_path: source.to_path_buf(),
                destination: destination.to_string(),
                message: format!("failed to spawn rsync: {e}"),
            }
        })?;
        let captured = stream_child(child, log, None)?;

        if captured.status.success() {
            Ok(())
        } else {
            Err(SetupError::Transfer {
                source_path: source.to_path_buf(),
                destination: destination.to_string(),
                message: captured.stderr.trim().to_string(),
            })
        }
    }
}

/// Creates [`SshCommandRunner`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshRunnerFactory;

impl RunnerFactory for SshRunnerFactory {
    fn runner(&self, address: &str, credentials: &Credentials) -> Arc<dyn CommandRunner> {
        Arc::new(SshCommandRunner::new(address, credentials.clone()))
    }
}
