//! Scripted in-process transport.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::Credentials;
use crate::core::{ExecutionResult, Instruction};
use crate::errors::SetupError;
use crate::transport::{CommandRunner, RunOptions, RunnerFactory};

/// One call made through a scripted runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    /// A command ran.
    Run {
        /// Node address.
        address: String,
        /// Rendered command line.
        command: String,
    },
    /// A path was pushed.
    Transfer {
        /// Node address.
        address: String,
        /// Local source.
        source: PathBuf,
        /// Remote destination.
        destination: String,
    },
}

impl RecordedCall {
    /// Address the call went to.
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            Self::Run { address, .. } | Self::Transfer { address, .. } => address,
        }
    }
}

/// A scripted reply.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// The command ran and exited with this result.
    Exit(ExecutionResult),
    /// The node could not be reached.
    Unreachable,
}

#[derive(Debug)]
struct ScriptRule {
    address: Option<String>,
    contains: String,
    replies: VecDeque<Scripted>,
}

impl ScriptRule {
    fn matches(&self, address: &str, command: &str) -> bool {
        self.address.as_deref().map_or(true, |a| a == address) && command.contains(&self.contains)
    }

    /// Replies are consumed in order; the last one repeats.
    fn next_reply(&mut self) -> Scripted {
        if self.replies.len() > 1 {
            if let Some(reply) = self.replies.pop_front() {
                return reply;
            }
        }
        self.replies
            .front()
            .cloned()
            .unwrap_or(Scripted::Exit(ExecutionResult::ok()))
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    rules: Mutex<Vec<ScriptRule>>,
    calls: Mutex<Vec<RecordedCall>>,
    failing_transfers: Mutex<HashSet<String>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A [`RunnerFactory`] whose runners answer from a script and record every
/// call.
///
/// Commands with no matching rule exit 0 with empty output. Rules are
/// checked in the order they were added.
#[derive(Debug, Default, Clone)]
pub struct ScriptedTransport {
    state: Arc<ScriptState>,
}

impl ScriptedTransport {
    /// Creates a transport where every command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies with `result` to commands containing `contains`, on any node.
    pub fn respond(&self, contains: impl Into<String>, result: ExecutionResult) -> &Self {
        self.add_rule(None, contains.into(), vec![Scripted::Exit(result)])
    }

    /// Replies with `result` to commands containing `contains` on `address`.
    pub fn respond_on(
        &self,
        address: impl Into<String>,
        contains: impl Into<String>,
        result: ExecutionResult,
    ) -> &Self {
        self.add_rule(
            Some(address.into()),
            contains.into(),
            vec![Scripted::Exit(result)],
        )
    }

    /// Replies with `replies` in order; the last one repeats.
    pub fn respond_sequence(
        &self,
        address: Option<&str>,
        contains: impl Into<String>,
        replies: Vec<Scripted>,
    ) -> &Self {
        self.add_rule(address.map(str::to_string), contains.into(), replies)
    }

    /// Makes every transfer to `address` fail.
    pub fn fail_transfers_to(&self, address: impl Into<String>) -> &Self {
        self.state.failing_transfers.lock().insert(address.into());
        self
    }

    /// Holds every command for `latency` before replying.
    pub fn with_latency(&self, latency: Duration) -> &Self {
        *self.state.latency.lock() = latency;
        self
    }

    fn add_rule(&self, address: Option<String>, contains: String, replies: Vec<Scripted>) -> &Self {
        self.state.rules.lock().push(ScriptRule {
            address,
            contains,
            replies: replies.into(),
        });
        self
    }

    /// Every call, in the order it was made.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().clone()
    }

    /// Number of calls made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.calls.lock().len()
    }

    /// Commands run on `address`, in order.
    #[must_use]
    pub fn commands_for(&self, address: &str) -> Vec<String> {
        self.state
            .calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                RecordedCall::Run { address: a, command } if a == address => {
                    Some(command.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Transfers to `address` as `(source, destination)` pairs.
    #[must_use]
    pub fn transfers_for(&self, address: &str) -> Vec<(PathBuf, String)> {
        self.state
            .calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                RecordedCall::Transfer {
                    address: a,
                    source,
                    destination,
                } if a == address => Some((source.clone(), destination.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of commands containing `contains`, across all nodes.
    #[must_use]
    pub fn count_matching(&self, contains: &str) -> usize {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|call| matches!(call, RecordedCall::Run { command, .. } if command.contains(contains)))
            .count()
    }

    /// Highest number of commands that were in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Forgets recorded calls; rules stay.
    pub fn reset_calls(&self) {
        self.state.calls.lock().clear();
        self.state.max_in_flight.store(0, Ordering::SeqCst);
    }
}

impl RunnerFactory for ScriptedTransport {
    fn runner(&self, address: &str, _credentials: &Credentials) -> Arc<dyn CommandRunner> {
        Arc::new(ScriptedRunner {
            address: address.to_string(),
            state: Arc::clone(&self.state),
        })
    }
}

struct ScriptedRunner {
    address: String,
    state: Arc<ScriptState>,
}

impl ScriptedRunner {
    fn reply_for(&self, command: &str) -> Scripted {
        let mut rules = self.state.rules.lock();
        rules
            .iter_mut()
            .find(|rule| rule.matches(&self.address, command))
            .map_or(Scripted::Exit(ExecutionResult::ok()), ScriptRule::next_reply)
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        instruction: &Instruction,
        _options: &RunOptions,
    ) -> Result<ExecutionResult, SetupError> {
        let command = instruction.render();
        self.state.calls.lock().push(RecordedCall::Run {
            address: self.address.clone(),
            command: command.clone(),
        });

        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let reply = self.reply_for(&command);
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Scripted::Exit(result) => Ok(result),
            Scripted::Unreachable => Err(SetupError::transport(
                &self.address,
                "connection refused",
            )),
        }
    }

    fn transfer(
        &self,
        source: &Path,
        destination: &str,
        _log_path: &Path,
    ) -> Result<(), SetupError> {
        self.state.calls.lock().push(RecordedCall::Transfer {
            address: self.address.clone(),
            source: source.to_path_buf(),
            destination: destination.to_string(),
        });
        if self.state.failing_transfers.lock().contains(&self.address) {
            return Err(SetupError::Transfer {
                source_path: source.to_path_buf(),
                destination: destination.to_string(),
                message: "rsync exited with code 23".to_string(),
            });
        }
        Ok(())
    }
}
