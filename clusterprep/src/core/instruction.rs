//! Structured remote instructions and their execution results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::CommandFailure;

/// One command to run on a node, with its environment.
///
/// Instructions render to a single shell line. Environment overrides are
/// kept in a sorted map so rendering and hashing are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    /// The shell command text.
    pub command: String,
    /// Directory to change into before running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Variables exported before running.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Variables removed from the environment before running.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unset_env: Vec<String>,
    /// When set, a non-zero exit does not abort the surrounding sequence.
    #[serde(default)]
    pub tolerate_failure: bool,
}

impl Instruction {
    /// Creates an instruction from plain command text.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workdir: None,
            env: BTreeMap::new(),
            unset_env: Vec::new(),
            tolerate_failure: false,
        }
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Adds an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Removes variables from the environment before running.
    #[must_use]
    pub fn with_unset<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unset_env.extend(names.into_iter().map(Into::into));
        self
    }

    /// Marks the instruction as allowed to fail.
    #[must_use]
    pub fn tolerate_failure(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }

    /// Renders the instruction to a single shell line.
    #[must_use]
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if !self.unset_env.is_empty() {
            parts.push(format!("unset {}", self.unset_env.join(" ")));
        }
        for (key, value) in &self.env {
            parts.push(format!("export {}={}", key, shell_quote(value)));
        }
        if let Some(ref dir) = self.workdir {
            parts.push(format!("cd {} || exit 1", quote_remote_path(dir)));
        }
        parts.push(self.command.clone());
        parts.join("; ")
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for Instruction {
    fn from(command: &str) -> Self {
        Self::new(command)
    }
}

impl From<String> for Instruction {
    fn from(command: String) -> Self {
        Self::new(command)
    }
}

/// Outcome of one command invocation on one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecutionResult {
    /// A zero exit with no output.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// A zero exit with the given stdout.
    #[must_use]
    pub fn ok_with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A non-zero exit with the given stderr.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true when the exit code is zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Converts a non-zero exit into a [`CommandFailure`].
    pub fn ensure_success(
        self,
        description: &str,
        instruction: &Instruction,
    ) -> Result<Self, CommandFailure> {
        if self.success() {
            return Ok(self);
        }
        Err(CommandFailure {
            description: description.to_string(),
            command: instruction.render(),
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

/// Quotes a value for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,@%+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quotes a remote path, leaving a leading `~/` unquoted so it still expands.
#[must_use]
pub fn quote_remote_path(path: &str) -> String {
    if path == "~" {
        return path.to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) if rest.is_empty() => "~/".to_string(),
        Some(rest) => format!("~/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}
