//! Remote session contract for targets declaring `ssh`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::Result;

/// Connection parameters for a scoped remote session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    pub username: String,

    /// Port override; the backend's configured port when `None`
    pub port: Option<u16>,

    /// Private key file; agent/default keys when `None`
    pub identity: Option<PathBuf>,

    /// Per-attempt connection timeout
    pub connect_timeout: Duration,

    /// Number of connection attempts
    pub retries: u32,

    /// Pause between connection attempts
    pub retry_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            port: None,
            identity: None,
            connect_timeout: Duration::from_secs(15),
            retries: 5,
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Options for a single remote command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOptions {
    /// Time allowed for the command to start
    pub start_timeout: Duration,

    /// Deadline for the whole command; exceeding it yields exit code -1
    pub max_exec_time: Duration,

    /// Keep stderr apart; when false it is merged into stdout
    pub separate_stderr: bool,

    /// Log every output line at info level
    pub verbose: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            max_exec_time: Duration::from_secs(180),
            separate_stderr: true,
            verbose: true,
        }
    }
}

/// Exit code reported when a command misses its deadline
pub const EXIT_TIMED_OUT: i32 = -1;

/// Output of a remote command, line by line with line endings kept
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl CommandOutput {
    pub fn timed_out(&self) -> bool {
        self.exit_code == EXIT_TIMED_OUT
    }

    pub fn stdout(&self) -> String {
        self.stdout_lines.concat()
    }

    pub fn stderr(&self) -> String {
        self.stderr_lines.concat()
    }
}

/// An open remote session
///
/// Sessions are scoped: callers close them explicitly, and implementations
/// release their resources on drop as well.
#[async_trait]
pub trait RemoteSession: Send {
    async fn execute_command_output(
        &mut self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandOutput>;

    /// Run a command and return only its exit code
    async fn execute_command(&mut self, command: &str) -> Result<i32> {
        let output = self
            .execute_command_output(command, &CommandOptions::default())
            .await?;
        if output.exit_code != 0 {
            tracing::debug!(
                "Exit code was {}. stdout: {} stderr: {}",
                output.exit_code,
                output.stdout(),
                output.stderr()
            );
        }
        Ok(output.exit_code)
    }

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Incremental line splitter for byte chunks read from a stream
///
/// Complete lines keep their `\n`; an unterminated tail is held back until
/// more data arrives or [`LineSplitter::finish`] is called.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: String,
}

impl LineSplitter {
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.partial.push_str(&String::from_utf8_lossy(data));
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let rest = self.partial.split_off(pos + 1);
            lines.push(std::mem::replace(&mut self.partial, rest));
        }
        lines
    }

    pub fn finish(self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(self.partial)
        }
    }
}
