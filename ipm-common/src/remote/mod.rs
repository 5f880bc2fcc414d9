//! Remote execution collaborator.
//!
//! All node I/O in the engine goes through [`RemoteExecutor`] and the
//! [`RemoteSession`] it hands out. The production implementation is
//! [`ssh::SshExecutor`]; tests and the mock overlay use
//! [`crate::mock::MockRemote`].

#[cfg(unix)]
pub mod ssh;

use crate::retry::RetryableError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Output of one remote command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Transport-level failure. Never crosses the engine boundary unwrapped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("command on {host} timed out after {}s: {command}", .timeout.as_secs())]
    Timeout {
        host: String,
        command: String,
        timeout: Duration,
    },

    #[error("transport error on {host}: {reason}")]
    Transport { host: String, reason: String },

    #[error("session to {host} is closed")]
    Closed { host: String },
}

impl RemoteError {
    pub fn host(&self) -> &str {
        match self {
            Self::Connect { host, .. }
            | Self::Timeout { host, .. }
            | Self::Transport { host, .. }
            | Self::Closed { host } => host,
        }
    }
}

impl RetryableError for RemoteError {
    fn is_retryable(&self) -> bool {
        // A timed-out command may still be running remotely; re-issuing it
        // is the caller's decision.
        !matches!(self, Self::Timeout { .. })
    }
}

/// Connection options shared by every session an executor opens.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub port: Option<u16>,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(crate::config::DEFAULT_SSH_CONNECT_SECS),
            command_timeout: Duration::from_secs(600),
            user: None,
            identity_file: None,
            port: None,
        }
    }
}

impl From<&crate::config::TimeoutConfig> for RemoteOptions {
    fn from(timeouts: &crate::config::TimeoutConfig) -> Self {
        Self {
            connect_timeout: timeouts.ssh_connect(),
            command_timeout: timeouts.shell_command(),
            ..Default::default()
        }
    }
}

/// Opens sessions to hosts.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Connect to `host`. Fails with [`RemoteError::Connect`].
    async fn connect(&self, host: &str) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// An open session to one host.
#[async_trait]
pub trait RemoteSession: Send {
    fn host(&self) -> &str;

    /// Run a shell command and capture its output.
    async fn execute(&mut self, command: &str) -> Result<CommandResult, RemoteError>;

    /// Whether `path` exists on the host.
    async fn file_exists(&mut self, path: &str) -> Result<bool, RemoteError> {
        let result = self
            .execute(&format!("test -e {}", quote(path)))
            .await?;
        Ok(result.success())
    }

    /// Replace `path` with `contents`.
    async fn write_file(&mut self, path: &str, contents: &str) -> Result<CommandResult, RemoteError> {
        self.execute(&format!(
            "printf '%s' {} > {}",
            quote(contents),
            quote(path)
        ))
        .await
    }

    /// Close the session.
    async fn disconnect(self: Box<Self>) -> Result<(), RemoteError>;
}

/// Shell-quote a single argument.
pub fn quote(arg: &str) -> String {
    shell_escape::unix::escape(arg.into()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_result_success() {
        assert!(CommandResult::ok("x").success());
        assert!(!CommandResult::failed(2, "boom").success());
    }

    #[test]
    fn test_timeout_is_not_retryable() {
        let timeout = RemoteError::Timeout {
            host: "n1".into(),
            command: "sleep 9".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(!timeout.is_retryable());
        assert!(timeout.to_string().contains("after 1s"));

        let drop = RemoteError::Transport {
            host: "n1".into(),
            reason: "reset".into(),
        };
        assert!(drop.is_retryable());
        assert_eq!(drop.host(), "n1");
    }

    #[test]
    fn test_quote_handles_spaces_and_quotes() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), "'it'\\''s'");
    }
}
