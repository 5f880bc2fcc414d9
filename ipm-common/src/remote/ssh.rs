//! OpenSSH-backed remote executor.
//!
//! Uses the system ssh client through a control master per session;
//! commands run through `sh -c` on the remote side.

use super::{CommandResult, RemoteError, RemoteExecutor, RemoteOptions, RemoteSession};
use async_trait::async_trait;
use openssh::{KnownHosts, Session, SessionBuilder};
use std::time::Instant;
use tracing::{debug, trace};

/// Executor that opens real SSH sessions.
#[derive(Debug, Clone, Default)]
pub struct SshExecutor {
    options: RemoteOptions,
}

impl SshExecutor {
    pub fn new(options: RemoteOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RemoteOptions {
        &self.options
    }

    fn builder(&self) -> SessionBuilder {
        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(KnownHosts::Add)
            .connect_timeout(self.options.connect_timeout)
            .server_alive_interval(self.options.connect_timeout);
        if let Some(user) = &self.options.user {
            builder.user(user.clone());
        }
        if let Some(key) = &self.options.identity_file {
            builder.keyfile(key);
        }
        if let Some(port) = self.options.port {
            builder.port(port);
        }
        builder
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn connect(&self, host: &str) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let start = Instant::now();
        let session = self
            .builder()
            .connect(host)
            .await
            .map_err(|e| RemoteError::Connect {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        debug!(
            host,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "SSH session established"
        );
        Ok(Box::new(SshSession {
            host: host.to_string(),
            session,
            options: self.options.clone(),
        }))
    }
}

struct SshSession {
    host: String,
    session: Session,
    options: RemoteOptions,
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(&mut self, command: &str) -> Result<CommandResult, RemoteError> {
        trace!(host = %self.host, command, "exec");
        let mut cmd = self.session.raw_command(command);
        let run = cmd.output();
        let output = tokio::time::timeout(self.options.command_timeout, run)
            .await
            .map_err(|_| RemoteError::Timeout {
                host: self.host.clone(),
                command: command.to_string(),
                timeout: self.options.command_timeout,
            })?
            .map_err(|e| RemoteError::Transport {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // Killed by signal has no code; report it like the shell does.
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn disconnect(self: Box<Self>) -> Result<(), RemoteError> {
        let host = self.host.clone();
        self.session
            .close()
            .await
            .map_err(|e| RemoteError::Transport {
                host,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_failure_is_a_connect_error() {
        let executor = SshExecutor::new(RemoteOptions {
            connect_timeout: Duration::from_secs(1),
            ..RemoteOptions::default()
        });
        let err = executor.connect("ipm-no-such-host.invalid").await.err().unwrap();
        assert!(matches!(err, RemoteError::Connect { ref host, .. } if host == "ipm-no-such-host.invalid"));
    }
}
