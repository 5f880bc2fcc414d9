//! Retrying wrapper around the remote executor.
//!
//! Each call opens a session, runs one command and disconnects. Transport
//! failures are retried with the configured policy; command timeouts are not.

use ipm_common::remote::{CommandResult, RemoteError, RemoteExecutor};
use ipm_common::retry::{RetryPolicy, run_with_retry};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct Transport {
    executor: Arc<dyn RemoteExecutor>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("policy", &self.policy).finish()
    }
}

impl Transport {
    pub fn new(executor: Arc<dyn RemoteExecutor>, policy: RetryPolicy) -> Self {
        Self { executor, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `command` on `host`.
    pub async fn run(&self, host: &str, command: &str) -> Result<CommandResult, RemoteError> {
        run_with_retry("remote command", &self.policy, || async move {
            let mut session = self.executor.connect(host).await?;
            let result = session.execute(command).await;
            if let Err(err) = session.disconnect().await {
                debug!(host, "Disconnect failed: {}", err);
            }
            result
        })
        .await
    }

    /// Connect and disconnect; used to check a host is reachable.
    pub async fn check(&self, host: &str) -> Result<(), RemoteError> {
        run_with_retry("connect", &self.policy, || async move {
            let session = self.executor.connect(host).await?;
            if let Err(err) = session.disconnect().await {
                debug!(host, "Disconnect failed: {}", err);
            }
            Ok(())
        })
        .await
    }

    pub async fn write_file(&self, host: &str, path: &str, contents: &str) -> Result<CommandResult, RemoteError> {
        run_with_retry("write file", &self.policy, || async move {
            let mut session = self.executor.connect(host).await?;
            let result = session.write_file(path, contents).await;
            if let Err(err) = session.disconnect().await {
                debug!(host, "Disconnect failed: {}", err);
            }
            result
        })
        .await
    }

    pub async fn file_exists(&self, host: &str, path: &str) -> Result<bool, RemoteError> {
        run_with_retry("file exists", &self.policy, || async move {
            let mut session = self.executor.connect(host).await?;
            let result = session.file_exists(path).await;
            if let Err(err) = session.disconnect().await {
                debug!(host, "Disconnect failed: {}", err);
            }
            result
        })
        .await
    }
}
