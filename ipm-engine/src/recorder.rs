//! Record and replay of remote interactions.
//!
//! A [`Recorder`] wraps a live executor and logs every connect and command
//! with its result. A recording saved to disk can be replayed later with no
//! network: each host's interactions are served back in order, and a command
//! that differs from the recorded one fails with a transport error.

use async_trait::async_trait;
use ipm_common::remote::{CommandResult, RemoteError, RemoteExecutor, RemoteSession};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("recording {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One observed exchange with a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Interaction {
    Connect {
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Execute {
        host: String,
        command: String,
        result: Result<CommandResult, String>,
    },
}

impl Interaction {
    pub fn host(&self) -> &str {
        match self {
            Self::Connect { host, .. } | Self::Execute { host, .. } => host,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub interactions: Vec<Interaction>,
}

impl Recording {
    pub fn load(path: &Path) -> Result<Self, RecordingError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RecordingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| RecordingError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), RecordingError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| RecordingError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| RecordingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), interactions = self.interactions.len(), "Saved recording");
        Ok(())
    }
}

type Log = Arc<Mutex<Vec<Interaction>>>;
type Queues = Arc<Mutex<HashMap<String, VecDeque<Interaction>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Source {
    Live { inner: Arc<dyn RemoteExecutor>, log: Log },
    Replay { queues: Queues },
}

/// Executor that records a live fleet or replays a recording.
pub struct Recorder {
    source: Source,
}

impl Recorder {
    pub fn record(inner: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            source: Source::Live {
                inner,
                log: Arc::new(Mutex::new(Vec::new())),
            },
        }
    }

    pub fn replay(recording: Recording) -> Self {
        let mut queues: HashMap<String, VecDeque<Interaction>> = HashMap::new();
        for interaction in recording.interactions {
            queues
                .entry(interaction.host().to_string())
                .or_default()
                .push_back(interaction);
        }
        Self {
            source: Source::Replay {
                queues: Arc::new(Mutex::new(queues)),
            },
        }
    }

    /// Everything recorded so far. Empty when replaying.
    pub fn recording(&self) -> Recording {
        match &self.source {
            Source::Live { log, .. } => Recording {
                interactions: lock(log).clone(),
            },
            Source::Replay { .. } => Recording::default(),
        }
    }

    /// Interactions not yet consumed by a replay.
    pub fn remaining(&self) -> usize {
        match &self.source {
            Source::Live { .. } => 0,
            Source::Replay { queues } => lock(queues).values().map(VecDeque::len).sum(),
        }
    }
}

/// Reason text that rebuilds the same error on replay.
fn reason(err: &RemoteError) -> String {
    match err {
        RemoteError::Connect { reason, .. } | RemoteError::Transport { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

fn diverged(host: &str, expected: Option<&Interaction>, got: &str) -> RemoteError {
    let expected = match expected {
        Some(Interaction::Execute { command, .. }) => format!("command '{command}'"),
        Some(Interaction::Connect { .. }) => "connect".to_string(),
        None => "end of recording".to_string(),
    };
    warn!(host, expected = %expected, got, "Replay diverged from recording");
    RemoteError::Transport {
        host: host.to_string(),
        reason: format!("replay diverged: expected {expected}, got {got}"),
    }
}

#[async_trait]
impl RemoteExecutor for Recorder {
    async fn connect(&self, host: &str) -> Result<Box<dyn RemoteSession>, RemoteError> {
        match &self.source {
            Source::Live { inner, log } => {
                let result = inner.connect(host).await;
                lock(log).push(Interaction::Connect {
                    host: host.to_string(),
                    error: result.as_ref().err().map(reason),
                });
                let inner = result?;
                Ok(Box::new(RecordingSession {
                    host: host.to_string(),
                    inner,
                    log: log.clone(),
                }))
            }
            Source::Replay { queues } => {
                let next = lock(queues).get_mut(host).and_then(VecDeque::pop_front);
                match next {
                    Some(Interaction::Connect { error: None, .. }) => Ok(Box::new(ReplaySession {
                        host: host.to_string(),
                        queues: queues.clone(),
                    })),
                    Some(Interaction::Connect { error: Some(reason), .. }) => Err(RemoteError::Connect {
                        host: host.to_string(),
                        reason,
                    }),
                    other => Err(diverged(host, other.as_ref(), "connect")),
                }
            }
        }
    }
}

struct RecordingSession {
    host: String,
    inner: Box<dyn RemoteSession>,
    log: Log,
}

impl RecordingSession {
    fn log(&self, command: String, result: &Result<CommandResult, RemoteError>) {
        lock(&self.log).push(Interaction::Execute {
            host: self.host.clone(),
            command,
            result: result.clone().map_err(|e| reason(&e)),
        });
    }
}

#[async_trait]
impl RemoteSession for RecordingSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(&mut self, command: &str) -> Result<CommandResult, RemoteError> {
        let result = self.inner.execute(command).await;
        self.log(command.to_string(), &result);
        result
    }

    async fn write_file(&mut self, path: &str, contents: &str) -> Result<CommandResult, RemoteError> {
        let result = self.inner.write_file(path, contents).await;
        self.log(format!("write {path}"), &result);
        result
    }

    async fn disconnect(self: Box<Self>) -> Result<(), RemoteError> {
        self.inner.disconnect().await
    }
}

struct ReplaySession {
    host: String,
    queues: Queues,
}

impl ReplaySession {
    fn next(&self, command: &str) -> Result<CommandResult, RemoteError> {
        let mut queues = lock(&self.queues);
        let queue = queues.entry(self.host.clone()).or_default();
        match queue.front() {
            Some(Interaction::Execute { command: recorded, .. }) if recorded == command => {}
            other => {
                let other = other.cloned();
                return Err(diverged(&self.host, other.as_ref(), command));
            }
        }
        match queue.pop_front() {
            Some(Interaction::Execute { result, .. }) => {
                debug!(host = %self.host, command, "Replayed command");
                result.map_err(|reason| RemoteError::Transport {
                    host: self.host.clone(),
                    reason,
                })
            }
            other => Err(diverged(&self.host, other.as_ref(), command)),
        }
    }
}

#[async_trait]
impl RemoteSession for ReplaySession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(&mut self, command: &str) -> Result<CommandResult, RemoteError> {
        self.next(command)
    }

    async fn write_file(&mut self, path: &str, _contents: &str) -> Result<CommandResult, RemoteError> {
        self.next(&format!("write {path}"))
    }

    async fn disconnect(self: Box<Self>) -> Result<(), RemoteError> {
        Ok(())
    }
}
