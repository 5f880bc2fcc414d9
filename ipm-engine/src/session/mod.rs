//! External patch tool session on one launch node.
//!
//! Lifecycle: `NOT_STARTED -> RUNNING -> {COMPLETED, TIMED_OUT}`. The tool
//! runs detached; a timed-out session is left running for the operator.

pub mod command;
pub mod console;

use crate::error::PatchError;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use command::SessionPaths;
use console::ConsoleScan;
use ipm_common::SUCCESS_CODE;
use ipm_common::errors::ErrorCode;
use ipm_common::remote::quote;
use ipm_common::types::{PatchRequest, RequestId, TargetKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

pub use command::build_command;

/// Lists tool processes; exit 0 means at least one is running.
pub const PROCESS_PROBE: &str = "ps -ef | egrep -i 'patchmgr -' | egrep -vi 'grep|tail'";

const CONSOLE_TAIL_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    NotStarted,
    Running,
    Completed,
    TimedOut,
}

/// Durable description of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub launch_node: String,
    /// Marker file whose presence signals an active session.
    pub process_marker: String,
    pub state: SessionState,
    /// Status parsed from the console terminator.
    pub tool_status: Option<i32>,
    /// Hex code for the session outcome, set once it ends.
    pub exit_status: Option<String>,
    pub log_dir: String,
    pub console_path: String,
    pub started_at: Option<DateTime<Utc>>,
}

/// Poll and acknowledgement timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    pub ack_attempts: u32,
}

impl SessionTimings {
    /// Timings for the mock overlay.
    pub fn fast() -> Self {
        Self {
            poll_timeout: Duration::from_millis(250),
            poll_interval: Duration::from_millis(5),
            ack_attempts: 3,
        }
    }
}

/// Result of inspecting the launch node before starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictCheck {
    Clear,
    /// The marker belongs to this request.
    Owned,
    Conflict { owner: String },
}

pub struct ExternalPatchSession {
    transport: Transport,
    request_id: RequestId,
    target_kind: TargetKind,
    paths: SessionPaths,
    timings: SessionTimings,
    record: SessionRecord,
}

impl ExternalPatchSession {
    pub fn new(
        transport: Transport,
        request: &PatchRequest,
        launch_node: &str,
        patch_base: &str,
        timings: SessionTimings,
    ) -> Self {
        let paths = SessionPaths::new(patch_base, request);
        let record = SessionRecord {
            launch_node: launch_node.to_string(),
            process_marker: paths.marker.clone(),
            state: SessionState::NotStarted,
            tool_status: None,
            exit_status: None,
            log_dir: paths.log_dir.clone(),
            console_path: paths.console.clone(),
            started_at: None,
        };
        Self {
            transport,
            request_id: request.request_id,
            target_kind: request.target_kind,
            paths,
            timings,
            record,
        }
    }

    /// Rebuild a session from its persisted record.
    pub fn resume(
        transport: Transport,
        request: &PatchRequest,
        record: SessionRecord,
        patch_base: &str,
        timings: SessionTimings,
    ) -> Self {
        let mut session = Self::new(transport, request, &record.launch_node, patch_base, timings);
        session.record = record;
        session
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn launch_node(&self) -> &str {
        &self.record.launch_node
    }

    pub fn state(&self) -> SessionState {
        self.record.state
    }

    async fn marker_owner(&self) -> Result<Option<String>, PatchError> {
        let result = self
            .transport
            .run(self.launch_node(), &format!("cat {}", quote(&self.paths.marker)))
            .await?;
        let owner = result.stdout.trim();
        Ok((result.success() && !owner.is_empty()).then(|| owner.to_string()))
    }

    /// Whether a tool process is alive on the launch node.
    pub async fn is_process_running(&self) -> Result<bool, PatchError> {
        Ok(self.transport.run(self.launch_node(), PROCESS_PROBE).await?.success())
    }

    /// Look for another session on the launch node.
    pub async fn check_for_conflicting_session(&self) -> Result<ConflictCheck, PatchError> {
        if let Some(owner) = self.marker_owner().await? {
            if owner == self.request_id.to_string() {
                return Ok(ConflictCheck::Owned);
            }
            return Ok(ConflictCheck::Conflict {
                owner: format!("request {owner}"),
            });
        }
        if self.is_process_running().await? {
            return Ok(ConflictCheck::Conflict {
                owner: "running patchmgr process".to_string(),
            });
        }
        Ok(ConflictCheck::Clear)
    }

    /// Launch the tool detached and wait for it to acknowledge.
    pub async fn start(&mut self, command: &str) -> Result<(), PatchError> {
        let node = self.launch_node().to_string();
        self.transport
            .run(&node, &format!("mkdir -p {}", quote(&self.paths.log_dir)))
            .await?;
        self.claim_marker().await?;

        info!(launch_node = %node, target = %self.target_kind, "Starting patch tool");
        debug!(launch_node = %node, command, "Launch command");
        let launched = self.transport.run(&node, command).await?;
        if !launched.success() {
            return Err(PatchError::ExternalToolFailure {
                launch_node: node,
                log_dir: self.paths.log_dir.clone(),
                tool_status: launched.exit_code,
            });
        }
        self.record.state = SessionState::Running;
        self.record.started_at = Some(Utc::now());

        self.wait_for_ack().await
    }

    /// Create the session marker; the shell refuses if it already exists.
    async fn claim_marker(&self) -> Result<(), PatchError> {
        let node = self.launch_node();
        let claim = self
            .transport
            .run(
                node,
                &format!("set -o noclobber; echo {} > {}", self.request_id, quote(&self.paths.marker)),
            )
            .await?;
        if claim.success() {
            return Ok(());
        }
        match self.marker_owner().await? {
            Some(owner) if owner == self.request_id.to_string() => Ok(()),
            Some(owner) => {
                warn!(launch_node = %node, owner = %owner, "Session marker claimed by another request");
                Err(PatchError::ConflictingSessionExists {
                    launch_node: node.to_string(),
                    owner: format!("request {owner}"),
                })
            }
            None => Err(PatchError::ConflictingSessionExists {
                launch_node: node.to_string(),
                owner: format!("unreadable session marker ({})", claim.stderr.trim()),
            }),
        }
    }

    async fn wait_for_ack(&self) -> Result<(), PatchError> {
        let node = self.launch_node();
        let attempts = self.timings.ack_attempts.max(1);
        for attempt in 1..=attempts {
            if self.transport.file_exists(node, &self.paths.notifications).await? {
                debug!(launch_node = %node, attempt, "Patch tool acknowledged launch");
                return Ok(());
            }
            if attempt < attempts {
                sleep(self.transport.policy().backoff_delay(attempt)).await;
            }
        }
        if self.is_process_running().await? {
            warn!(launch_node = %node, "No notifications yet but patch tool process is running");
            return Ok(());
        }
        Err(PatchError::NoToolResponse {
            launch_node: node.to_string(),
        })
    }

    /// Read and scan the console once. A missing console reads as empty.
    pub async fn inspect_console(&self) -> Result<(ConsoleScan, String), PatchError> {
        let result = self
            .transport
            .run(self.launch_node(), &format!("cat {}", quote(&self.paths.console)))
            .await?;
        let text = if result.success() { result.stdout } else { String::new() };
        Ok((console::scan(&text), text))
    }

    /// Poll the console until a terminator appears or the timeout passes.
    ///
    /// A timeout leaves the tool running. Transport errors that outlast the
    /// retry policy surface as connectivity errors.
    pub async fn poll_until_complete(&mut self) -> Result<SessionState, PatchError> {
        let deadline = Instant::now() + self.timings.poll_timeout;
        let mut last_progress: Option<String> = None;

        loop {
            let (scan, text) = self.inspect_console().await?;
            if scan.last_progress != last_progress {
                if let Some(progress) = &scan.last_progress {
                    info!(launch_node = %self.launch_node(), progress = %progress, "Patch tool progress");
                }
                last_progress = scan.last_progress.clone();
            }
            if let Some(status) = scan.terminator {
                self.finish(status);
                debug!(
                    launch_node = %self.launch_node(),
                    console = %console::tail(&text, CONSOLE_TAIL_LINES),
                    "Console tail"
                );
                return Ok(self.record.state);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    launch_node = %self.launch_node(),
                    waited_secs = self.timings.poll_timeout.as_secs(),
                    "No terminator before timeout; leaving patch tool running"
                );
                self.record.state = SessionState::TimedOut;
                self.record.exit_status = Some(ErrorCode::PatchmgrConsoleReadTimeout.code_string());
                return Ok(self.record.state);
            }
            sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }

    /// Record a terminator seen in the console.
    pub fn finish(&mut self, tool_status: i32) {
        self.record.state = SessionState::Completed;
        self.record.tool_status = Some(tool_status);
        self.record.exit_status = Some(if tool_status == 0 {
            SUCCESS_CODE.to_string()
        } else {
            self.failure_error(tool_status).code(self.target_kind).code_string()
        });
        info!(launch_node = %self.launch_node(), tool_status, "Patch tool finished");
    }

    fn failure_error(&self, tool_status: i32) -> PatchError {
        PatchError::ExternalToolFailure {
            launch_node: self.launch_node().to_string(),
            log_dir: self.paths.log_dir.clone(),
            tool_status,
        }
    }

    /// Hex status of a finished session; `None` while it is still running.
    pub fn status_code(&self) -> Option<&str> {
        match self.record.state {
            SessionState::Completed | SessionState::TimedOut => self.record.exit_status.as_deref(),
            SessionState::NotStarted | SessionState::Running => None,
        }
    }

    /// Turn a finished session into the engine's result.
    pub fn outcome(&self) -> Result<(), PatchError> {
        match (self.record.state, self.record.tool_status) {
            (SessionState::Completed, Some(0)) => Ok(()),
            (SessionState::Completed, status) => Err(self.failure_error(status.unwrap_or(-1))),
            (SessionState::TimedOut, _) => Err(PatchError::ExternalToolTimeout {
                launch_node: self.launch_node().to_string(),
                log_dir: self.paths.log_dir.clone(),
                waited: self.timings.poll_timeout,
            }),
            (state, _) => Err(PatchError::IdempotencyStateCorrupt {
                reason: format!("session on {} has not finished ({state:?})", self.launch_node()),
            }),
        }
    }

    /// Remove the session marker if it is still ours.
    pub async fn release(&self) -> Result<(), PatchError> {
        if self.marker_owner().await?.as_deref() == Some(self.request_id.to_string().as_str()) {
            self.transport
                .run(self.launch_node(), &format!("rm -f {}", quote(&self.paths.marker)))
                .await?;
        }
        Ok(())
    }
}
