//! Engine error kinds and their mapping onto the hex code space.

use ipm_common::errors::ErrorCode;
use ipm_common::remote::RemoteError;
use ipm_common::types::{Operation, TargetKind};
use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;
use crate::version::VersionError;

/// Every failure that leaves the engine.
///
/// Transport errors are folded into [`PatchError::Connectivity`] or
/// [`PatchError::ShellTimeout`] at the boundary; no [`RemoteError`] is ever
/// returned to callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PatchError {
    #[error("invalid version format '{version}': {reason}")]
    InvalidVersionFormat { version: String, reason: String },

    #[error("nodes unreachable: {}", .nodes.join(", "))]
    NodeUnreachable { nodes: Vec<String>, reason: String },

    #[error("a patch session is already active on {launch_node} ({owner})")]
    ConflictingSessionExists { launch_node: String, owner: String },

    #[error("no terminator from the patch tool on {launch_node} after {}s", .waited.as_secs())]
    ExternalToolTimeout {
        launch_node: String,
        log_dir: String,
        waited: Duration,
    },

    #[error("patch tool on {launch_node} exited with status {tool_status}")]
    ExternalToolFailure {
        launch_node: String,
        log_dir: String,
        tool_status: i32,
    },

    #[error("{operation} did not move {} in the expected direction", .nodes.join(", "))]
    VersionRegressionCheckFailed {
        operation: Operation,
        nodes: Vec<String>,
    },

    #[error("idempotency state corrupt: {reason}")]
    IdempotencyStateCorrupt { reason: String },

    #[error("environment setup on {launch_node} failed: {reason}")]
    EnvironmentSetupFailed {
        launch_node: String,
        nodes: Vec<String>,
        reason: String,
    },

    #[error("connection to {host} failed: {reason}")]
    Connectivity { host: String, reason: String },

    #[error("command on {host} timed out: {command}")]
    ShellTimeout { host: String, command: String },

    #[error("services not healthy on {}", .nodes.join(", "))]
    ServicesNotHealthy { nodes: Vec<String> },

    #[error("patch tool on {launch_node} never acknowledged the launch")]
    NoToolResponse { launch_node: String },

    #[error("DB services down on {} after rollback failure", .nodes.join(", "))]
    DbServerDown { nodes: Vec<String> },

    #[error("patch tool not found at {path} on {launch_node}")]
    ToolMissing { launch_node: String, path: String },

    #[error("no usable launch node among {}", .candidates.join(", "))]
    NoLaunchNode { candidates: Vec<String> },

    #[error("launch node {node} is also a target")]
    LaunchNodeIsTarget { node: String },

    #[error("no target nodes in request")]
    NoNodes,

    #[error("transient trust cleanup on {launch_node} failed: {reason}")]
    CleanupFailed { launch_node: String, reason: String },

    #[error("state store: {reason}")]
    StateStore { reason: String },

    #[error("operation {0} is not supported by the orchestration engine")]
    UnsupportedOperation(Operation),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl PatchError {
    /// Hex code for this failure when raised while handling `target`.
    pub fn code(&self, target: TargetKind) -> ErrorCode {
        let domu = target == TargetKind::DomU;
        match self {
            Self::InvalidVersionFormat { .. } => ErrorCode::InvalidTargetVersion,
            Self::NodeUnreachable { .. } => ErrorCode::PatchingNodeSshCheckFailed,
            Self::ConflictingSessionExists { .. } if domu => ErrorCode::PatchmgrDomUSessionAlreadyExist,
            Self::ConflictingSessionExists { .. } => ErrorCode::PatchmgrSessionAlreadyExist,
            Self::ExternalToolTimeout { .. } => ErrorCode::PatchmgrConsoleReadTimeout,
            Self::ExternalToolFailure { .. } if domu => ErrorCode::DomUPatchmgrCommandFailed,
            Self::ExternalToolFailure { .. } => ErrorCode::PatchmgrCommandFailed,
            Self::VersionRegressionCheckFailed { operation, .. } => {
                regression_code(target, operation.is_rollback())
            }
            Self::IdempotencyStateCorrupt { .. } => ErrorCode::CurrentRequestMarkerNotFound,
            Self::EnvironmentSetupFailed { .. } => ErrorCode::PasswdlessSshSetupFailed,
            Self::Connectivity { .. } => ErrorCode::PatchingConnectFailed,
            Self::ShellTimeout { .. } => ErrorCode::ShellCmdExecutionTimeout,
            Self::ServicesNotHealthy { .. } => match target {
                TargetKind::Dom0 => ErrorCode::Dom0ServicesNotRunning,
                TargetKind::DomU => ErrorCode::DomUCriticalServicesNotRunning,
                TargetKind::Cell => ErrorCode::CellServicesNotRunning,
                TargetKind::IbSwitch | TargetKind::RoceSwitch => ErrorCode::SwitchPostcheckFailed,
            },
            Self::NoToolResponse { .. } if domu => ErrorCode::NoPatchmgrResponseDetectedOnDomU,
            Self::NoToolResponse { .. } => ErrorCode::NoPatchmgrResponseDetected,
            Self::DbServerDown { .. } => ErrorCode::DbServerServiceDown,
            Self::ToolMissing { .. } => ErrorCode::PatchmgrScriptMissing,
            Self::NoLaunchNode { .. } => ErrorCode::InsufficientLaunchNodes,
            Self::LaunchNodeIsTarget { .. } => ErrorCode::LaunchNodeShouldNotBeTarget,
            Self::NoNodes => ErrorCode::NoNodesAvailableForPrecheck,
            Self::CleanupFailed { .. } => ErrorCode::PasswdlessSshCleanupFailed,
            Self::UnsupportedOperation(Operation::Oneoff) => ErrorCode::OneoffApplyFailed,
            Self::StateStore { .. } | Self::UnsupportedOperation(_) => ErrorCode::PatchOperationFailed,
            Self::InvalidRequest(_) => ErrorCode::IncorrectInputJson,
        }
    }

    /// Nodes the failure is attributed to.
    pub fn affected_nodes(&self) -> Vec<String> {
        match self {
            Self::NodeUnreachable { nodes, .. }
            | Self::VersionRegressionCheckFailed { nodes, .. }
            | Self::EnvironmentSetupFailed { nodes, .. }
            | Self::ServicesNotHealthy { nodes }
            | Self::DbServerDown { nodes } => nodes.clone(),
            Self::ConflictingSessionExists { launch_node, .. }
            | Self::ExternalToolTimeout { launch_node, .. }
            | Self::ExternalToolFailure { launch_node, .. }
            | Self::NoToolResponse { launch_node }
            | Self::ToolMissing { launch_node, .. }
            | Self::CleanupFailed { launch_node, .. } => vec![launch_node.clone()],
            Self::Connectivity { host, .. } | Self::ShellTimeout { host, .. } => vec![host.clone()],
            Self::LaunchNodeIsTarget { node } => vec![node.clone()],
            Self::NoLaunchNode { candidates } => candidates.clone(),
            Self::InvalidVersionFormat { .. }
            | Self::IdempotencyStateCorrupt { .. }
            | Self::NoNodes
            | Self::StateStore { .. }
            | Self::UnsupportedOperation(_)
            | Self::InvalidRequest(_) => Vec::new(),
        }
    }

    /// Failures whose true state must be re-derived by a later retry.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            Self::DbServerDown { .. } | Self::IdempotencyStateCorrupt { .. }
        )
    }

    /// Operator-facing suggestion.
    pub fn suggestion(&self, target: TargetKind) -> String {
        match self {
            Self::ExternalToolFailure {
                launch_node,
                log_dir,
                ..
            } => format!(
                "Patchmgr command failed on Target {target}, logs available on node {launch_node} at location {log_dir}"
            ),
            Self::UnsupportedOperation(Operation::Oneoff) => {
                format!(
                "ONEOFF plugin is unavailable for {}",
                target.as_str().to_ascii_uppercase()
            )
            }
            Self::ExternalToolTimeout { waited, .. } => format!(
                "Timeout occurred after {} seconds, Could not validate patch operation completion on launch node",
                waited.as_secs()
            ),
            other => other
                .code(target)
                .remediation()
                .first()
                .map(|s| (*s).to_string())
                .unwrap_or_else(|| other.to_string()),
        }
    }
}

fn regression_code(target: TargetKind, rollback: bool) -> ErrorCode {
    match (target, rollback) {
        (TargetKind::Dom0, false) => ErrorCode::Dom0NotAtRequestedVersion,
        (TargetKind::Dom0, true) => ErrorCode::VersionMismatchDuringRollback,
        (TargetKind::DomU, _) => ErrorCode::DomUVersionNotAtExpectedVersion,
        (TargetKind::Cell, false) => ErrorCode::CellVersionExpectedHigher,
        (TargetKind::Cell, true) => ErrorCode::CellVersionExpectedLower,
        (TargetKind::IbSwitch | TargetKind::RoceSwitch, false) => ErrorCode::SwitchVersionExpectedHigher,
        (TargetKind::IbSwitch | TargetKind::RoceSwitch, true) => ErrorCode::SwitchVersionExpectedLower,
    }
}

impl From<RemoteError> for PatchError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Timeout { host, command, .. } => Self::ShellTimeout { host, command },
            other => Self::Connectivity {
                host: other.host().to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<StoreError> for PatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Decode { .. } => Self::IdempotencyStateCorrupt {
                reason: err.to_string(),
            },
            other => Self::StateStore {
                reason: other.to_string(),
            },
        }
    }
}

impl From<VersionError> for PatchError {
    fn from(err: VersionError) -> Self {
        Self::InvalidVersionFormat {
            version: err.version().to_string(),
            reason: err.to_string(),
        }
    }
}

pub type Result<T, E = PatchError> = std::result::Result<T, E>;
