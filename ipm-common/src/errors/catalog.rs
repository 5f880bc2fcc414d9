//! Error Catalog for the Infra Patch Manager
//!
//! Every failure surfaced to an operator carries a fixed-width hex code in
//! the `0x03SSNNNN` space. The four hex digits after `0x` select the
//! subsystem that owns the code:
//!
//! | Prefix      | Category | Description                               |
//! |-------------|----------|-------------------------------------------|
//! | 0301        | Generic  | Session, transport and request errors     |
//! | 0302 / 0303 | Dom0     | Hypervisor host prechecks and patching    |
//! | 0304 / 0305 | DomU     | Guest VM prechecks and patching           |
//! | 0306 / 0307 | Cell     | Storage node prechecks and patching       |
//! | 0308 / 0309 | Switch   | IB and RoCE switch prechecks and patching |
//! | 030D        | Plugin   | One-off plugin application                |
//!
//! Each entry carries a message, remediation steps and the action the
//! upstream control plane should take when it sees the code.
//!
//! # Example
//!
//! ```rust
//! use ipm_common::errors::catalog::ErrorCode;
//!
//! let entry = ErrorCode::PatchmgrSessionAlreadyExist.entry();
//! println!("{}", entry.format_full());
//! ```

use crate::types::TargetKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Code reported when an operation completes without error.
pub const SUCCESS_CODE: &str = "0x00000000";

/// Error code enumeration covering the patch orchestration failure space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Generic (0x0301xxxx)
    // =========================================================================
    /// Fallback for any code not present in the catalog
    PatchOperationFailed,
    /// Request payload could not be understood
    IncorrectInputJson,
    /// Request exceeded its overall deadline
    PatchRequestTimeout,
    /// The external tool never started
    PatchOperationDidNotStart,
    /// Tool script missing on the launch node
    PatchmgrScriptMissing,
    /// Another tool session is active on the launch node
    PatchmgrSessionAlreadyExist,
    /// Every node is already at the requested version
    NoActionRequired,
    /// Node list empty for a precheck
    NoNodesAvailableForPrecheck,
    /// One or more nodes failed the SSH reachability probe
    PatchingNodeSshCheckFailed,
    /// Transient trust could not be removed
    PasswdlessSshCleanupFailed,
    /// No terminator appeared in the console log before the deadline
    PatchmgrConsoleReadTimeout,
    /// The external tool exited with a non-zero status
    PatchmgrCommandFailed,
    /// None of the launch node candidates are usable
    InsufficientLaunchNodes,
    /// Connection to a node failed after retries
    PatchingConnectFailed,
    /// Idempotency marker disagrees with the launch node
    CurrentRequestMarkerNotFound,
    /// Launch node also appears in the target list
    LaunchNodeShouldNotBeTarget,
    /// A remote shell command exceeded its timeout
    ShellCmdExecutionTimeout,
    /// Target version does not match any accepted grammar
    InvalidTargetVersion,
    /// Trust bootstrap or node-list artifact could not be established
    PasswdlessSshSetupFailed,

    // =========================================================================
    // Dom0 (0x0302xxxx / 0x0303xxxx)
    // =========================================================================
    /// Rollback requested but version unchanged
    VersionMismatchDuringRollback,
    /// Dom0 not at requested version after patch
    Dom0NotAtRequestedVersion,
    /// DB services down on dom0
    DbServerServiceDown,
    /// Dom0 services not running
    Dom0ServicesNotRunning,
    /// Generic postcheck failure
    PostchecksFailed,
    /// Tool launched but never acknowledged
    NoPatchmgrResponseDetected,
    /// Tool launched but never acknowledged (guest VM)
    NoPatchmgrResponseDetectedOnDomU,

    // =========================================================================
    // DomU (0x0304xxxx / 0x0305xxxx)
    // =========================================================================
    /// Critical services on the VM are down
    DomUCriticalServicesNotRunning,
    /// VM not at expected version
    DomUVersionNotAtExpectedVersion,
    /// Tool session already exists (guest VM)
    PatchmgrDomUSessionAlreadyExist,
    /// Tool failed (guest VM)
    DomUPatchmgrCommandFailed,

    // =========================================================================
    // Cell (0x0306xxxx / 0x0307xxxx)
    // =========================================================================
    /// Cell services not running
    CellServicesNotRunning,
    /// Cell version expected higher after patch
    CellVersionExpectedHigher,
    /// Cell version expected lower after rollback
    CellVersionExpectedLower,

    // =========================================================================
    // Switch (0x0308xxxx / 0x0309xxxx)
    // =========================================================================
    /// Switch postcheck failed
    SwitchPostcheckFailed,
    /// Switch version expected lower after rollback
    SwitchVersionExpectedLower,
    /// Switch version expected higher after patch
    SwitchVersionExpectedHigher,

    // =========================================================================
    // Plugin (0x030Dxxxx)
    // =========================================================================
    /// One-off plugin missing or failed
    OneoffApplyFailed,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[must_use]
    pub const fn code_number(&self) -> u32 {
        match self {
            Self::PatchOperationFailed => 0x0301_0000,
            Self::IncorrectInputJson => 0x0301_0004,
            Self::PatchRequestTimeout => 0x0301_0005,
            Self::PatchOperationDidNotStart => 0x0301_000F,
            Self::PatchmgrScriptMissing => 0x0301_003A,
            Self::PatchmgrSessionAlreadyExist => 0x0301_003B,
            Self::NoActionRequired => 0x0301_003D,
            Self::NoNodesAvailableForPrecheck => 0x0301_003E,
            Self::PatchingNodeSshCheckFailed => 0x0301_003F,
            Self::PasswdlessSshCleanupFailed => 0x0301_0040,
            Self::PatchmgrConsoleReadTimeout => 0x0301_0044,
            Self::PatchmgrCommandFailed => 0x0301_0045,
            Self::InsufficientLaunchNodes => 0x0301_0046,
            Self::PatchingConnectFailed => 0x0301_0055,
            Self::CurrentRequestMarkerNotFound => 0x0301_005A,
            Self::LaunchNodeShouldNotBeTarget => 0x0301_005B,
            Self::ShellCmdExecutionTimeout => 0x0301_0067,
            Self::InvalidTargetVersion => 0x0301_0071,
            Self::PasswdlessSshSetupFailed => 0x0301_0074,

            Self::VersionMismatchDuringRollback => 0x0303_0003,
            Self::Dom0NotAtRequestedVersion => 0x0303_0004,
            Self::DbServerServiceDown => 0x0303_0006,
            Self::Dom0ServicesNotRunning => 0x0303_000B,
            Self::PostchecksFailed => 0x0303_0011,
            Self::NoPatchmgrResponseDetected => 0x0303_0025,
            Self::NoPatchmgrResponseDetectedOnDomU => 0x0303_0026,

            Self::DomUCriticalServicesNotRunning => 0x0305_0001,
            Self::DomUVersionNotAtExpectedVersion => 0x0305_000E,
            Self::PatchmgrDomUSessionAlreadyExist => 0x0305_0015,
            Self::DomUPatchmgrCommandFailed => 0x0305_0017,

            Self::CellServicesNotRunning => 0x0307_0008,
            Self::CellVersionExpectedHigher => 0x0307_0009,
            Self::CellVersionExpectedLower => 0x0307_000A,

            Self::SwitchPostcheckFailed => 0x0308_0000,
            Self::SwitchVersionExpectedLower => 0x0309_0000,
            Self::SwitchVersionExpectedHigher => 0x0309_0004,

            Self::OneoffApplyFailed => 0x030D_0000,
        }
    }

    /// Returns the formatted code string (e.g., "0x0301003B").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("0x{:08X}", self.code_number())
    }

    /// Returns the subsystem that owns this code.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        ErrorCategory::from_code_number(self.code_number())
    }

    /// Looks up a code string such as `"0x0301003B"` (case-insensitive).
    pub fn from_code_str(code: &str) -> Option<Self> {
        let digits = code.trim().strip_prefix("0x").or_else(|| code.trim().strip_prefix("0X"))?;
        let number = u32::from_str_radix(digits, 16).ok()?;
        Self::all()
            .iter()
            .copied()
            .find(|c| c.code_number() == number)
    }

    /// Like [`from_code_str`](Self::from_code_str) but falls back to the
    /// generic failure for anything outside the catalog.
    #[must_use]
    pub fn resolve(code: &str) -> Self {
        Self::from_code_str(code).unwrap_or(Self::PatchOperationFailed)
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        self.entry_for(None)
    }

    /// Entry with the action adjusted for the target kind that failed.
    #[must_use]
    pub fn entry_for(&self, target: Option<TargetKind>) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            action: self.action_for(target),
        }
    }

    /// Returns the error message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::PatchOperationFailed => "Patch operation status failed",
            Self::IncorrectInputJson => "Could not parse the patch request payload",
            Self::PatchRequestTimeout => "Patch request timed out",
            Self::PatchOperationDidNotStart => "Patch operation did not start",
            Self::PatchmgrScriptMissing => "Unable to locate the patch tool on the launch node",
            Self::PatchmgrSessionAlreadyExist => "Patch tool session already exists",
            Self::NoActionRequired => "No action required, nodes are already at the requested version",
            Self::NoNodesAvailableForPrecheck => "No nodes available to run precheck",
            Self::PatchingNodeSshCheckFailed => "SSH connectivity check failed during patching",
            Self::PasswdlessSshCleanupFailed => {
                "Passwordless SSH cleanup failed, remove transient keys for security compliance"
            }
            Self::PatchmgrConsoleReadTimeout => {
                "Timeout occurred, could not validate patch operation completion on launch node"
            }
            Self::PatchmgrCommandFailed => "Patch tool command failed with non-zero status",
            Self::InsufficientLaunchNodes => "Insufficient launch nodes available to patch",
            Self::PatchingConnectFailed => {
                "Node connect failed, validate connectivity and authentication before retrying"
            }
            Self::CurrentRequestMarkerNotFound => {
                "Current patch request marker does not match the state of the launch node"
            }
            Self::LaunchNodeShouldNotBeTarget => "Launch node must not be one of the target nodes",
            Self::ShellCmdExecutionTimeout => "Command timed out before it completed",
            Self::InvalidTargetVersion => "Target version passed is invalid",
            Self::PasswdlessSshSetupFailed => {
                "Passwordless SSH or node list setup failed on the launch node"
            }

            Self::VersionMismatchDuringRollback => {
                "Dom0 rollback was requested but the version seems to be unchanged"
            }
            Self::Dom0NotAtRequestedVersion => "Dom0 is not at the requested version",
            Self::DbServerServiceDown => "DB services were not up on dom0",
            Self::Dom0ServicesNotRunning => "Critical dom0 services are not running",
            Self::PostchecksFailed => "Basic patch postchecks failed",
            Self::NoPatchmgrResponseDetected => "No patch tool response detected on the current target",
            Self::NoPatchmgrResponseDetectedOnDomU => "No patch tool response detected on the VM",

            Self::DomUCriticalServicesNotRunning => "Critical services on the VM are down",
            Self::DomUVersionNotAtExpectedVersion => "VM version not at the expected version",
            Self::PatchmgrDomUSessionAlreadyExist => "Patch tool session on the VM already exists",
            Self::DomUPatchmgrCommandFailed => "Patch tool command on the VM failed",

            Self::CellServicesNotRunning => "Critical cell services not running",
            Self::CellVersionExpectedHigher => {
                "Current version on the cell is expected to be higher than the original version"
            }
            Self::CellVersionExpectedLower => {
                "Current version on the cell is expected to be lower than the original version"
            }

            Self::SwitchPostcheckFailed => "Basic switch postchecks failed",
            Self::SwitchVersionExpectedLower => {
                "Current version on the switch is expected to be lower than the original version"
            }
            Self::SwitchVersionExpectedHigher => {
                "Current version on the switch is expected to be higher than the original version"
            }

            Self::OneoffApplyFailed => "One-off plugin apply failed",
        }
    }

    /// Returns remediation steps.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::PatchOperationFailed => &[
                "Inspect the patch tool logs on the launch node",
                "Retry the request with the same request id once the cause is understood",
            ],
            Self::IncorrectInputJson => &[
                "Validate the request against `ipmd schema`",
                "Check that targetKind and operation use the documented names",
            ],
            Self::PatchRequestTimeout => &[
                "Check whether the patch tool is still running on the launch node",
                "Retry with the same request id to re-attach instead of restarting",
            ],
            Self::PatchOperationDidNotStart => &[
                "Check disk space and permissions in the patch base on the launch node",
            ],
            Self::PatchmgrScriptMissing => &[
                "Stage the patch bundle under the configured patch base",
                "Verify paths.patch_base in the configuration",
            ],
            Self::PatchmgrSessionAlreadyExist | Self::PatchmgrDomUSessionAlreadyExist => &[
                "Wait for the active session to finish, or inspect it with: ps -ef | grep patchmgr",
                "Remove a stale session marker only after confirming no tool process is running",
            ],
            Self::NoActionRequired => &["No remediation needed"],
            Self::NoNodesAvailableForPrecheck => &[
                "Check the node list in the request",
                "Nodes already at the target version are skipped",
            ],
            Self::PatchingNodeSshCheckFailed | Self::PatchingConnectFailed => &[
                "Verify the node is up and sshd is running",
                "Verify SSH keys and known_hosts for the orchestrator user",
                "Increase timeouts.ssh_connect_secs if the network is slow",
            ],
            Self::PasswdlessSshCleanupFailed => &[
                "Remove lines tagged ipm-transient-<request id> from authorized_keys on each target",
            ],
            Self::PatchmgrConsoleReadTimeout => &[
                "The tool was not stopped; check PatchmgrConsole.out on the launch node",
                "Retry with the same request id to resume polling",
                "Increase timeouts.session_poll_secs for large fleets",
            ],
            Self::PatchmgrCommandFailed | Self::DomUPatchmgrCommandFailed => &[
                "Inspect the patch tool logs under the reported log directory",
                "Fix the reported issue and retry the request",
            ],
            Self::InsufficientLaunchNodes => &[
                "Provide at least one reachable launch node candidate",
            ],
            Self::CurrentRequestMarkerNotFound => &[
                "Inspect the idempotency marker and the launch node manually",
                "This state is never resolved automatically",
            ],
            Self::LaunchNodeShouldNotBeTarget => &[
                "Choose a launch node outside the target list",
            ],
            Self::ShellCmdExecutionTimeout => &[
                "Check load on the node",
                "Increase timeouts.shell_command_secs",
            ],
            Self::InvalidTargetVersion => &[
                "Use a quarterly version (e.g. 21.2.11.0.0.220414.1) or an incremental one (e.g. 220414.1)",
                "LATEST is only accepted for dom0 live updates",
            ],
            Self::PasswdlessSshSetupFailed => &[
                "Verify the launch node can reach every target over SSH",
                "Check write permissions on the patch base directory",
            ],
            Self::VersionMismatchDuringRollback
            | Self::Dom0NotAtRequestedVersion
            | Self::DomUVersionNotAtExpectedVersion
            | Self::CellVersionExpectedHigher
            | Self::CellVersionExpectedLower
            | Self::SwitchVersionExpectedLower
            | Self::SwitchVersionExpectedHigher => &[
                "Compare the image version on the node with the recorded pre-operation version",
                "The tool reported success; inspect its logs before retrying",
            ],
            Self::DbServerServiceDown => &[
                "Check libvirtd and VM state on the dom0",
                "The idempotency marker was kept; retry with the same request id after inspection",
            ],
            Self::Dom0ServicesNotRunning
            | Self::DomUCriticalServicesNotRunning
            | Self::CellServicesNotRunning => &[
                "Restart the reported services on the node",
                "Add known issues to postcheck.known_issues if they are expected",
            ],
            Self::PostchecksFailed | Self::SwitchPostcheckFailed => &[
                "Review the postcheck output for the affected nodes",
            ],
            Self::NoPatchmgrResponseDetected | Self::NoPatchmgrResponseDetectedOnDomU => &[
                "Check that the tool can be launched manually from the patch base",
                "Check the notifications directory under the log directory",
            ],
            Self::OneoffApplyFailed => &[
                "Enable the one-off plugin for the target before requesting ONEOFF",
            ],
        }
    }

    /// Action the control plane takes by default.
    #[must_use]
    pub const fn action(&self) -> ErrorAction {
        match self {
            Self::DomUCriticalServicesNotRunning
            | Self::DomUVersionNotAtExpectedVersion
            | Self::PatchmgrDomUSessionAlreadyExist
            | Self::DomUPatchmgrCommandFailed => ErrorAction::FailAndShow,
            Self::PatchmgrConsoleReadTimeout => ErrorAction::RetryWithSameToken,
            _ => ErrorAction::FailDontshowPageOncall,
        }
    }

    /// Action adjusted for the target kind; guest VM failures on some
    /// generic codes are shown to the customer.
    #[must_use]
    pub const fn action_for(&self, target: Option<TargetKind>) -> ErrorAction {
        if matches!(target, Some(TargetKind::DomU))
            && matches!(
                self,
                Self::PatchRequestTimeout
                    | Self::PatchmgrScriptMissing
                    | Self::PasswdlessSshCleanupFailed
                    | Self::PatchmgrCommandFailed
                    | Self::InsufficientLaunchNodes
                    | Self::PatchingConnectFailed
            )
        {
            return ErrorAction::FailAndShow;
        }
        self.action()
    }

    /// Returns all error codes.
    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::PatchOperationFailed,
            Self::IncorrectInputJson,
            Self::PatchRequestTimeout,
            Self::PatchOperationDidNotStart,
            Self::PatchmgrScriptMissing,
            Self::PatchmgrSessionAlreadyExist,
            Self::NoActionRequired,
            Self::NoNodesAvailableForPrecheck,
            Self::PatchingNodeSshCheckFailed,
            Self::PasswdlessSshCleanupFailed,
            Self::PatchmgrConsoleReadTimeout,
            Self::PatchmgrCommandFailed,
            Self::InsufficientLaunchNodes,
            Self::PatchingConnectFailed,
            Self::CurrentRequestMarkerNotFound,
            Self::LaunchNodeShouldNotBeTarget,
            Self::ShellCmdExecutionTimeout,
            Self::InvalidTargetVersion,
            Self::PasswdlessSshSetupFailed,
            Self::VersionMismatchDuringRollback,
            Self::Dom0NotAtRequestedVersion,
            Self::DbServerServiceDown,
            Self::Dom0ServicesNotRunning,
            Self::PostchecksFailed,
            Self::NoPatchmgrResponseDetected,
            Self::NoPatchmgrResponseDetectedOnDomU,
            Self::DomUCriticalServicesNotRunning,
            Self::DomUVersionNotAtExpectedVersion,
            Self::PatchmgrDomUSessionAlreadyExist,
            Self::DomUPatchmgrCommandFailed,
            Self::CellServicesNotRunning,
            Self::CellVersionExpectedHigher,
            Self::CellVersionExpectedLower,
            Self::SwitchPostcheckFailed,
            Self::SwitchVersionExpectedLower,
            Self::SwitchVersionExpectedHigher,
            Self::OneoffApplyFailed,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Subsystem that owns a range of codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Session, transport and request errors (0301)
    Generic,
    /// Hypervisor host errors (0302-0303)
    Dom0,
    /// Guest VM errors (0304-0305)
    DomU,
    /// Storage node errors (0306-0307)
    Cell,
    /// Switch errors (0308-0309)
    Switch,
    /// One-off plugin errors (030D)
    Plugin,
}

impl ErrorCategory {
    /// Category from the range key, i.e. hex digits 2..6 of the code string.
    #[must_use]
    pub const fn from_code_number(number: u32) -> Self {
        match number >> 16 {
            0x0302 | 0x0303 => Self::Dom0,
            0x0304 | 0x0305 => Self::DomU,
            0x0306 | 0x0307 => Self::Cell,
            0x0308 | 0x0309 => Self::Switch,
            0x030D => Self::Plugin,
            _ => Self::Generic,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Generic => "Generic",
            Self::Dom0 => "Dom0",
            Self::DomU => "DomU",
            Self::Cell => "Cell",
            Self::Switch => "Switch",
            Self::Plugin => "Plugin",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// What the upstream control plane should do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorAction {
    FailAndShow,
    FailDontshowPageOncall,
    RetryWithSameToken,
    RetryWithDifferentToken,
}

impl Default for ErrorAction {
    fn default() -> Self {
        Self::FailDontshowPageOncall
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ErrorEntry {
    /// Code string (e.g., "0x0301003B")
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub remediation: Vec<String>,
    pub action: ErrorAction,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("Remediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numbers_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::all() {
            let num = code.code_number();
            assert!(
                seen.insert(num),
                "Duplicate error code number: {:#010X} for {:?}",
                num,
                code
            );
        }
    }

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::PatchOperationFailed.code_string(), "0x03010000");
        assert_eq!(
            ErrorCode::PatchmgrSessionAlreadyExist.code_string(),
            "0x0301003B"
        );
        assert_eq!(
            ErrorCode::CellVersionExpectedLower.code_string(),
            "0x0307000A"
        );
        for code in ErrorCode::all() {
            let s = code.code_string();
            assert_eq!(s.len(), 10, "{:?} is not fixed width", code);
            assert!(s.starts_with("0x03"));
        }
    }

    #[test]
    fn test_error_categories_follow_range_key() {
        assert_eq!(
            ErrorCode::PatchingConnectFailed.category(),
            ErrorCategory::Generic
        );
        assert_eq!(ErrorCode::DbServerServiceDown.category(), ErrorCategory::Dom0);
        assert_eq!(
            ErrorCode::DomUPatchmgrCommandFailed.category(),
            ErrorCategory::DomU
        );
        assert_eq!(
            ErrorCode::CellServicesNotRunning.category(),
            ErrorCategory::Cell
        );
        assert_eq!(
            ErrorCode::SwitchVersionExpectedHigher.category(),
            ErrorCategory::Switch
        );
        assert_eq!(ErrorCode::OneoffApplyFailed.category(), ErrorCategory::Plugin);
        // The no-response code lives in the dom0 range even for VMs.
        assert_eq!(
            ErrorCode::NoPatchmgrResponseDetectedOnDomU.category(),
            ErrorCategory::Dom0
        );
    }

    #[test]
    fn test_from_code_str_round_trips_and_falls_back() {
        for code in ErrorCode::all() {
            assert_eq!(ErrorCode::from_code_str(&code.code_string()), Some(*code));
        }
        assert_eq!(
            ErrorCode::from_code_str("0x0301003b"),
            Some(ErrorCode::PatchmgrSessionAlreadyExist)
        );
        assert_eq!(ErrorCode::from_code_str("0301003B"), None);
        assert_eq!(
            ErrorCode::resolve("0x0301FFFF"),
            ErrorCode::PatchOperationFailed
        );
        assert_eq!(ErrorCode::resolve("garbage"), ErrorCode::PatchOperationFailed);
    }

    #[test]
    fn test_all_errors_have_message_and_remediation() {
        for code in ErrorCode::all() {
            assert!(!code.message().is_empty(), "{:?} has empty message", code);
            assert!(
                !code.remediation().is_empty(),
                "{:?} has no remediation steps",
                code
            );
        }
    }

    #[test]
    fn test_domu_generic_codes_are_shown() {
        let code = ErrorCode::PatchmgrCommandFailed;
        assert_eq!(code.action(), ErrorAction::FailDontshowPageOncall);
        assert_eq!(
            code.action_for(Some(TargetKind::DomU)),
            ErrorAction::FailAndShow
        );
        assert_eq!(
            code.action_for(Some(TargetKind::Cell)),
            ErrorAction::FailDontshowPageOncall
        );
        assert_eq!(
            ErrorCode::InvalidTargetVersion.action_for(Some(TargetKind::DomU)),
            ErrorAction::FailDontshowPageOncall
        );
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::PatchingConnectFailed).unwrap();
        assert_eq!(json, "\"PATCHING_CONNECT_FAILED\"");
        let action = serde_json::to_string(&ErrorAction::FailDontshowPageOncall).unwrap();
        assert_eq!(action, "\"FAIL_DONTSHOW_PAGE_ONCALL\"");
    }

    #[test]
    fn test_format_full_and_brief() {
        let entry = ErrorCode::PatchmgrConsoleReadTimeout.entry();
        let full = entry.format_full();
        assert!(full.contains("[0x03010044]"));
        assert!(full.contains("Remediation steps:"));
        assert!(full.contains("  1. "));
        assert_eq!(
            entry.format_brief(),
            format!("[0x03010044] {}", ErrorCode::PatchmgrConsoleReadTimeout.message())
        );
        assert_eq!(format!("{entry}"), entry.format_brief());
    }
}
