//! Per-target-kind profiles.
//!
//! The table is closed: every [`TargetKind`] has exactly one profile and the
//! match in [`profile`] is checked by the compiler.

use ipm_common::remote::CommandResult;
use ipm_common::types::TargetKind;
use regex::Regex;

/// Node-facing commands and predicates for one target kind.
pub struct TargetProfile {
    pub kind: TargetKind,
    /// Target flag passed to the patch tool.
    pub tool_flag: &'static str,
    pub version_command: &'static str,
    pub health_command: &'static str,
    health: fn(&[&str]) -> bool,
    /// Lists running guest VMs; only dom0 hosts have one.
    pub vm_state_command: Option<&'static str>,
}

impl std::fmt::Debug for TargetProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetProfile")
            .field("kind", &self.kind)
            .field("tool_flag", &self.tool_flag)
            .finish_non_exhaustive()
    }
}

static DOM0: TargetProfile = TargetProfile {
    kind: TargetKind::Dom0,
    tool_flag: "dbnodes",
    version_command: "imageinfo -ver",
    health_command: "systemctl is-active libvirtd",
    health: dom0_healthy,
    vm_state_command: Some("virsh list --name --state-running"),
};

static DOMU: TargetProfile = TargetProfile {
    kind: TargetKind::DomU,
    tool_flag: "dbnodes",
    version_command: "imageinfo -ver",
    health_command: "crsctl check crs",
    health: domu_healthy,
    vm_state_command: None,
};

static CELL: TargetProfile = TargetProfile {
    kind: TargetKind::Cell,
    tool_flag: "cells",
    version_command: "imageinfo -ver",
    health_command: "cellcli -e list cell attributes cellsrvStatus,msStatus,rsStatus",
    health: cell_healthy,
    vm_state_command: None,
};

static IB_SWITCH: TargetProfile = TargetProfile {
    kind: TargetKind::IbSwitch,
    tool_flag: "ibswitches",
    version_command: "version",
    health_command: "env_test",
    health: exit_status_only,
    vm_state_command: None,
};

static ROCE_SWITCH: TargetProfile = TargetProfile {
    kind: TargetKind::RoceSwitch,
    tool_flag: "roceswitches",
    version_command: "show version",
    health_command: "show environment",
    health: exit_status_only,
    vm_state_command: None,
};

pub fn profile(kind: TargetKind) -> &'static TargetProfile {
    match kind {
        TargetKind::Dom0 => &DOM0,
        TargetKind::DomU => &DOMU,
        TargetKind::Cell => &CELL,
        TargetKind::IbSwitch => &IB_SWITCH,
        TargetKind::RoceSwitch => &ROCE_SWITCH,
    }
}

/// Result of one service check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthVerdict {
    pub healthy: bool,
    pub detail: String,
}

impl TargetProfile {
    /// Judge the output of [`Self::health_command`]. Lines matching any
    /// `ignore` pattern are dropped first.
    pub fn evaluate_health(&self, result: &CommandResult, ignore: &[Regex]) -> HealthVerdict {
        if !result.success() {
            return HealthVerdict {
                healthy: false,
                detail: format!("exit {}: {}", result.exit_code, result.stderr.trim()),
            };
        }
        let lines = relevant_lines(&result.stdout, ignore);
        HealthVerdict {
            healthy: (self.health)(&lines),
            detail: lines.join("; "),
        }
    }

    /// Whether the VM listing shows at least one running guest.
    pub fn vms_running(&self, result: &CommandResult, ignore: &[Regex]) -> Option<bool> {
        if !result.success() {
            return None;
        }
        Some(!relevant_lines(&result.stdout, ignore).is_empty())
    }
}

fn relevant_lines<'a>(output: &'a str, ignore: &[Regex]) -> Vec<&'a str> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !ignore.iter().any(|re| re.is_match(l)))
        .collect()
}

fn dom0_healthy(lines: &[&str]) -> bool {
    !lines.is_empty() && lines.iter().all(|l| *l == "active")
}

fn domu_healthy(lines: &[&str]) -> bool {
    !lines.is_empty() && lines.iter().all(|l| l.contains("is online"))
}

fn cell_healthy(lines: &[&str]) -> bool {
    let mut statuses = lines.iter().flat_map(|l| l.split_whitespace()).peekable();
    statuses.peek().is_some() && statuses.all(|s| s.eq_ignore_ascii_case("running"))
}

fn exit_status_only(_: &[&str]) -> bool {
    true
}
