//! Common types used across IPM components.

use crate::mock::MockFixtures;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for one patch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Class of infrastructure unit being patched.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, schemars::JsonSchema,
)]
pub enum TargetKind {
    /// Hypervisor host.
    #[serde(rename = "DOM0")]
    Dom0,
    /// Guest VM.
    #[serde(rename = "DOMU")]
    DomU,
    /// Storage node.
    #[serde(rename = "CELL")]
    Cell,
    /// InfiniBand switch.
    #[serde(rename = "IB_SWITCH")]
    IbSwitch,
    /// RoCE switch.
    #[serde(rename = "ROCE_SWITCH")]
    RoceSwitch,
}

impl TargetKind {
    /// Lowercase name used in file names and store keys.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dom0 => "dom0",
            Self::DomU => "domu",
            Self::Cell => "cell",
            Self::IbSwitch => "ibswitch",
            Self::RoceSwitch => "roceswitch",
        }
    }

    pub const fn all() -> &'static [TargetKind] {
        &[
            Self::Dom0,
            Self::DomU,
            Self::Cell,
            Self::IbSwitch,
            Self::RoceSwitch,
        ]
    }

    pub const fn is_switch(&self) -> bool {
        matches!(self, Self::IbSwitch | Self::RoceSwitch)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "dom0" => Ok(Self::Dom0),
            "domu" => Ok(Self::DomU),
            "cell" => Ok(Self::Cell),
            "ibswitch" => Ok(Self::IbSwitch),
            "roceswitch" => Ok(Self::RoceSwitch),
            other => Err(format!("unknown target kind '{other}'")),
        }
    }
}

/// Operation requested against a target kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    PrereqCheck,
    Patch,
    RollbackPrereqCheck,
    Rollback,
    Postcheck,
    Oneoff,
}

impl Operation {
    /// Operations that move nodes towards the target version.
    pub const fn is_forward(&self) -> bool {
        matches!(self, Self::PrereqCheck | Self::Patch)
    }

    /// Operations that move nodes back below the target version.
    pub const fn is_rollback(&self) -> bool {
        matches!(self, Self::RollbackPrereqCheck | Self::Rollback)
    }

    /// Whether the external patch tool is launched for this operation.
    pub const fn invokes_tool(&self) -> bool {
        self.is_forward() || self.is_rollback()
    }

    /// Whether nodes change version, which makes the postcheck mandatory.
    pub const fn changes_version(&self) -> bool {
        matches!(self, Self::Patch | Self::Rollback)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PrereqCheck => "prereq_check",
            Self::Patch => "patch",
            Self::RollbackPrereqCheck => "rollback_prereq_check",
            Self::Rollback => "rollback",
            Self::Postcheck => "postcheck",
            Self::Oneoff => "oneoff",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether targets are patched one at a time or all at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStyle {
    #[default]
    Rolling,
    NonRolling,
}

impl OperationStyle {
    pub const fn is_rolling(&self) -> bool {
        matches!(self, Self::Rolling)
    }
}

/// Immutable input for one operation call.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatchRequest {
    #[schemars(with = "String")]
    pub request_id: RequestId,
    pub target_kind: TargetKind,
    pub operation: Operation,
    #[serde(default)]
    pub operation_style: OperationStyle,
    pub target_version: String,
    /// Ordered launch node preference; the first reachable one is used.
    pub launch_node_candidates: Vec<String>,
    /// Candidate target nodes to consider for the operation.
    pub nodes: Vec<String>,
    #[serde(default)]
    pub is_retry: bool,
    #[serde(default)]
    pub is_mock: bool,
    /// Live-update capability flag (dom0 only).
    #[serde(default)]
    pub live_update: bool,
    /// ISO repository passed to the tool for dom0/domU prechecks and upgrades.
    #[serde(default)]
    pub iso_repo: Option<String>,
    /// Deterministic responses for the mock overlay.
    #[serde(default)]
    #[schemars(skip)]
    pub fixtures: Option<MockFixtures>,
}

impl PatchRequest {
    pub fn new(
        target_kind: TargetKind,
        operation: Operation,
        target_version: impl Into<String>,
        launch_node_candidates: Vec<String>,
        nodes: Vec<String>,
    ) -> Self {
        Self {
            request_id: RequestId::new(),
            target_kind,
            operation,
            operation_style: OperationStyle::Rolling,
            target_version: target_version.into(),
            launch_node_candidates,
            nodes,
            is_retry: false,
            is_mock: false,
            live_update: false,
            iso_repo: None,
            fixtures: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    #[must_use]
    pub fn with_style(mut self, style: OperationStyle) -> Self {
        self.operation_style = style;
        self
    }

    #[must_use]
    pub fn retry(mut self) -> Self {
        self.is_retry = true;
        self
    }

    #[must_use]
    pub fn live_update(mut self) -> Self {
        self.live_update = true;
        self
    }

    #[must_use]
    pub fn with_fixtures(mut self, fixtures: MockFixtures) -> Self {
        self.is_mock = true;
        self.fixtures = Some(fixtures);
        self
    }
}

/// One node under consideration, with the outcome of filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeCandidate {
    pub hostname: String,
    /// Version read from the node; `None` when it could not be parsed.
    pub observed_version: Option<String>,
    pub included: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discard_reason: Option<String>,
}

impl NodeCandidate {
    pub fn included(hostname: impl Into<String>, observed_version: Option<String>) -> Self {
        Self {
            hostname: hostname.into(),
            observed_version,
            included: true,
            discard_reason: None,
        }
    }

    pub fn discarded(
        hostname: impl Into<String>,
        observed_version: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            observed_version,
            included: false,
            discard_reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_kind_serde_names() {
        let json = serde_json::to_string(&TargetKind::RoceSwitch).unwrap();
        assert_eq!(json, "\"ROCE_SWITCH\"");
        let parsed: TargetKind = serde_json::from_str("\"DOMU\"").unwrap();
        assert_eq!(parsed, TargetKind::DomU);
    }

    #[test]
    fn test_target_kind_from_str_is_lenient() {
        assert_eq!("ib_switch".parse::<TargetKind>().unwrap(), TargetKind::IbSwitch);
        assert_eq!("DomU".parse::<TargetKind>().unwrap(), TargetKind::DomU);
        assert!("toaster".parse::<TargetKind>().is_err());
    }

    #[test]
    fn test_operation_classes() {
        assert!(Operation::Patch.is_forward());
        assert!(Operation::RollbackPrereqCheck.is_rollback());
        assert!(Operation::Rollback.changes_version());
        assert!(!Operation::PrereqCheck.changes_version());
        assert!(!Operation::Postcheck.invokes_tool());
        assert!(!Operation::Oneoff.invokes_tool());
    }

    #[test]
    fn test_patch_request_deserializes_with_defaults() {
        let json = r#"{
            "requestId": "6f1c3a52-4a4e-4b7e-9d8e-2f6f5b8d0c11",
            "targetKind": "CELL",
            "operation": "PATCH",
            "targetVersion": "21.2.11.0.0.220414.1",
            "launchNodeCandidates": ["db01"],
            "nodes": ["cel01", "cel02"]
        }"#;
        let request: PatchRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.operation_style, OperationStyle::Rolling);
        assert!(!request.is_retry);
        assert!(!request.is_mock);
        assert!(request.fixtures.is_none());
        assert_eq!(
            request.request_id.to_string(),
            "6f1c3a52-4a4e-4b7e-9d8e-2f6f5b8d0c11"
        );
    }

    #[test]
    fn test_node_candidate_constructors() {
        let kept = NodeCandidate::included("n1", Some("1.0".into()));
        assert!(kept.included);
        assert!(kept.discard_reason.is_none());

        let dropped = NodeCandidate::discarded("n2", None, "already compliant");
        assert!(!dropped.included);
        assert_eq!(dropped.discard_reason.as_deref(), Some("already compliant"));
    }
}
