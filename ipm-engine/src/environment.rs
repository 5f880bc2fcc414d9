//! Launch node selection, transient trust and the node-list artifact.

use crate::error::PatchError;
use crate::idempotency::IdempotencyTracker;
use crate::session::command::node_list_path;
use crate::transport::Transport;
use ipm_common::remote::quote;
use ipm_common::types::{PatchRequest, RequestId, TargetKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

const AUTHORIZED_KEYS: &str = "~/.ssh/authorized_keys";

/// How the operation ended, as far as cleanup is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    Succeeded,
    Failed,
    /// The tool may still be running on the launch node.
    InProgress,
    /// True state unknown; a retry must re-derive it.
    Ambiguous,
}

impl FinalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Classify the result of one handler run.
    pub fn classify(result: &Result<(), PatchError>, session_active: bool) -> Self {
        match result {
            Ok(()) => Self::Succeeded,
            Err(err) if err.is_ambiguous() => Self::Ambiguous,
            Err(PatchError::ExternalToolTimeout { .. }) => Self::InProgress,
            Err(
                PatchError::Connectivity { .. }
                | PatchError::ShellTimeout { .. }
                | PatchError::ConflictingSessionExists { .. },
            ) if session_active => Self::InProgress,
            Err(_) => Self::Failed,
        }
    }
}

/// Trust and artifact state on the launch node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedEnvironment {
    pub request_id: RequestId,
    pub launch_node: String,
    /// Sorted, without duplicates or the launch node.
    pub targets: Vec<String>,
    pub artifact_path: String,
}

impl PreparedEnvironment {
    /// Describe an environment prepared by an earlier run of the request.
    pub fn existing(request: &PatchRequest, launch_node: &str, patch_base: &str, targets: &[String]) -> Self {
        Self {
            request_id: request.request_id,
            launch_node: launch_node.to_string(),
            targets: artifact_hosts(launch_node, targets),
            artifact_path: node_list_path(patch_base, request.target_kind),
        }
    }

    pub fn trust_tag(&self) -> String {
        trust_tag(self.request_id)
    }
}

/// What cleanup removed and what failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub trust_removed: bool,
    pub artifact_removed: bool,
    pub marker_cleared: bool,
    pub errors: Vec<PatchError>,
}

pub fn trust_tag(request_id: RequestId) -> String {
    format!("ipm-transient-{request_id}")
}

/// Hosts written to the node-list artifact.
pub fn artifact_hosts(launch_node: &str, targets: &[String]) -> Vec<String> {
    targets
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty() && *t != launch_node)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Clone)]
pub struct EnvironmentLifecycle {
    transport: Transport,
    tracker: IdempotencyTracker,
    patch_base: String,
    trust_key_path: String,
    ssh_connect_secs: u64,
}

impl EnvironmentLifecycle {
    pub fn new(
        transport: Transport,
        tracker: IdempotencyTracker,
        patch_base: impl Into<String>,
        trust_key_path: impl Into<String>,
        ssh_connect_secs: u64,
    ) -> Self {
        Self {
            transport,
            tracker,
            patch_base: patch_base.into(),
            trust_key_path: trust_key_path.into(),
            ssh_connect_secs,
        }
    }

    pub fn patch_base(&self) -> &str {
        &self.patch_base
    }

    /// First reachable candidate that is not itself a target.
    pub async fn select_launch_node(&self, candidates: &[String], targets: &[String]) -> Result<String, PatchError> {
        let usable: Vec<&String> = candidates
            .iter()
            .filter(|c| !targets.iter().any(|t| t.trim() == c.trim()))
            .collect();
        if usable.is_empty() {
            return Err(match candidates.first() {
                Some(node) => PatchError::LaunchNodeIsTarget { node: node.clone() },
                None => PatchError::NoLaunchNode { candidates: Vec::new() },
            });
        }
        for candidate in usable {
            match self.transport.check(candidate).await {
                Ok(()) => {
                    info!(launch_node = %candidate, "Selected launch node");
                    return Ok(candidate.clone());
                }
                Err(err) => warn!(launch_node = %candidate, error = %err, "Launch node candidate unreachable"),
            }
        }
        Err(PatchError::NoLaunchNode {
            candidates: candidates.to_vec(),
        })
    }

    /// Fail with [`PatchError::ToolMissing`] unless the tool is staged.
    pub async fn verify_tool(&self, launch_node: &str) -> Result<(), PatchError> {
        let path = format!("{}/patchmgr", self.patch_base.trim_end_matches('/'));
        if self.transport.file_exists(launch_node, &path).await? {
            Ok(())
        } else {
            Err(PatchError::ToolMissing {
                launch_node: launch_node.to_string(),
                path,
            })
        }
    }

    /// Install trust from `launch_node` to every target and write the
    /// node-list artifact. On failure, whatever was installed is removed.
    pub async fn prepare(
        &self,
        request: &PatchRequest,
        launch_node: &str,
        targets: &[String],
    ) -> Result<PreparedEnvironment, PatchError> {
        let env = PreparedEnvironment::existing(request, launch_node, &self.patch_base, targets);
        match self.establish(&env).await {
            Ok(()) => {
                info!(
                    request_id = %request.request_id,
                    launch_node,
                    targets = env.targets.len(),
                    artifact = %env.artifact_path,
                    "Environment ready"
                );
                Ok(env)
            }
            Err(err) => {
                let report = self.teardown(&env, true, true).await;
                for cleanup_err in &report.errors {
                    warn!(launch_node, "Rollback of partial setup failed: {}", cleanup_err);
                }
                Err(err)
            }
        }
    }

    async fn establish(&self, env: &PreparedEnvironment) -> Result<(), PatchError> {
        let setup_failed = |nodes: Vec<String>, reason: String| PatchError::EnvironmentSetupFailed {
            launch_node: env.launch_node.clone(),
            nodes,
            reason,
        };

        let key = self
            .transport
            .run(&env.launch_node, &format!("cat {}", self.trust_key_path))
            .await?;
        let key = key.stdout.trim();
        if key.is_empty() {
            return Err(setup_failed(
                vec![env.launch_node.clone()],
                format!("no public key at {}", self.trust_key_path),
            ));
        }

        let tag = env.trust_tag();
        let install = format!(
            "mkdir -p ~/.ssh && chmod 700 ~/.ssh && (grep -qF {tag} {AUTHORIZED_KEYS} 2>/dev/null || echo {line} >> {AUTHORIZED_KEYS}) && chmod 600 {AUTHORIZED_KEYS}",
            tag = quote(&tag),
            line = quote(&format!("{key} {tag}")),
        );
        for target in &env.targets {
            let result = self.transport.run(target, &install).await?;
            if !result.success() {
                return Err(setup_failed(
                    vec![target.clone()],
                    format!("installing transient key failed: {}", result.stderr.trim()),
                ));
            }
        }

        let mut unverified = Vec::new();
        for target in &env.targets {
            let probe = format!(
                "ssh -o BatchMode=yes -o ConnectTimeout={} -o StrictHostKeyChecking=no {} true",
                self.ssh_connect_secs,
                quote(target)
            );
            if !self.transport.run(&env.launch_node, &probe).await?.success() {
                unverified.push(target.clone());
            }
        }
        if !unverified.is_empty() {
            return Err(setup_failed(unverified, "passwordless ssh from launch node not working".into()));
        }

        let contents: String = env.targets.iter().map(|t| format!("{t}\n")).collect();
        let written = self
            .transport
            .write_file(&env.launch_node, &env.artifact_path, &contents)
            .await?;
        if !written.success() {
            return Err(setup_failed(
                vec![env.launch_node.clone()],
                format!("writing {} failed: {}", env.artifact_path, written.stderr.trim()),
            ));
        }
        let read_back = self
            .transport
            .run(&env.launch_node, &format!("cat {}", quote(&env.artifact_path)))
            .await?;
        let listed: Vec<&str> = read_back.stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if !read_back.success() || listed != env.targets {
            return Err(setup_failed(
                vec![env.launch_node.clone()],
                format!("{} does not match the filtered node list", env.artifact_path),
            ));
        }
        debug!(launch_node = %env.launch_node, artifact = %env.artifact_path, "Node list written");
        Ok(())
    }

    async fn teardown(&self, env: &PreparedEnvironment, trust: bool, artifact: bool) -> CleanupReport {
        let mut report = CleanupReport::default();

        if trust {
            let remove = format!("sed -i '/{}/d' {AUTHORIZED_KEYS}", env.trust_tag());
            let mut removed = true;
            for target in &env.targets {
                let failure = match self.transport.run(target, &remove).await {
                    Ok(result) if result.success() => None,
                    Ok(result) => Some(format!("exit {}: {}", result.exit_code, result.stderr.trim())),
                    Err(err) => Some(err.to_string()),
                };
                if let Some(reason) = failure {
                    removed = false;
                    report.errors.push(PatchError::CleanupFailed {
                        launch_node: target.clone(),
                        reason,
                    });
                }
            }
            report.trust_removed = removed;
        }

        if artifact {
            match self
                .transport
                .run(&env.launch_node, &format!("rm -f {}", quote(&env.artifact_path)))
                .await
            {
                Ok(result) if result.success() => report.artifact_removed = true,
                Ok(result) => report.errors.push(PatchError::CleanupFailed {
                    launch_node: env.launch_node.clone(),
                    reason: format!("removing {} failed: {}", env.artifact_path, result.stderr.trim()),
                }),
                Err(err) => report.errors.push(PatchError::CleanupFailed {
                    launch_node: env.launch_node.clone(),
                    reason: err.to_string(),
                }),
            }
        }
        report
    }

    /// Undo [`Self::prepare`] according to how the operation ended.
    ///
    /// | status      | trust   | artifact | marker  |
    /// |-------------|---------|----------|---------|
    /// | terminal    | removed | removed  | cleared |
    /// | ambiguous   | removed | kept     | kept    |
    /// | in progress | kept    | kept     | kept    |
    ///
    /// Failures are collected in the report, never raised.
    pub async fn cleanup(
        &self,
        request_id: RequestId,
        kind: TargetKind,
        env: Option<&PreparedEnvironment>,
        status: FinalStatus,
    ) -> CleanupReport {
        let mut report = match (env, status) {
            (Some(env), FinalStatus::Succeeded | FinalStatus::Failed) => self.teardown(env, true, true).await,
            (Some(env), FinalStatus::Ambiguous) => self.teardown(env, true, false).await,
            _ => CleanupReport::default(),
        };

        if status.is_terminal() {
            match self.tracker.clear(request_id, kind) {
                Ok(()) => report.marker_cleared = true,
                Err(err) => report.errors.push(err),
            }
        }

        info!(
            request_id = %request_id,
            target = %kind,
            status = ?status,
            trust_removed = report.trust_removed,
            artifact_removed = report.artifact_removed,
            marker_cleared = report.marker_cleared,
            errors = report.errors.len(),
            "Cleanup finished"
        );
        report
    }
}
