//! Per-target-kind operation state machine.
//!
//! ```text
//! INIT -> ENV_READY -> NODES_FILTERED -> SESSION_ACTIVE -> VALIDATED -> CLEANED_UP
//!   \________\______________\_________________\______________\-> FAILED
//! ```
//!
//! A run is resumed from its idempotency marker when one exists. Cleanup
//! always runs once the request holds its flight reservation.

pub mod targets;

use crate::environment::{CleanupReport, EnvironmentLifecycle, FinalStatus, PreparedEnvironment};
use crate::error::PatchError;
use crate::flight::{FlightGuard, FlightTable};
use crate::idempotency::{IdempotencyMarker, IdempotencyTracker, MarkerStage, StagePayload};
use crate::node_filter::{FilterResult, NodeFilter, dedupe_hosts};
use crate::registry::Mode;
use crate::reporter::{ErrorRecord, ErrorReporter, ProgressChannel, ProgressSnapshot};
use crate::session::{ConflictCheck, ExternalPatchSession, SessionState, SessionTimings, build_command};
use crate::transport::Transport;
use crate::version::{TargetVersion, Version, VersionComparator};
use ipm_common::config::{ConfigError, IpmConfig};
use ipm_common::types::{NodeCandidate, Operation, OperationStyle, PatchRequest, RequestId, TargetKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use targets::TargetProfile;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerState {
    Init,
    EnvReady,
    NodesFiltered,
    SessionActive,
    Validated,
    CleanedUp,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

/// Final result of one operation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub request_id: RequestId,
    pub target_kind: TargetKind,
    pub operation: Operation,
    pub status: OutcomeStatus,
    /// Every node was already compliant and healthy.
    pub no_action_taken: bool,
    pub final_status: FinalStatus,
    pub error: Option<ErrorRecord>,
    /// Cleanup failures, reported separately from the primary outcome.
    #[serde(default)]
    pub cleanup_errors: Vec<ErrorRecord>,
    /// Last state reached before the run ended.
    pub stage_reached: HandlerState,
    pub included: Vec<String>,
    pub discarded: Vec<NodeCandidate>,
}

impl OperationOutcome {
    pub fn success(
        request: &PatchRequest,
        stage_reached: HandlerState,
        included: Vec<String>,
        discarded: Vec<NodeCandidate>,
    ) -> Self {
        Self {
            request_id: request.request_id,
            target_kind: request.target_kind,
            operation: request.operation,
            status: OutcomeStatus::Success,
            no_action_taken: false,
            final_status: FinalStatus::Succeeded,
            error: None,
            cleanup_errors: Vec::new(),
            stage_reached,
            included,
            discarded,
        }
    }

    pub fn failure(
        request: &PatchRequest,
        stage_reached: HandlerState,
        error: ErrorRecord,
        final_status: FinalStatus,
    ) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            final_status,
            error: Some(error),
            ..Self::success(request, stage_reached, Vec::new(), Vec::new())
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Settings shared by every handler the registry hands out.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub patch_base: String,
    pub trust_key_path: String,
    pub ssh_connect_secs: u64,
    pub probe_parallelism: usize,
    pub timings: SessionTimings,
    /// Health-check lines to ignore.
    pub ignore_patterns: Arc<Vec<Regex>>,
}

impl HandlerSettings {
    pub fn from_config(config: &IpmConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            patch_base: config.paths.patch_base.clone(),
            trust_key_path: config.paths.trust_key_path.clone(),
            ssh_connect_secs: config.timeouts.ssh_connect_secs,
            probe_parallelism: config.filter.probe_parallelism,
            timings: SessionTimings {
                poll_timeout: config.timeouts.session_poll(),
                poll_interval: config.timeouts.poll_interval(),
                ack_attempts: config.retry.notification_check_attempts,
            },
            ignore_patterns: Arc::new(config.postcheck.ignore_patterns()?),
        })
    }
}

/// Shared collaborators a handler is built from.
#[derive(Clone)]
pub struct HandlerContext {
    pub transport: Transport,
    pub tracker: IdempotencyTracker,
    pub reporter: ErrorReporter,
    pub progress: Arc<dyn ProgressChannel>,
    pub flights: Arc<FlightTable>,
}

/// Mutable bookkeeping for one run.
struct Run {
    state: HandlerState,
    included: Vec<NodeCandidate>,
    discarded: Vec<NodeCandidate>,
    env: Option<PreparedEnvironment>,
    session: Option<ExternalPatchSession>,
    session_active: bool,
    no_action_taken: bool,
}

impl Run {
    fn new() -> Self {
        Self {
            state: HandlerState::Init,
            included: Vec::new(),
            discarded: Vec::new(),
            env: None,
            session: None,
            session_active: false,
            no_action_taken: false,
        }
    }

    fn included_hosts(&self) -> Vec<String> {
        self.included.iter().map(|c| c.hostname.clone()).collect()
    }
}

/// Drives one operation for one target kind.
pub struct TargetOperationHandler {
    profile: &'static TargetProfile,
    mode: Mode,
    settings: HandlerSettings,
    ctx: HandlerContext,
    environment: EnvironmentLifecycle,
    filter: NodeFilter,
    comparator: VersionComparator,
}

impl TargetOperationHandler {
    pub fn new(kind: TargetKind, mode: Mode, settings: HandlerSettings, ctx: HandlerContext) -> Self {
        let profile = targets::profile(kind);
        let environment = EnvironmentLifecycle::new(
            ctx.transport.clone(),
            ctx.tracker.clone(),
            settings.patch_base.clone(),
            settings.trust_key_path.clone(),
            settings.ssh_connect_secs,
        );
        let filter = NodeFilter::new(
            ctx.transport.clone(),
            profile,
            settings.probe_parallelism,
            ctx.progress.clone(),
        );
        Self {
            profile,
            mode,
            settings,
            ctx,
            environment,
            filter,
            comparator: VersionComparator,
        }
    }

    pub fn target_kind(&self) -> TargetKind {
        self.profile.kind
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Run `request` to completion and report the outcome.
    pub async fn execute(&self, request: &PatchRequest) -> OperationOutcome {
        info!(
            request_id = %request.request_id,
            target = %request.target_kind,
            operation = %request.operation,
            mode = ?self.mode,
            is_retry = request.is_retry,
            "Handling patch request"
        );

        let outcome = match self.ctx.flights.begin(request.request_id, request.target_kind) {
            // A concurrent run owns the marker and the environment: touch neither.
            None => {
                let err = PatchError::ConflictingSessionExists {
                    launch_node: request.launch_node_candidates.first().cloned().unwrap_or_default(),
                    owner: format!("request {} is already in flight", request.request_id),
                };
                let record = self.ctx.reporter.record(request, &err);
                OperationOutcome::failure(request, HandlerState::Init, record, FinalStatus::Failed)
            }
            Some(mut flight) => self.execute_in_flight(request, &mut flight).await,
        };

        self.publish(request, &outcome_snapshot(&outcome));
        self.ctx.reporter.report(&outcome);
        outcome
    }

    async fn execute_in_flight(&self, request: &PatchRequest, flight: &mut FlightGuard) -> OperationOutcome {
        let mut run = Run::new();
        let result = match request.operation {
            Operation::Postcheck => self.postcheck(request, &mut run).await,
            Operation::Oneoff => Err(PatchError::UnsupportedOperation(Operation::Oneoff)),
            _ => self.drive(request, &mut run, flight).await,
        };
        let status = FinalStatus::classify(&result, run.session_active);

        let report = if request.operation.invokes_tool() {
            self.cleanup(request, &run, status).await
        } else {
            CleanupReport::default()
        };
        let cleanup_errors: Vec<ErrorRecord> = report
            .errors
            .iter()
            .map(|err| self.ctx.reporter.record(request, err))
            .collect();

        let included = run.included_hosts();
        let discarded = std::mem::take(&mut run.discarded);
        match result {
            Ok(()) => {
                if status.is_terminal() && request.operation.invokes_tool() {
                    run.state = HandlerState::CleanedUp;
                }
                info!(
                    request_id = %request.request_id,
                    target = %request.target_kind,
                    stage = ?run.state,
                    no_action_taken = run.no_action_taken,
                    "Patch request succeeded"
                );
                OperationOutcome {
                    no_action_taken: run.no_action_taken,
                    cleanup_errors,
                    ..OperationOutcome::success(request, run.state, included, discarded)
                }
            }
            Err(err) => {
                let record = self.ctx.reporter.record(request, &err);
                OperationOutcome {
                    cleanup_errors,
                    included,
                    discarded,
                    ..OperationOutcome::failure(request, run.state, record, status)
                }
            }
        }
    }

    fn publish(&self, request: &PatchRequest, snapshot: &ProgressSnapshot) {
        debug!(request_id = %request.request_id, stage = ?snapshot.stage, "Publishing progress");
        self.ctx.progress.publish(snapshot);
    }

    fn snapshot(&self, request: &PatchRequest, run: &Run, detail: Option<String>) -> ProgressSnapshot {
        ProgressSnapshot {
            request_id: request.request_id,
            target_kind: request.target_kind,
            stage: run.state,
            included: run.included_hosts(),
            discarded: run.discarded.clone(),
            detail,
        }
    }

    fn enter(&self, request: &PatchRequest, run: &mut Run, state: HandlerState) {
        info!(request_id = %request.request_id, target = %request.target_kind, from = ?run.state, to = ?state, "State transition");
        run.state = state;
    }

    // ── Main path ───────────────────────────────────────────────────────

    async fn drive(&self, request: &PatchRequest, run: &mut Run, flight: &mut FlightGuard) -> Result<(), PatchError> {
        let nodes = dedupe_hosts(&request.nodes);
        if nodes.is_empty() {
            return Err(PatchError::NoNodes);
        }
        let target = self
            .comparator
            .target(&request.target_version, request.target_kind, request.live_update)?;

        let (mut marker, existed) = self.ctx.tracker.load_or_create(request)?;
        match (existed, request.is_retry) {
            (true, false) => warn!(
                request_id = %request.request_id,
                stage = ?marker.stage,
                "Marker exists for a request not flagged as retry; resuming from it"
            ),
            (false, true) => warn!(
                request_id = %request.request_id,
                "Retry requested but no marker exists; starting fresh"
            ),
            _ => {}
        }
        // A tool launched by an earlier run may still be working: until it is
        // re-attached, transient failures must keep the marker.
        if matches!(marker.stage, MarkerStage::SessionStarted | MarkerStage::SessionCompleted) {
            run.session_active = true;
        }

        // ENV_READY
        let launch_node = match &marker.launch_node {
            Some(node) => node.clone(),
            None => {
                self.environment
                    .select_launch_node(&request.launch_node_candidates, &nodes)
                    .await?
            }
        };
        self.environment.verify_tool(&launch_node).await?;
        if !flight.claim_lane(&launch_node) {
            return Err(PatchError::ConflictingSessionExists {
                launch_node,
                owner: format!("another {} request in this process", request.target_kind),
            });
        }
        self.enter(request, run, HandlerState::EnvReady);
        self.publish(request, &self.snapshot(request, run, Some(format!("launch node {launch_node}"))));

        // NODES_FILTERED
        if marker.has_node_list() {
            run.included = marker.included();
            run.discarded = marker.discarded();
            info!(
                request_id = %request.request_id,
                included = run.included.len(),
                discarded = run.discarded.len(),
                "Reusing node list from marker"
            );
            self.enter(request, run, HandlerState::NodesFiltered);
            self.publish(request, &self.snapshot(request, run, Some("resumed".into())));
        } else {
            let FilterResult { included, discarded } = self.filter.filter(request, &nodes, &target).await?;
            let candidates = included.iter().chain(discarded.iter()).cloned().collect();
            self.ctx.tracker.advance(
                &mut marker,
                MarkerStage::Filtered,
                StagePayload::Filtered {
                    launch_node: Some(launch_node.clone()),
                    candidates,
                },
            )?;
            run.included = included;
            run.discarded = discarded;
            self.enter(request, run, HandlerState::NodesFiltered);
        }

        if run.included.is_empty() {
            return self.no_action_check(request, run).await;
        }

        match marker.stage {
            MarkerStage::Validated | MarkerStage::CleanedUp => {
                info!(request_id = %request.request_id, "Request already validated; finishing");
                run.env = Some(self.existing_env(request, run, &launch_node));
                run.session = marker.session.clone().map(|record| self.resume_session(request, record));
                self.enter(request, run, HandlerState::Validated);
                return Ok(());
            }
            MarkerStage::SessionCompleted => {
                let record = marker.session.clone().ok_or_else(|| PatchError::IdempotencyStateCorrupt {
                    reason: "marker at SESSION_COMPLETED has no session record".into(),
                })?;
                run.env = Some(self.existing_env(request, run, &launch_node));
                run.session = Some(self.resume_session(request, record));
                run.session_active = true;
                self.enter(request, run, HandlerState::SessionActive);
            }
            MarkerStage::SessionStarted => {
                let record = marker.session.clone().ok_or_else(|| PatchError::IdempotencyStateCorrupt {
                    reason: "marker at SESSION_STARTED has no session record".into(),
                })?;
                run.env = Some(self.existing_env(request, run, &launch_node));
                let session = self.resume_session(request, record);
                run.session_active = true;
                self.enter(request, run, HandlerState::SessionActive);
                let session = run.session.insert(session);
                self.reattach(session).await?;
                self.ctx.tracker.advance(
                    &mut marker,
                    session_stage(session),
                    StagePayload::Session(session.record().clone()),
                )?;
            }
            MarkerStage::Created | MarkerStage::Filtered => {
                self.start_session(request, run, &mut marker, &launch_node).await?;
            }
        }

        self.evaluate(request, run, &target).await?;
        self.ctx
            .tracker
            .advance(&mut marker, MarkerStage::Validated, StagePayload::None)?;
        self.enter(request, run, HandlerState::Validated);
        Ok(())
    }

    fn existing_env(&self, request: &PatchRequest, run: &Run, launch_node: &str) -> PreparedEnvironment {
        PreparedEnvironment::existing(request, launch_node, &self.settings.patch_base, &run.included_hosts())
    }

    fn resume_session(&self, request: &PatchRequest, record: crate::session::SessionRecord) -> ExternalPatchSession {
        ExternalPatchSession::resume(
            self.ctx.transport.clone(),
            request,
            record,
            &self.settings.patch_base,
            self.settings.timings,
        )
    }

    fn new_session(&self, request: &PatchRequest, launch_node: &str) -> ExternalPatchSession {
        ExternalPatchSession::new(
            self.ctx.transport.clone(),
            request,
            launch_node,
            &self.settings.patch_base,
            self.settings.timings,
        )
    }

    /// Conflict check, environment setup, launch and poll.
    async fn start_session(
        &self,
        request: &PatchRequest,
        run: &mut Run,
        marker: &mut IdempotencyMarker,
        launch_node: &str,
    ) -> Result<(), PatchError> {
        let mut session = self.new_session(request, launch_node);
        match session.check_for_conflicting_session().await? {
            ConflictCheck::Conflict { owner } => {
                return Err(PatchError::ConflictingSessionExists {
                    launch_node: launch_node.to_string(),
                    owner,
                });
            }
            ConflictCheck::Owned => {
                // The marker file was written by an earlier run that died
                // before recording the launch.
                warn!(launch_node, "Found this request's session marker; re-attaching");
                run.env = Some(self.existing_env(request, run, launch_node));
                run.session_active = true;
                self.enter(request, run, HandlerState::SessionActive);
                let session = run.session.insert(session);
                self.reattach(session).await?;
            }
            ConflictCheck::Clear => {
                let included = run.included_hosts();
                run.env = Some(self.environment.prepare(request, launch_node, &included).await?);
                let command = build_command(request, session.paths())?;
                // Failures from here on may leave the tool running.
                run.session_active = true;
                let started = session.start(&command).await;
                let record = session.record().clone();
                run.session = Some(session);
                started?;
                self.ctx
                    .tracker
                    .advance(marker, MarkerStage::SessionStarted, StagePayload::Session(record.clone()))?;
                self.enter(request, run, HandlerState::SessionActive);
                let detail = format!("log dir {}", record.log_dir);
                self.publish(request, &self.snapshot(request, run, Some(detail)));

                if let Some(session) = run.session.as_mut() {
                    session.poll_until_complete().await?;
                }
            }
        }

        if let Some(session) = &run.session {
            self.ctx.tracker.advance(
                marker,
                session_stage(session),
                StagePayload::Session(session.record().clone()),
            )?;
        }
        Ok(())
    }

    /// Pick up a session an earlier run started, using the launch node as
    /// the source of truth.
    async fn reattach(&self, session: &mut ExternalPatchSession) -> Result<(), PatchError> {
        match session.check_for_conflicting_session().await? {
            ConflictCheck::Owned => {
                info!(launch_node = %session.launch_node(), "Re-attaching to running session");
                session.poll_until_complete().await?;
                Ok(())
            }
            ConflictCheck::Clear => {
                let (scan, _) = session.inspect_console().await?;
                match scan.terminator {
                    Some(status) => {
                        session.finish(status);
                        Ok(())
                    }
                    None => Err(PatchError::IdempotencyStateCorrupt {
                        reason: format!(
                            "marker records a session on {} but neither a session marker nor a terminator is present",
                            session.launch_node()
                        ),
                    }),
                }
            }
            ConflictCheck::Conflict { owner } => Err(PatchError::IdempotencyStateCorrupt {
                reason: format!(
                    "marker records this request's session on {} but {owner} holds it",
                    session.launch_node()
                ),
            }),
        }
    }

    /// Turn the session result into the operation result.
    async fn evaluate(&self, request: &PatchRequest, run: &mut Run, target: &TargetVersion) -> Result<(), PatchError> {
        let outcome = match &run.session {
            Some(session) => session.outcome(),
            None => Err(PatchError::IdempotencyStateCorrupt {
                reason: "no session to evaluate".into(),
            }),
        };

        if let Err(err @ PatchError::ExternalToolFailure { .. }) = &outcome
            && request.target_kind == TargetKind::Dom0
            && request.operation == Operation::Rollback
            && request.operation_style == OperationStyle::NonRolling
        {
            let down = self.db_services_down(&run.included_hosts()).await;
            if !down.is_empty() {
                warn!(nodes = ?down, "DB services down after failed non-rolling rollback");
                return Err(PatchError::DbServerDown { nodes: down });
            }
            return Err(err.clone());
        }
        outcome?;

        if request.operation.changes_version() {
            self.validate(request, &run.included, target).await?;
        }
        Ok(())
    }

    /// Post versions must move in the operation's direction, then services
    /// must be healthy.
    async fn validate(
        &self,
        request: &PatchRequest,
        included: &[NodeCandidate],
        target: &TargetVersion,
    ) -> Result<(), PatchError> {
        let hosts: Vec<String> = included.iter().map(|c| c.hostname.clone()).collect();
        let post = self.filter.probe_versions(&hosts).await?;

        let rollback = request.operation.is_rollback();
        let regressed: Vec<String> = included
            .iter()
            .zip(post)
            .filter(|(candidate, (_, post))| {
                let pre = candidate
                    .observed_version
                    .as_deref()
                    .and_then(|v| Version::parse_for(v, request.target_kind).ok());
                let moved = match (pre, post) {
                    (_, None) => false,
                    (Some(pre), Some(post)) if rollback => post.cmp(&pre) == Ordering::Less,
                    (Some(pre), Some(post)) => post.cmp(&pre) == Ordering::Greater,
                    (None, Some(post)) => target.concrete().is_some_and(|t| post.cmp(t) == Ordering::Equal),
                };
                if !moved {
                    warn!(
                        host = %candidate.hostname,
                        pre = ?candidate.observed_version,
                        post = ?post.as_ref().map(Version::as_str),
                        "Version did not move as expected"
                    );
                }
                !moved
            })
            .map(|(candidate, _)| candidate.hostname.clone())
            .collect();
        if !regressed.is_empty() {
            return Err(PatchError::VersionRegressionCheckFailed {
                operation: request.operation,
                nodes: regressed,
            });
        }

        let unhealthy = self.unhealthy_nodes(&hosts).await?;
        if !unhealthy.is_empty() {
            return Err(PatchError::ServicesNotHealthy { nodes: unhealthy });
        }
        Ok(())
    }

    async fn unhealthy_nodes(&self, hosts: &[String]) -> Result<Vec<String>, PatchError> {
        let mut unhealthy = Vec::new();
        for host in hosts {
            let result = self.ctx.transport.run(host, self.profile.health_command).await?;
            let verdict = self.profile.evaluate_health(&result, &self.settings.ignore_patterns);
            debug!(host = %host, healthy = verdict.healthy, detail = %verdict.detail, "Health check");
            if !verdict.healthy {
                unhealthy.push(host.clone());
            }
        }
        Ok(unhealthy)
    }

    /// Hosts with no running guests, or whose state cannot be read.
    async fn db_services_down(&self, hosts: &[String]) -> Vec<String> {
        let Some(command) = self.profile.vm_state_command else {
            return Vec::new();
        };
        let mut down = Vec::new();
        for host in hosts {
            let running = match self.ctx.transport.run(host, command).await {
                Ok(result) => self.profile.vms_running(&result, &self.settings.ignore_patterns),
                Err(err) => {
                    warn!(host = %host, error = %err, "Could not read VM state");
                    None
                }
            };
            if running != Some(true) {
                down.push(host.clone());
            }
        }
        down
    }

    /// Everything is already compliant: succeed only if services are up.
    async fn no_action_check(&self, request: &PatchRequest, run: &mut Run) -> Result<(), PatchError> {
        let hosts: Vec<String> = run.discarded.iter().map(|c| c.hostname.clone()).collect();
        info!(
            request_id = %request.request_id,
            nodes = hosts.len(),
            "All nodes compliant; running health check before declaring no-op"
        );
        let unhealthy = self.unhealthy_nodes(&hosts).await?;
        if !unhealthy.is_empty() {
            return Err(PatchError::ServicesNotHealthy { nodes: unhealthy });
        }
        run.no_action_taken = true;
        self.enter(request, run, HandlerState::Validated);
        Ok(())
    }

    /// Version and health checks without the tool.
    async fn postcheck(&self, request: &PatchRequest, run: &mut Run) -> Result<(), PatchError> {
        let nodes = dedupe_hosts(&request.nodes);
        if nodes.is_empty() {
            return Err(PatchError::NoNodes);
        }
        let target = self
            .comparator
            .target(&request.target_version, request.target_kind, request.live_update)?;
        let observed = self.filter.probe_versions(&nodes).await?;
        run.included = observed
            .iter()
            .map(|(host, v)| NodeCandidate::included(host.clone(), v.as_ref().map(|v| v.as_str().to_string())))
            .collect();
        self.enter(request, run, HandlerState::NodesFiltered);
        self.publish(request, &self.snapshot(request, run, None));

        if let Some(target) = target.concrete() {
            let off_target: Vec<String> = observed
                .iter()
                .filter(|(_, v)| v.as_ref().is_none_or(|v| v.cmp(target) != Ordering::Equal))
                .map(|(host, _)| host.clone())
                .collect();
            if !off_target.is_empty() {
                return Err(PatchError::VersionRegressionCheckFailed {
                    operation: request.operation,
                    nodes: off_target,
                });
            }
        }
        let unhealthy = self.unhealthy_nodes(&nodes).await?;
        if !unhealthy.is_empty() {
            return Err(PatchError::ServicesNotHealthy { nodes: unhealthy });
        }
        self.enter(request, run, HandlerState::Validated);
        Ok(())
    }

    // ── Cleanup ─────────────────────────────────────────────────────────

    async fn cleanup(&self, request: &PatchRequest, run: &Run, status: FinalStatus) -> CleanupReport {
        let mut report = self
            .environment
            .cleanup(request.request_id, request.target_kind, run.env.as_ref(), status)
            .await;

        if status.is_terminal()
            && let Some(session) = &run.session
            && let Err(err) = session.release().await
        {
            report.errors.push(PatchError::CleanupFailed {
                launch_node: session.launch_node().to_string(),
                reason: format!("releasing session marker: {err}"),
            });
        }
        report
    }
}

fn session_stage(session: &ExternalPatchSession) -> MarkerStage {
    if session.state() == SessionState::Completed {
        MarkerStage::SessionCompleted
    } else {
        MarkerStage::SessionStarted
    }
}

fn outcome_snapshot(outcome: &OperationOutcome) -> ProgressSnapshot {
    ProgressSnapshot {
        request_id: outcome.request_id,
        target_kind: outcome.target_kind,
        stage: if outcome.is_success() {
            outcome.stage_reached
        } else {
            HandlerState::Failed
        },
        included: outcome.included.clone(),
        discarded: outcome.discarded.clone(),
        detail: outcome.error.as_ref().map(|e| format!("{} {}", e.code, e.message)),
    }
}
