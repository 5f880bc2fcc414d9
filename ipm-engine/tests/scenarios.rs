//! End-to-end request scenarios against the mock overlay.
//!
//! Each test builds a registry over an in-memory store and a simulated fleet,
//! runs one or more requests through it and checks both the outcome and what
//! was left behind on the fleet.

use ipm_common::config::IpmConfig;
use ipm_common::errors::ErrorCode;
use ipm_common::mock::{MockFixtures, MockRemote, NodeFixture, ToolFixture};
use ipm_common::test_guard;
use ipm_common::testing::TestPhase;
use ipm_common::types::{Operation, OperationStyle, PatchRequest, TargetKind};
use ipm_engine::environment::FinalStatus;
use ipm_engine::handler::{HandlerState, OperationOutcome};
use ipm_engine::idempotency::{IdempotencyTracker, MarkerStage};
use ipm_engine::overlay::MockOverlay;
use ipm_engine::registry::{EngineServices, HandlerRegistry, Mode};
use ipm_engine::reporter::EventBus;
use ipm_engine::session::command::node_list_path;
use ipm_engine::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;

#[ctor::ctor]
fn setup() {
    ipm_common::testing::init_global_test_logging();
}

const OLD: &str = "21.2.10.0.0.220101.1";
const NEW: &str = "21.2.11.0.0.220414.1";
const AUTHORIZED_KEYS: &str = "~/.ssh/authorized_keys";

struct Harness {
    registry: HandlerRegistry,
    remote: MockRemote,
    store: Arc<MemoryStore>,
    events: Receiver<String>,
    patch_base: String,
}

impl Harness {
    fn new(request: &PatchRequest) -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::default());
        let events = bus.subscribe();
        let services = EngineServices {
            executor: Arc::new(MockRemote::default()),
            store: store.clone(),
            progress: bus.clone(),
            sink: bus,
        };
        let registry = HandlerRegistry::new(Arc::new(IpmConfig::default()), services).unwrap();
        let settings = registry.settings(Mode::Mock);
        let patch_base = settings.patch_base.clone();
        let remote = MockOverlay::build(request, settings);
        Self {
            registry: registry.with_overlay(remote.clone()),
            remote,
            store,
            events,
            patch_base,
        }
    }

    async fn run(&self, request: &PatchRequest) -> OperationOutcome {
        self.registry.execute(request).await
    }

    fn tracker(&self) -> IdempotencyTracker {
        IdempotencyTracker::new(self.store.clone())
    }

    fn launches(&self) -> usize {
        self.remote.count_matching("nohup ./patchmgr")
    }

    fn trust_left_on(&self, node: &str) -> bool {
        self.remote
            .file(node, AUTHORIZED_KEYS)
            .unwrap_or_default()
            .contains("ipm-transient-")
    }

    fn drain_events(&mut self) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Ok(line) = self.events.try_recv() {
            events.push(serde_json::from_str(&line).unwrap());
        }
        events
    }
}

fn cell_request(fixtures: MockFixtures) -> PatchRequest {
    PatchRequest::new(
        TargetKind::Cell,
        Operation::Patch,
        NEW,
        vec!["db01".into()],
        vec!["cel01".into(), "cel02".into()],
    )
    .with_fixtures(fixtures)
}

fn error_code(outcome: &OperationOutcome) -> ErrorCode {
    outcome.error.as_ref().map(|e| e.name).expect("outcome has no error")
}

#[tokio::test]
async fn test_patch_filters_runs_tool_and_cleans_up() {
    let guard = test_guard!();
    let request = cell_request(
        MockFixtures::default()
            .node("cel01", NodeFixture::at(OLD).becomes(NEW))
            .node("cel02", NodeFixture::at(NEW)),
    );
    let mut harness = Harness::new(&request);

    guard.log(TestPhase::Execute, "running cell patch");
    let outcome = harness.run(&request).await;
    guard.log_with_data(TestPhase::Verify, "outcome", serde_json::to_value(&outcome).unwrap());

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.final_status, FinalStatus::Succeeded);
    assert_eq!(outcome.stage_reached, HandlerState::CleanedUp);
    assert!(!outcome.no_action_taken);
    assert_eq!(outcome.included, vec!["cel01".to_string()]);
    assert_eq!(outcome.discarded.len(), 1);
    assert_eq!(outcome.discarded[0].hostname, "cel02");
    assert!(outcome.cleanup_errors.is_empty());

    assert_eq!(harness.launches(), 1);
    assert_eq!(MockOverlay::node_version(&harness.remote, "cel01").as_deref(), Some(NEW));
    assert!(!harness.trust_left_on("cel01"));
    assert!(!harness.remote.path_exists("db01", &node_list_path(&harness.patch_base, TargetKind::Cell)));
    assert!(!harness.remote.path_exists("db01", &format!("{}/.ipm_session_cell", harness.patch_base)));
    assert!(!harness.tracker().is_retry(request.request_id).unwrap());

    let events = harness.drain_events();
    let filtered = events
        .iter()
        .find(|e| e["event"] == "progress" && e["data"]["stage"] == "NODES_FILTERED")
        .expect("no NODES_FILTERED snapshot");
    assert_eq!(filtered["data"]["included"][0], "cel01");
    let status = events.iter().rfind(|e| e["event"] == "status").expect("no status event");
    assert_eq!(status["data"]["status"], "SUCCESS");
}

#[tokio::test]
async fn test_unchanged_version_after_success_is_regression() {
    let _guard = test_guard!();
    let request = cell_request(MockFixtures::default().node("cel01", NodeFixture::at(OLD)).node("cel02", NodeFixture::at(NEW)));
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert!(!outcome.is_success());
    assert_eq!(error_code(&outcome), ErrorCode::CellVersionExpectedHigher);
    assert_eq!(outcome.error.as_ref().unwrap().affected_nodes, vec!["cel01".to_string()]);
    assert_eq!(outcome.final_status, FinalStatus::Failed);
    assert_eq!(harness.launches(), 1);
    assert!(!harness.trust_left_on("cel01"));
}

#[tokio::test]
async fn test_concurrent_duplicate_request_conflicts_without_second_launch() {
    let _guard = test_guard!();
    let request = cell_request(
        MockFixtures::default()
            .node("cel01", NodeFixture::at(OLD).becomes(NEW))
            .tool(ToolFixture {
                never_exits: true,
                ..ToolFixture::default()
            }),
    );
    let harness = Harness::new(&request);

    let first = harness.run(&request);
    let second = async {
        while harness.launches() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        harness.run(&request).await
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(error_code(&second), ErrorCode::PatchmgrSessionAlreadyExist);
    assert_eq!(second.final_status, FinalStatus::Failed);
    assert_eq!(harness.launches(), 1);

    // The held tool outlives the poll window; its state is left for a retry.
    assert_eq!(error_code(&first), ErrorCode::PatchmgrConsoleReadTimeout);
    assert_eq!(first.final_status, FinalStatus::InProgress);
    let marker = harness
        .tracker()
        .load(request.request_id, request.target_kind)
        .unwrap()
        .expect("marker kept for retry");
    assert_eq!(marker.stage, MarkerStage::SessionStarted);
    assert!(harness.trust_left_on("cel01"));
}

#[tokio::test]
async fn test_retry_reattaches_to_running_session() {
    let _guard = test_guard!();
    let request = cell_request(
        MockFixtures::default()
            .node("cel01", NodeFixture::at(OLD).becomes(NEW))
            .tool(ToolFixture {
                never_exits: true,
                ..ToolFixture::default()
            }),
    );
    let harness = Harness::new(&request);

    let first = harness.run(&request).await;
    assert_eq!(first.final_status, FinalStatus::InProgress);

    MockOverlay::release_tool(&harness.remote, "db01");
    let retried = harness.run(&request.clone().retry()).await;

    assert!(retried.is_success(), "{:?}", retried.error);
    assert_eq!(retried.stage_reached, HandlerState::CleanedUp);
    assert_eq!(harness.launches(), 1);
    // The node list came from the marker, not a second probe round.
    assert_eq!(harness.remote.count_matching("imageinfo -ver"), 4);
    assert_eq!(MockOverlay::node_version(&harness.remote, "cel01").as_deref(), Some(NEW));
    assert!(!harness.trust_left_on("cel01"));
    assert!(!harness.tracker().is_retry(request.request_id).unwrap());
}

#[tokio::test]
async fn test_retry_with_launch_node_down_keeps_marker() {
    let _guard = test_guard!();
    let request = cell_request(
        MockFixtures::default()
            .node("cel01", NodeFixture::at(OLD).becomes(NEW))
            .tool(ToolFixture {
                never_exits: true,
                ..ToolFixture::default()
            }),
    );
    let harness = Harness::new(&request);
    let first = harness.run(&request).await;
    assert_eq!(first.final_status, FinalStatus::InProgress);

    harness.remote.set_reachable("db01", false);
    let blocked = harness.run(&request.clone().retry()).await;

    assert!(!blocked.is_success());
    assert_eq!(error_code(&blocked), ErrorCode::PatchingConnectFailed);
    assert_eq!(blocked.final_status, FinalStatus::InProgress);
    let marker = harness
        .tracker()
        .load(request.request_id, request.target_kind)
        .unwrap()
        .expect("marker survives a failed re-attach");
    assert_eq!(marker.stage, MarkerStage::SessionStarted);
    assert!(harness.trust_left_on("cel01"));

    harness.remote.set_reachable("db01", true);
    MockOverlay::release_tool(&harness.remote, "db01");
    let resumed = harness.run(&request.clone().retry()).await;

    assert!(resumed.is_success(), "{:?}", resumed.error);
    assert_eq!(harness.launches(), 1);
    // Two version reads from the first run and two after the tool: no second filter round.
    assert_eq!(harness.remote.count_matching("imageinfo -ver"), 4);
    assert!(!harness.trust_left_on("cel01"));
}

/// Leave a held tool's state behind after the first run, then let `tamper`
/// change the launch node before the retry.
async fn retry_after(tamper: impl FnOnce(&Harness, &PatchRequest)) -> (Harness, PatchRequest, OperationOutcome) {
    let request = cell_request(
        MockFixtures::default()
            .node("cel01", NodeFixture::at(OLD).becomes(NEW))
            .tool(ToolFixture {
                never_exits: true,
                ..ToolFixture::default()
            }),
    );
    let harness = Harness::new(&request);
    let first = harness.run(&request).await;
    assert_eq!(first.final_status, FinalStatus::InProgress);

    tamper(&harness, &request);
    let retried = harness.run(&request.clone().retry()).await;
    (harness, request, retried)
}

fn session_marker(harness: &Harness) -> String {
    format!("{}/.ipm_session_cell", harness.patch_base)
}

fn assert_marker_kept_as_ambiguous(harness: &Harness, request: &PatchRequest, outcome: &OperationOutcome) {
    assert_eq!(error_code(outcome), ErrorCode::CurrentRequestMarkerNotFound);
    assert_eq!(outcome.final_status, FinalStatus::Ambiguous);
    assert_eq!(harness.launches(), 1);
    let marker = harness
        .tracker()
        .load(request.request_id, request.target_kind)
        .unwrap()
        .expect("marker kept for a later retry");
    assert_eq!(marker.stage, MarkerStage::SessionStarted);
}

#[tokio::test]
async fn test_retry_without_session_marker_or_terminator_is_ambiguous() {
    let _guard = test_guard!();
    let (harness, request, retried) = retry_after(|harness, _| {
        let marker = session_marker(harness);
        // The tool died without writing a terminator and its marker is gone.
        harness.remote.with_fleet(|fleet| {
            let launch = fleet.host_mut("db01");
            launch.files.remove(&marker);
            launch.counters.clear();
        });
    })
    .await;

    assert_marker_kept_as_ambiguous(&harness, &request, &retried);
    assert!(!harness.remote.path_exists("db01", &session_marker(&harness)));
}

#[tokio::test]
async fn test_retry_with_foreign_session_owner_is_ambiguous() {
    let _guard = test_guard!();
    let (harness, request, retried) = retry_after(|harness, _| {
        harness.remote.set_file("db01", &session_marker(harness), "another-request\n");
    })
    .await;

    assert_marker_kept_as_ambiguous(&harness, &request, &retried);
    // The other request's marker is left alone.
    assert_eq!(
        harness.remote.file("db01", &session_marker(&harness)).as_deref(),
        Some("another-request\n")
    );
}

fn domu_request(fixtures: MockFixtures) -> PatchRequest {
    PatchRequest::new(
        TargetKind::DomU,
        Operation::Patch,
        NEW,
        vec!["db01".into()],
        vec!["vm01".into(), "vm02".into()],
    )
    .with_fixtures(fixtures)
}

#[tokio::test]
async fn test_domu_existing_session_uses_domu_code() {
    let _guard = test_guard!();
    let request = domu_request(MockFixtures {
        conflicting_session: true,
        ..MockFixtures::default().node("vm01", NodeFixture::at(OLD).becomes(NEW))
    });
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert_eq!(error_code(&outcome), ErrorCode::PatchmgrDomUSessionAlreadyExist);
    assert_eq!(outcome.error.as_ref().unwrap().code, "0x03050015");
    assert_eq!(outcome.final_status, FinalStatus::Failed);
    assert_eq!(harness.launches(), 0);
}

#[tokio::test]
async fn test_domu_tool_failure_uses_domu_code() {
    let _guard = test_guard!();
    let request = domu_request(
        MockFixtures::default()
            .node("vm01", NodeFixture::at(OLD).becomes(NEW))
            .tool(ToolFixture {
                exit_status: 3,
                ..ToolFixture::default()
            }),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    let error = outcome.error.as_ref().unwrap();
    assert_eq!(error.name, ErrorCode::DomUPatchmgrCommandFailed);
    assert_eq!(error.code, "0x03050017");
    assert!(error.suggestion.starts_with("Patchmgr command failed on Target domu"));
    assert_eq!(outcome.final_status, FinalStatus::Failed);
    assert_eq!(MockOverlay::node_version(&harness.remote, "vm01").as_deref(), Some(OLD));
    assert!(!harness.trust_left_on("vm01"));
}

#[tokio::test]
async fn test_dom0_live_update_to_latest_completes() {
    let _guard = test_guard!();
    let request = PatchRequest::new(
        TargetKind::Dom0,
        Operation::Patch,
        "LATEST",
        vec!["mgmt01".into()],
        vec!["dom01".into(), "dom02".into()],
    )
    .live_update()
    .with_fixtures(
        MockFixtures::default()
            .node("dom01", NodeFixture::at(OLD).becomes(NEW))
            .node("dom02", NodeFixture::at(OLD).becomes(NEW)),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.final_status, FinalStatus::Succeeded);
    // Nothing is discarded against the sentinel.
    assert_eq!(outcome.included, vec!["dom01".to_string(), "dom02".to_string()]);
    assert_eq!(harness.launches(), 1);
    assert_eq!(
        harness
            .remote
            .count_matching("--target_version LATEST --rolling --live-update-target allcvss"),
        1
    );
    assert_eq!(MockOverlay::node_version(&harness.remote, "dom02").as_deref(), Some(NEW));
    assert!(!harness.trust_left_on("dom01"));
}

#[tokio::test]
async fn test_latest_sentinel_rejected_for_cells() {
    let _guard = test_guard!();
    let mut request = cell_request(MockFixtures::default());
    request.target_version = "LATEST".into();
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert_eq!(error_code(&outcome), ErrorCode::InvalidTargetVersion);
    assert_eq!(harness.launches(), 0);
    assert_eq!(harness.remote.count_matching("imageinfo"), 0);
}

#[tokio::test]
async fn test_all_compliant_takes_no_action() {
    let _guard = test_guard!();
    let request = cell_request(
        MockFixtures::default()
            .node("cel01", NodeFixture::at(NEW))
            .node("cel02", NodeFixture::at("21.2.12.0.0.221010.1")),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert!(outcome.no_action_taken);
    assert!(outcome.included.is_empty());
    assert_eq!(outcome.discarded.len(), 2);
    assert_eq!(harness.launches(), 0);
    assert_eq!(harness.remote.count_matching("grep -qF"), 0);
    assert!(!harness.tracker().is_retry(request.request_id).unwrap());
}

#[tokio::test]
async fn test_all_compliant_but_unhealthy_fails() {
    let _guard = test_guard!();
    let request = cell_request(
        MockFixtures::default()
            .node("cel01", NodeFixture::at(NEW))
            .node("cel02", NodeFixture::at(NEW).unhealthy()),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert_eq!(error_code(&outcome), ErrorCode::CellServicesNotRunning);
    assert_eq!(outcome.error.as_ref().unwrap().affected_nodes, vec!["cel02".to_string()]);
    assert_eq!(harness.launches(), 0);
}

#[tokio::test]
async fn test_unreachable_node_fails_before_any_change() {
    let _guard = test_guard!();
    let request = cell_request(
        MockFixtures::default()
            .node("cel01", NodeFixture::at(OLD).becomes(NEW))
            .node("cel02", NodeFixture::at(OLD).unreachable()),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert_eq!(error_code(&outcome), ErrorCode::PatchingNodeSshCheckFailed);
    assert_eq!(outcome.error.as_ref().unwrap().affected_nodes, vec!["cel02".to_string()]);
    assert_eq!(harness.launches(), 0);
    assert!(!harness.trust_left_on("cel01"));
}

#[tokio::test]
async fn test_foreign_session_on_launch_node_conflicts() {
    let _guard = test_guard!();
    let request = cell_request(MockFixtures {
        conflicting_session: true,
        ..MockFixtures::default().node("cel01", NodeFixture::at(OLD).becomes(NEW))
    });
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert_eq!(error_code(&outcome), ErrorCode::PatchmgrSessionAlreadyExist);
    assert_eq!(harness.launches(), 0);
    assert_eq!(harness.remote.count_matching("grep -qF"), 0);
}

#[tokio::test]
async fn test_tool_failure_is_reported_and_cleaned_up() {
    let _guard = test_guard!();
    let request = cell_request(
        MockFixtures::default()
            .node("cel01", NodeFixture::at(OLD).becomes(NEW))
            .tool(ToolFixture {
                exit_status: 3,
                polls_until_exit: 2,
                ..ToolFixture::default()
            }),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert_eq!(error_code(&outcome), ErrorCode::PatchmgrCommandFailed);
    assert_eq!(outcome.final_status, FinalStatus::Failed);
    assert!(outcome.error.as_ref().unwrap().message.contains("status 3"));
    assert_eq!(MockOverlay::node_version(&harness.remote, "cel01").as_deref(), Some(OLD));
    assert!(!harness.trust_left_on("cel01"));
    assert!(!harness.tracker().is_retry(request.request_id).unwrap());
}

#[tokio::test]
async fn test_silent_tool_is_no_response() {
    let _guard = test_guard!();
    let request = cell_request(
        MockFixtures::default()
            .node("cel01", NodeFixture::at(OLD).becomes(NEW))
            .tool(ToolFixture {
                acknowledges: false,
                ..ToolFixture::default()
            }),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert_eq!(error_code(&outcome), ErrorCode::NoPatchmgrResponseDetected);
    assert_eq!(harness.launches(), 1);
}

#[tokio::test]
async fn test_failed_nonrolling_dom0_rollback_reports_db_down() {
    let _guard = test_guard!();
    let request = PatchRequest::new(
        TargetKind::Dom0,
        Operation::Rollback,
        OLD,
        vec!["mgmt01".into()],
        vec!["dom01".into()],
    )
    .with_style(OperationStyle::NonRolling)
    .with_fixtures(
        MockFixtures::default()
            .node("dom01", NodeFixture::at(NEW).becomes(OLD).unhealthy())
            .tool(ToolFixture {
                exit_status: 1,
                ..ToolFixture::default()
            }),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert_eq!(error_code(&outcome), ErrorCode::DbServerServiceDown);
    assert_eq!(outcome.error.as_ref().unwrap().affected_nodes, vec!["dom01".to_string()]);
    // Trust is withdrawn but the marker survives for the retry.
    assert_eq!(outcome.final_status, FinalStatus::Ambiguous);
    assert!(!harness.trust_left_on("dom01"));
    assert!(harness.tracker().is_retry(request.request_id).unwrap());
}

#[tokio::test]
async fn test_rollback_moves_version_down() {
    let _guard = test_guard!();
    let request = PatchRequest::new(
        TargetKind::Cell,
        Operation::Rollback,
        OLD,
        vec!["db01".into()],
        vec!["cel01".into(), "cel02".into()],
    )
    .with_fixtures(
        MockFixtures::default()
            .node("cel01", NodeFixture::at(NEW).becomes(OLD))
            .node("cel02", NodeFixture::at(OLD)),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.included, vec!["cel01".to_string()]);
    assert_eq!(MockOverlay::node_version(&harness.remote, "cel01").as_deref(), Some(OLD));
}

fn switch_request(kind: TargetKind, operation: Operation, target: &str, fixtures: MockFixtures) -> PatchRequest {
    PatchRequest::new(
        kind,
        operation,
        target,
        vec!["db01".into()],
        vec!["sw01".into(), "sw02".into()],
    )
    .with_fixtures(fixtures)
}

#[tokio::test]
async fn test_ib_switch_patch_with_dashed_firmware_versions() {
    let _guard = test_guard!();
    let request = switch_request(
        TargetKind::IbSwitch,
        Operation::Patch,
        "2.2.16-1",
        MockFixtures::default()
            .node("sw01", NodeFixture::at("2.2.15-3").becomes("2.2.16-1"))
            .node("sw02", NodeFixture::at("2.2.16-1")),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.included, vec!["sw01".to_string()]);
    assert_eq!(outcome.discarded[0].hostname, "sw02");
    assert_eq!(harness.launches(), 1);
    assert_eq!(MockOverlay::node_version(&harness.remote, "sw01").as_deref(), Some("2.2.16-1"));
    assert!(!harness.trust_left_on("sw01"));
}

#[tokio::test]
async fn test_roce_switch_rollback_moves_firmware_down() {
    let _guard = test_guard!();
    let request = switch_request(
        TargetKind::RoceSwitch,
        Operation::Rollback,
        "9.3.8",
        MockFixtures::default()
            .node("sw01", NodeFixture::at("9.3.10").becomes("9.3.8"))
            .node("sw02", NodeFixture::at("9.3.8")),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.included, vec!["sw01".to_string()]);
    assert_eq!(MockOverlay::node_version(&harness.remote, "sw01").as_deref(), Some("9.3.8"));
}

#[tokio::test]
async fn test_switch_firmware_left_unchanged_is_regression() {
    let _guard = test_guard!();
    let request = switch_request(
        TargetKind::IbSwitch,
        Operation::Patch,
        "2.2.16-1",
        MockFixtures::default().node("sw01", NodeFixture::at("2.2.15-3")),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert_eq!(error_code(&outcome), ErrorCode::SwitchVersionExpectedHigher);
    assert_eq!(outcome.error.as_ref().unwrap().affected_nodes, vec!["sw01".to_string()]);
}

#[tokio::test]
async fn test_switch_rejects_server_version_grammar() {
    let _guard = test_guard!();
    let request = switch_request(
        TargetKind::IbSwitch,
        Operation::Patch,
        NEW,
        MockFixtures::default().node("sw01", NodeFixture::at("2.2.15-3")),
    );
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert_eq!(error_code(&outcome), ErrorCode::InvalidTargetVersion);
    assert_eq!(harness.launches(), 0);
}

#[tokio::test]
async fn test_prereq_check_does_not_validate_versions() {
    let _guard = test_guard!();
    let mut request = cell_request(MockFixtures::default().node("cel01", NodeFixture::at(OLD)));
    request.operation = Operation::PrereqCheck;
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(harness.launches(), 1);
    assert_eq!(MockOverlay::node_version(&harness.remote, "cel01").as_deref(), Some(OLD));
}

#[tokio::test]
async fn test_postcheck_runs_no_tool() {
    let _guard = test_guard!();
    let mut request = cell_request(
        MockFixtures::default()
            .node("cel01", NodeFixture::at(NEW))
            .node("cel02", NodeFixture::at(OLD)),
    );
    request.operation = Operation::Postcheck;
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert_eq!(error_code(&outcome), ErrorCode::CellVersionExpectedHigher);
    assert_eq!(outcome.error.as_ref().unwrap().affected_nodes, vec!["cel02".to_string()]);
    assert_eq!(harness.launches(), 0);
    assert_eq!(harness.remote.count_matching("grep -qF"), 0);
}

#[tokio::test]
async fn test_launch_node_in_target_list_is_rejected() {
    let _guard = test_guard!();
    let request = PatchRequest::new(
        TargetKind::Cell,
        Operation::Patch,
        NEW,
        vec!["cel01".into()],
        vec!["cel01".into(), "cel02".into()],
    )
    .with_fixtures(MockFixtures::default());
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    assert_eq!(error_code(&outcome), ErrorCode::LaunchNodeShouldNotBeTarget);
    assert_eq!(harness.launches(), 0);
}

#[tokio::test]
async fn test_errors_are_persisted_per_request() {
    let _guard = test_guard!();
    let request = cell_request(MockFixtures::default().node("cel01", NodeFixture::at(OLD)));
    let harness = Harness::new(&request);
    harness.run(&request).await;

    let other = cell_request(MockFixtures::default());
    let reporter = ipm_engine::reporter::ErrorReporter::new(harness.store.clone(), Arc::new(EventBus::default()));
    let history = reporter.history_for(request.request_id);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].code, ErrorCode::CellVersionExpectedHigher.code_string());
    assert!(reporter.history_for(other.request_id).is_empty());
}

#[tokio::test]
async fn test_oneoff_reports_unavailable_plugin() {
    let _guard = test_guard!();
    let mut request = cell_request(MockFixtures::default().node("cel01", NodeFixture::at(OLD)));
    request.operation = Operation::Oneoff;
    let harness = Harness::new(&request);

    let outcome = harness.run(&request).await;

    let error = outcome.error.as_ref().unwrap();
    assert_eq!(error.name, ErrorCode::OneoffApplyFailed);
    assert_eq!(error.code, "0x030D0000");
    assert_eq!(error.suggestion, "ONEOFF plugin is unavailable for CELL");
    assert_eq!(outcome.final_status, FinalStatus::Failed);
    assert_eq!(harness.launches(), 0);
}
