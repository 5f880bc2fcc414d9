//! Error records, progress snapshots and status delivery.

use crate::error::PatchError;
use crate::handler::{HandlerState, OperationOutcome};
use crate::store::{RecordStore, RecordStoreExt};
use chrono::{DateTime, Utc};
use ipm_common::errors::{ErrorAction, ErrorCode};
use ipm_common::types::{NodeCandidate, Operation, PatchRequest, RequestId, TargetKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

const ERROR_STREAM: &str = "errors";
const DEFAULT_BUFFER: usize = 256;

/// Structured failure, created once at the point of failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Hex code, e.g. `0x0301003B`.
    pub code: String,
    pub name: ErrorCode,
    pub message: String,
    pub suggestion: String,
    pub action: ErrorAction,
    pub target_kind: TargetKind,
    pub operation: Operation,
    pub affected_nodes: Vec<String>,
    pub request_id: RequestId,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn from_error(request: &PatchRequest, error: &PatchError) -> Self {
        let code = error.code(request.target_kind);
        Self {
            code: code.code_string(),
            name: code,
            message: error.to_string(),
            suggestion: error.suggestion(request.target_kind),
            action: code.action_for(Some(request.target_kind)),
            target_kind: request.target_kind,
            operation: request.operation,
            affected_nodes: error.affected_nodes(),
            request_id: request.request_id,
            timestamp: Utc::now(),
        }
    }
}

/// Who will be touched, published before the tool runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub request_id: RequestId,
    pub target_kind: TargetKind,
    pub stage: HandlerState,
    pub included: Vec<String>,
    pub discarded: Vec<NodeCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Progress side channel.
pub trait ProgressChannel: Send + Sync {
    fn publish(&self, snapshot: &ProgressSnapshot);
}

#[derive(Debug, Error)]
#[error("status delivery failed: {0}")]
pub struct SinkError(pub String);

/// External status-reporting collaborator.
pub trait StatusSink: Send + Sync {
    fn deliver(&self, outcome: &OperationOutcome) -> Result<(), SinkError>;
}

// ── Event bus ───────────────────────────────────────────────────────────

/// Broadcast channel of JSON lines `{event, data, timestamp}`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// The buffer is never smaller than 256.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(DEFAULT_BUFFER));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub fn emit<T: Serialize>(&self, event: &str, data: &T) -> Result<(), serde_json::Error> {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let serialized = serde_json::to_string(&payload)?;
        // No subscribers is not an error.
        let _ = self.sender.send(serialized);
        Ok(())
    }
}

impl ProgressChannel for EventBus {
    fn publish(&self, snapshot: &ProgressSnapshot) {
        if let Err(err) = self.emit("progress", snapshot) {
            warn!("Failed to serialize progress snapshot: {}", err);
        }
    }
}

impl StatusSink for EventBus {
    fn deliver(&self, outcome: &OperationOutcome) -> Result<(), SinkError> {
        self.emit("status", outcome)
            .map_err(|e| SinkError(e.to_string()))
    }
}

// ── Reporter ────────────────────────────────────────────────────────────

/// Classifies failures, persists them and forwards outcomes.
#[derive(Clone)]
pub struct ErrorReporter {
    store: Arc<dyn RecordStore>,
    sink: Arc<dyn StatusSink>,
}

impl ErrorReporter {
    pub fn new(store: Arc<dyn RecordStore>, sink: Arc<dyn StatusSink>) -> Self {
        Self { store, sink }
    }

    /// Build and persist the record for `error`.
    pub fn record(&self, request: &PatchRequest, error: &PatchError) -> ErrorRecord {
        let record = ErrorRecord::from_error(request, error);
        warn!(
            request_id = %request.request_id,
            target = %request.target_kind,
            code = %record.code,
            affected = ?record.affected_nodes,
            "{}",
            record.message
        );
        if let Err(err) = self.store.append(ERROR_STREAM, &record) {
            warn!(request_id = %request.request_id, "Failed to persist error record: {}", err);
        }
        record
    }

    /// Forward the final outcome. Delivery failures are logged only.
    pub fn report(&self, outcome: &OperationOutcome) {
        match self.sink.deliver(outcome) {
            Ok(()) => info!(
                request_id = %outcome.request_id,
                status = ?outcome.status,
                no_action_taken = outcome.no_action_taken,
                "Reported outcome"
            ),
            Err(err) => warn!(request_id = %outcome.request_id, "{}", err),
        }
    }

    /// Persisted records, oldest first.
    pub fn history(&self) -> Vec<ErrorRecord> {
        self.store.read_stream(ERROR_STREAM).unwrap_or_else(|err| {
            warn!("Failed to read error history: {}", err);
            Vec::new()
        })
    }

    pub fn history_for(&self, request_id: RequestId) -> Vec<ErrorRecord> {
        self.history()
            .into_iter()
            .filter(|r| r.request_id == request_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::OutcomeStatus;
    use crate::store::MemoryStore;
    use std::time::Duration;

    struct FailingSink;

    impl StatusSink for FailingSink {
        fn deliver(&self, _: &OperationOutcome) -> Result<(), SinkError> {
            Err(SinkError("dashboard unavailable".into()))
        }
    }

    fn request() -> PatchRequest {
        PatchRequest::new(
            TargetKind::DomU,
            Operation::Patch,
            "21.2.11.0.0.220414.1",
            vec!["db01".into()],
            vec!["vm01".into()],
        )
    }

    #[test]
    fn test_record_is_persisted_with_target_specific_action() {
        let store = Arc::new(MemoryStore::new());
        let reporter = ErrorReporter::new(store.clone(), Arc::new(EventBus::default()));
        let request = request();
        let err = PatchError::ExternalToolFailure {
            launch_node: "db01".into(),
            log_dir: "/logs".into(),
            tool_status: 1,
        };

        let record = reporter.record(&request, &err);
        assert_eq!(record.code, "0x03050017");
        assert_eq!(record.action, ErrorAction::FailAndShow);
        assert_eq!(record.affected_nodes, vec!["db01".to_string()]);
        assert!(record.suggestion.contains("logs available on node db01"));

        assert_eq!(reporter.history_for(request.request_id), vec![record]);
        assert!(reporter.history_for(RequestId::new()).is_empty());
    }

    #[test]
    fn test_sink_failure_does_not_panic() {
        let reporter = ErrorReporter::new(Arc::new(MemoryStore::new()), Arc::new(FailingSink));
        let outcome = OperationOutcome::success(&request(), HandlerState::CleanedUp, vec![], vec![]);
        reporter.report(&outcome);
        assert_eq!(outcome.status, OutcomeStatus::Success);
    }

    #[tokio::test]
    async fn test_event_bus_publishes_progress_json() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();
        let request = request();
        bus.publish(&ProgressSnapshot {
            request_id: request.request_id,
            target_kind: TargetKind::Cell,
            stage: HandlerState::NodesFiltered,
            included: vec!["cel01".into()],
            discarded: vec![NodeCandidate::discarded("cel02", Some("2".into()), "compliant")],
            detail: None,
        });

        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["event"], "progress");
        assert_eq!(parsed["data"]["stage"], "NODES_FILTERED");
        assert_eq!(parsed["data"]["included"][0], "cel01");
        chrono::DateTime::parse_from_rfc3339(parsed["timestamp"].as_str().unwrap()).unwrap();
    }

    #[test]
    fn test_event_bus_buffer_is_clamped() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();
        for i in 0..DEFAULT_BUFFER {
            bus.emit("tick", &i).unwrap();
        }
        assert!(rx.try_recv().is_ok());
    }
}
