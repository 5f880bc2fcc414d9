//! Durable per-request progress markers.
//!
//! One marker per `(requestId, targetKind)`, advanced at each stage boundary.
//! A retried or restarted request resumes from its marker and never
//! re-filters once a node list has been recorded.

use crate::error::PatchError;
use crate::session::SessionRecord;
use crate::store::{RecordStore, RecordStoreExt};
use chrono::{DateTime, Utc};
use ipm_common::types::{NodeCandidate, Operation, PatchRequest, RequestId, TargetKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

const MARKER_PREFIX: &str = "marker";

/// Stage boundaries, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkerStage {
    Created,
    Filtered,
    SessionStarted,
    SessionCompleted,
    Validated,
    CleanedUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyMarker {
    pub request_id: RequestId,
    pub target_kind: TargetKind,
    pub operation: Operation,
    pub stage: MarkerStage,
    /// Bumped on every write.
    pub counter: u64,
    pub launch_node: Option<String>,
    /// Filtered candidates; `observedVersion` holds the pre-operation version.
    #[serde(default)]
    pub candidates: Vec<NodeCandidate>,
    #[serde(default)]
    pub session: Option<SessionRecord>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyMarker {
    fn new(request: &PatchRequest) -> Self {
        Self {
            request_id: request.request_id,
            target_kind: request.target_kind,
            operation: request.operation,
            stage: MarkerStage::Created,
            counter: 0,
            launch_node: None,
            candidates: Vec::new(),
            session: None,
            updated_at: Utc::now(),
        }
    }

    pub fn included(&self) -> Vec<NodeCandidate> {
        self.candidates.iter().filter(|c| c.included).cloned().collect()
    }

    pub fn discarded(&self) -> Vec<NodeCandidate> {
        self.candidates.iter().filter(|c| !c.included).cloned().collect()
    }

    pub fn has_node_list(&self) -> bool {
        self.stage >= MarkerStage::Filtered
    }
}

/// Data written with a stage.
#[derive(Debug, Clone)]
pub enum StagePayload {
    None,
    Filtered {
        launch_node: Option<String>,
        candidates: Vec<NodeCandidate>,
    },
    Session(SessionRecord),
}

pub fn marker_key(request_id: RequestId, kind: TargetKind) -> String {
    format!("{MARKER_PREFIX}/{request_id}/{}", kind.as_str())
}

#[derive(Clone)]
pub struct IdempotencyTracker {
    store: Arc<dyn RecordStore>,
}

impl IdempotencyTracker {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, request_id: RequestId, kind: TargetKind) -> Result<Option<IdempotencyMarker>, PatchError> {
        let marker: Option<IdempotencyMarker> = self.store.get(&marker_key(request_id, kind))?;
        if let Some(marker) = &marker
            && (marker.request_id != request_id || marker.target_kind != kind)
        {
            return Err(PatchError::IdempotencyStateCorrupt {
                reason: format!(
                    "marker stored under {} belongs to {}/{}",
                    marker_key(request_id, kind),
                    marker.request_id,
                    marker.target_kind
                ),
            });
        }
        Ok(marker)
    }

    /// Existing marker for the request, or a fresh one at `CREATED`.
    ///
    /// The boolean is true when the marker was already persisted.
    pub fn load_or_create(&self, request: &PatchRequest) -> Result<(IdempotencyMarker, bool), PatchError> {
        if let Some(marker) = self.load(request.request_id, request.target_kind)? {
            debug!(
                request_id = %request.request_id,
                stage = ?marker.stage,
                counter = marker.counter,
                "Loaded idempotency marker"
            );
            return Ok((marker, true));
        }
        let mut marker = IdempotencyMarker::new(request);
        self.persist(&mut marker)?;
        Ok((marker, false))
    }

    /// Move `marker` to `stage` and persist it. Stages never go backwards.
    pub fn advance(
        &self,
        marker: &mut IdempotencyMarker,
        stage: MarkerStage,
        payload: StagePayload,
    ) -> Result<(), PatchError> {
        if stage < marker.stage {
            return Err(PatchError::IdempotencyStateCorrupt {
                reason: format!("marker cannot move back from {:?} to {stage:?}", marker.stage),
            });
        }
        match payload {
            StagePayload::None => {}
            StagePayload::Filtered {
                launch_node,
                candidates,
            } => {
                marker.launch_node = launch_node;
                marker.candidates = candidates;
            }
            StagePayload::Session(record) => {
                marker.launch_node = Some(record.launch_node.clone());
                marker.session = Some(record);
            }
        }
        marker.stage = stage;
        self.persist(marker)?;
        info!(
            request_id = %marker.request_id,
            target = %marker.target_kind,
            stage = ?stage,
            counter = marker.counter,
            "Advanced idempotency marker"
        );
        Ok(())
    }

    fn persist(&self, marker: &mut IdempotencyMarker) -> Result<(), PatchError> {
        marker.counter += 1;
        marker.updated_at = Utc::now();
        self.store
            .put(&marker_key(marker.request_id, marker.target_kind), &*marker)?;
        Ok(())
    }

    /// Whether any marker exists for `request_id`.
    pub fn is_retry(&self, request_id: RequestId) -> Result<bool, PatchError> {
        let prefix = format!("{MARKER_PREFIX}/{request_id}/");
        Ok(!self.store.keys(&prefix)?.is_empty())
    }

    pub fn clear(&self, request_id: RequestId, kind: TargetKind) -> Result<(), PatchError> {
        self.store.delete(&marker_key(request_id, kind))?;
        debug!(request_id = %request_id, target = %kind, "Cleared idempotency marker");
        Ok(())
    }
}
