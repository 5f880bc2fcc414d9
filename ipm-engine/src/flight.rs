//! In-process single-flight reservations.
//!
//! Two reservations are tracked: one per `(requestId, targetKind)` so the
//! same request cannot run twice concurrently, and one per
//! `(targetKind, launchNode)` lane so at most one tool session is driven per
//! launch node. Both are released when the [`FlightGuard`] drops.

use ipm_common::types::{RequestId, TargetKind};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct FlightState {
    requests: HashSet<(RequestId, TargetKind)>,
    lanes: HashSet<(TargetKind, String)>,
}

#[derive(Debug, Default)]
pub struct FlightTable {
    state: Mutex<FlightState>,
}

impl FlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FlightState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve the request. `None` if it is already in flight.
    pub fn begin(self: &Arc<Self>, request_id: RequestId, kind: TargetKind) -> Option<FlightGuard> {
        if !self.state().requests.insert((request_id, kind)) {
            debug!(request_id = %request_id, target = %kind, "Request already in flight");
            return None;
        }
        Some(FlightGuard {
            table: Arc::clone(self),
            request: (request_id, kind),
            lane: None,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.state().requests.len()
    }

    pub fn lane_busy(&self, kind: TargetKind, launch_node: &str) -> bool {
        self.state().lanes.contains(&(kind, launch_node.to_string()))
    }
}

/// Held for the duration of one request.
#[derive(Debug)]
pub struct FlightGuard {
    table: Arc<FlightTable>,
    request: (RequestId, TargetKind),
    lane: Option<(TargetKind, String)>,
}

impl FlightGuard {
    /// Claim the launch-node lane. Returns false if another request holds it.
    pub fn claim_lane(&mut self, launch_node: &str) -> bool {
        let lane = (self.request.1, launch_node.to_string());
        if self.lane.as_ref() == Some(&lane) {
            return true;
        }
        if !self.table.state().lanes.insert(lane.clone()) {
            return false;
        }
        if let Some(previous) = self.lane.replace(lane) {
            self.table.state().lanes.remove(&previous);
        }
        true
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut state = self.table.state();
        state.requests.remove(&self.request);
        if let Some(lane) = self.lane.take() {
            state.lanes.remove(&lane);
        }
    }
}
