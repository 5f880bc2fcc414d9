//! Resolves a request to the handler for its target kind and mode.
//!
//! Real and mock handlers share the store, the progress channel, the status
//! sink and the in-flight table, so a mock run is indistinguishable from a
//! real one to everything but the transport.

use crate::handler::{HandlerContext, HandlerSettings, OperationOutcome, TargetOperationHandler};
use crate::flight::FlightTable;
use crate::idempotency::IdempotencyTracker;
use crate::overlay::MockOverlay;
use crate::reporter::{ErrorReporter, ProgressChannel, StatusSink};
use crate::session::SessionTimings;
use crate::store::RecordStore;
use crate::transport::Transport;
use ipm_common::config::{ConfigError, IpmConfig};
use ipm_common::mock::MockRemote;
use ipm_common::remote::RemoteExecutor;
use ipm_common::retry::RetryPolicy;
use ipm_common::types::{PatchRequest, TargetKind};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Where a handler sends its node I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Real,
    /// Simulated fleet built from the request's fixtures.
    Mock,
}

/// Collaborators supplied by the host process.
#[derive(Clone)]
pub struct EngineServices {
    pub executor: Arc<dyn RemoteExecutor>,
    pub store: Arc<dyn RecordStore>,
    pub progress: Arc<dyn ProgressChannel>,
    pub sink: Arc<dyn StatusSink>,
}

/// Built once per process; hands out one handler per request.
pub struct HandlerRegistry {
    config: Arc<IpmConfig>,
    services: EngineServices,
    settings: HandlerSettings,
    mock_settings: HandlerSettings,
    flights: Arc<FlightTable>,
    overlay: Option<MockRemote>,
}

impl HandlerRegistry {
    pub fn new(config: Arc<IpmConfig>, services: EngineServices) -> Result<Self, ConfigError> {
        let settings = HandlerSettings::from_config(&config)?;
        let mock_settings = HandlerSettings {
            timings: SessionTimings::fast(),
            ..settings.clone()
        };
        Ok(Self {
            config,
            services,
            settings,
            mock_settings,
            flights: Arc::new(FlightTable::new()),
            overlay: None,
        })
    }

    /// Serve every mock-mode request from `remote` instead of a fleet built
    /// per request.
    #[must_use]
    pub fn with_overlay(mut self, remote: MockRemote) -> Self {
        self.overlay = Some(remote);
        self
    }

    /// Override session timings in both modes.
    #[must_use]
    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.settings.timings = timings;
        self.mock_settings.timings = timings;
        self
    }

    pub fn settings(&self, mode: Mode) -> &HandlerSettings {
        match mode {
            Mode::Real => &self.settings,
            Mode::Mock => &self.mock_settings,
        }
    }

    pub fn flights(&self) -> &Arc<FlightTable> {
        &self.flights
    }

    /// Mock when the request asks for it or the process runs in mock mode.
    pub fn mode_for(&self, request: &PatchRequest) -> Mode {
        if request.is_mock || self.config.mock.enabled {
            Mode::Mock
        } else {
            Mode::Real
        }
    }

    fn context(&self, transport: Transport) -> HandlerContext {
        HandlerContext {
            transport,
            tracker: IdempotencyTracker::new(self.services.store.clone()),
            reporter: ErrorReporter::new(self.services.store.clone(), self.services.sink.clone()),
            progress: self.services.progress.clone(),
            flights: self.flights.clone(),
        }
    }

    /// Handler for the request's target kind in the resolved mode.
    pub fn resolve(&self, request: &PatchRequest) -> TargetOperationHandler {
        let mode = self.mode_for(request);
        let kind = request.target_kind;
        debug!(request_id = %request.request_id, target = %kind, mode = ?mode, "Resolving handler");

        let (transport, settings) = match mode {
            Mode::Real => (
                Transport::new(self.services.executor.clone(), RetryPolicy::from(&self.config.retry)),
                self.settings.clone(),
            ),
            Mode::Mock => {
                let remote = match &self.overlay {
                    Some(remote) => remote.clone(),
                    None => MockOverlay::build(request, &self.mock_settings),
                };
                let policy = RetryPolicy::immediate(self.config.retry.transport_max_attempts);
                (Transport::new(Arc::new(remote), policy), self.mock_settings.clone())
            }
        };

        match kind {
            TargetKind::Dom0
            | TargetKind::DomU
            | TargetKind::Cell
            | TargetKind::IbSwitch
            | TargetKind::RoceSwitch => TargetOperationHandler::new(kind, mode, settings, self.context(transport)),
        }
    }

    pub async fn execute(&self, request: &PatchRequest) -> OperationOutcome {
        self.resolve(request).execute(request).await
    }
}
