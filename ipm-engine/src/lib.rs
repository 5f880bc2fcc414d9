//! Infra Patch Manager engine.
//!
//! Drives one patch operation for one target kind: filters nodes by
//! version, prepares a transient execution environment on a launch node,
//! runs the external patch tool detached, validates the result and cleans
//! up. Progress is persisted so a retried request resumes instead of
//! repeating work.

pub mod environment;
pub mod error;
pub mod flight;
pub mod handler;
pub mod idempotency;
pub mod node_filter;
pub mod overlay;
pub mod recorder;
pub mod registry;
pub mod reporter;
pub mod session;
pub mod store;
pub mod transport;
pub mod version;

pub use environment::FinalStatus;
pub use error::PatchError;
pub use handler::{HandlerState, OperationOutcome, OutcomeStatus, TargetOperationHandler};
pub use recorder::{Recorder, Recording};
pub use registry::{EngineServices, HandlerRegistry, Mode};
pub use reporter::{ErrorRecord, EventBus, ProgressChannel, ProgressSnapshot, StatusSink};
pub use store::{FileStore, MemoryStore, RecordStore};
pub use version::{TargetVersion, Version, VersionComparator};
