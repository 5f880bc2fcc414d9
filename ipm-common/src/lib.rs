//! Shared building blocks for the Infra Patch Manager.
//!
//! Request types, the hex error catalog, configuration, the retry policy and
//! the remote execution seam (real SSH and an in-memory mock).

pub mod config;
pub mod errors;
pub mod mock;
pub mod remote;
pub mod retry;
pub mod testing;
pub mod types;

pub use config::{ConfigError, IpmConfig};
pub use errors::{ErrorAction, ErrorCategory, ErrorCode, ErrorEntry, SUCCESS_CODE};
pub use remote::{CommandResult, RemoteError, RemoteExecutor, RemoteOptions, RemoteSession};
pub use retry::{RetryPolicy, RetryableError, run_with_retry};
pub use types::{NodeCandidate, Operation, OperationStyle, PatchRequest, RequestId, TargetKind};
