//! Error catalog and definitions for the Infra Patch Manager.
//!
//! Codes are fixed-width hex strings partitioned by subsystem; see
//! [`catalog`] for the range table.

pub mod catalog;

pub use catalog::{ErrorAction, ErrorCategory, ErrorCode, ErrorEntry, SUCCESS_CODE};
