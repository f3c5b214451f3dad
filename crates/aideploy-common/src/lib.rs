//! Common types for the AI deployment operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod merge;
pub mod naming;
pub mod ownership;
pub mod quantity;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group shared by every custom resource of the operator
pub const API_GROUP: &str = "premlabs.io";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "aideploy-controller";

/// Short fixed delay before retrying a pass that lost an optimistic-concurrency race
pub const CONFLICT_REQUEUE_SECS: u64 = 1;
