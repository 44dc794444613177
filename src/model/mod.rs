//! Data Model
//!
//! The shared vocabulary of the service: canonical states, tests,
//! environment results and run records.
//!
//! - [`state`]: Canonical lifecycle enum and test-level aggregation
//! - [`types`]: Environments, requests, tests and log records

pub mod state;
pub mod types;

pub use state::{aggregate_state, CanonicalState};
pub use types::{
    Environment, EnvironmentLog, EnvironmentResult, LogEntry, RunRecord, SubmissionRequest, Test,
    TestStatus, WorkflowDependency, WorkflowRequest,
};
