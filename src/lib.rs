//! Portability - Workflow Portability Testing
//!
//! Submits one workflow to several heterogeneous execution backends and
//! reports every run in a single canonical lifecycle, so the same
//! workflow can be checked for portability across environments.
//!
//! # Architecture
//!
//! - [`coordinator`]: Fans a test out to its environments and answers
//!   status and log queries
//! - [`backend`]: One adapter per execution technology (WES endpoints,
//!   single-node instances, job graphs on a remote platform)
//! - [`aggregate`]: Pure mappings from native states and logs to the
//!   canonical shape
//! - [`localize`]: Finding and downloading remote inputs
//! - [`model`]: Canonical states, tests and run records
//! - [`storage`]: Key-value tables, object store, environment registry
//! - [`config`]: Service settings
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use portability::backend::single_node::{InstanceContext, LocalCompute};
//! use portability::localize::{Fetcher, HttpFetcher};
//! use portability::storage::{
//!     FsKeyValueStore, FsObjectStore, KeyValueStore, ObjectStore, TableEnvironmentRegistry,
//! };
//! use portability::{Backends, ServiceConfig, SubmissionRequest, TestCoordinator, WorkflowRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::default();
//!     let store: Arc<dyn KeyValueStore> = Arc::new(FsKeyValueStore::new(&config.data_dir));
//!     let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.data_dir));
//!     let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new());
//!     let compute = Arc::new(LocalCompute::new(InstanceContext {
//!         config: config.single_node.clone(),
//!         store: store.clone(),
//!         objects: objects.clone(),
//!         fetcher: fetcher.clone(),
//!     }));
//!
//!     let timeout = config.adapter_timeout();
//!     let backends = Backends::new(config, store.clone(), objects, fetcher, compute);
//!     let coordinator = TestCoordinator::new(
//!         Arc::new(TableEnvironmentRegistry::new(store.clone())),
//!         store,
//!         Arc::new(backends),
//!         timeout,
//!     );
//!
//!     let test_id = coordinator
//!         .submit_test(SubmissionRequest {
//!             workflow: WorkflowRequest::new("workflow hello {}", "{}"),
//!             target_environments: vec!["env-a".to_string(), "env-b".to_string()],
//!         })
//!         .await?;
//!     println!("{}", coordinator.get_test_status(&test_id).await?.state);
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod localize;
pub mod model;
pub mod storage;

// Re-export commonly used types
pub use backend::{BackendAdapter, Backends, Dialect};
pub use config::{load_config, ServiceConfig};
pub use coordinator::TestCoordinator;
pub use error::{ErrorEnvelope, PortabilityError, Result};
pub use model::{CanonicalState, SubmissionRequest, TestStatus, WorkflowRequest};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Portability";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Portability");
    }

    #[test]
    fn test_module_exports_state() {
        assert!(CanonicalState::Complete.is_terminal());
        assert_eq!("wes".parse::<Dialect>().unwrap(), Dialect::Wes);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
