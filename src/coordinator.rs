//! Test Coordinator
//!
//! Fans one workflow out to many environments and answers later
//! questions about it.
//!
//! # Submission
//!
//! Every target environment gets its own adapter call. The calls run
//! concurrently, each bounded by the adapter timeout, and a failure in
//! one never stops the others: it becomes an `EXECUTOR_ERROR` result for
//! that environment.
//!
//! # Queries
//!
//! Status and logs are re-read from the backends on every call. A fresh
//! observation only replaces the stored state while the stored state is
//! not terminal, and changed states are written back to the test record.
//! A backend that cannot be reached leaves the last known state in place.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use log::{info, warn};

use crate::backend::{BackendAdapter, Backends, Dialect};
use crate::error::{PortabilityError, Result};
use crate::localize::is_remote_reference;
use crate::model::{
    CanonicalState, Environment, EnvironmentLog, EnvironmentResult, RunRecord, SubmissionRequest,
    Test, TestStatus,
};
use crate::storage::{get_record, put_record, EnvironmentRegistry, KeyValueStore, NewEnvironment};

/// Table holding test records.
pub const TESTS_TABLE: &str = "tests";

/// Chooses the adapter serving an environment.
pub trait AdapterFactory: Send + Sync {
    fn adapter_for(&self, environment: &Environment) -> Result<Arc<dyn BackendAdapter>>;
}

impl AdapterFactory for Backends {
    fn adapter_for(&self, environment: &Environment) -> Result<Arc<dyn BackendAdapter>> {
        Backends::adapter_for(self, environment)
    }
}

pub struct TestCoordinator {
    registry: Arc<dyn EnvironmentRegistry>,
    store: Arc<dyn KeyValueStore>,
    adapters: Arc<dyn AdapterFactory>,
    timeout: Duration,
}

impl TestCoordinator {
    pub fn new(
        registry: Arc<dyn EnvironmentRegistry>,
        store: Arc<dyn KeyValueStore>,
        adapters: Arc<dyn AdapterFactory>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            adapters,
            timeout,
        }
    }

    /// Registers an environment after checking its schema is supported.
    pub async fn register_environment(&self, environment: NewEnvironment) -> Result<Environment> {
        environment.schema.parse::<Dialect>()?;
        self.registry.register(environment).await
    }

    pub async fn list_environments(&self) -> Result<Vec<Environment>> {
        self.registry.list().await
    }

    async fn adapter(&self, environment_id: &str) -> Result<Arc<dyn BackendAdapter>> {
        let environment = self.registry.get(environment_id).await?;
        self.adapters.adapter_for(&environment)
    }

    /// Runs one adapter call under the adapter timeout. The environment
    /// lookup belongs inside `call` so a slow registry is bounded too.
    async fn bounded<T>(&self, operation: String, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PortabilityError::Timeout {
                operation,
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    async fn submit_to(&self, environment_id: &str, request: &SubmissionRequest) -> EnvironmentResult {
        let submitted = self
            .bounded(format!("submit to {}", environment_id), async {
                let adapter = self.adapter(environment_id).await?;
                adapter.submit(&request.workflow).await
            })
            .await;

        match submitted {
            Ok(workflow_id) => {
                info!("Environment {} accepted run {}", environment_id, workflow_id);
                EnvironmentResult::accepted(environment_id, workflow_id)
            }
            Err(e) => {
                warn!("Submission to {} failed: {}", environment_id, e);
                EnvironmentResult::rejected(environment_id, e.to_string())
            }
        }
    }

    /// Submits a workflow to every target environment and records the
    /// test. Returns the new test id.
    pub async fn submit_test(&self, request: SubmissionRequest) -> Result<String> {
        if request.target_environments.is_empty() {
            return Err(PortabilityError::Invalid(
                "at least one target environment is required".to_string(),
            ));
        }
        if !is_remote_reference(request.workflow.workflow_params.trim()) {
            request.workflow.params_document()?;
        }

        let results = join_all(
            request
                .target_environments
                .iter()
                .map(|environment_id| self.submit_to(environment_id, &request)),
        )
        .await;

        let test = Test {
            test_id: uuid::Uuid::new_v4().to_string(),
            workflow: request.workflow,
            environment_results: results,
            created_at: Utc::now(),
        };
        put_record(self.store.as_ref(), TESTS_TABLE, &test.test_id, &test).await?;

        info!(
            "Test {} submitted to {} environments",
            test.test_id,
            test.environment_results.len()
        );
        Ok(test.test_id)
    }

    /// The stored test record, as last written.
    pub async fn get_test(&self, test_id: &str) -> Result<Test> {
        get_record(self.store.as_ref(), TESTS_TABLE, test_id)
            .await?
            .ok_or_else(|| PortabilityError::not_found("test", test_id))
    }

    async fn refresh(&self, result: &EnvironmentResult) -> CanonicalState {
        let Some(workflow_id) = &result.workflow_id else {
            return result.state;
        };
        if result.state.is_terminal() {
            return result.state;
        }

        let observed = self
            .bounded(
                format!("status of {} in {}", workflow_id, result.environment_id),
                async {
                    let adapter = self.adapter(&result.environment_id).await?;
                    adapter.get_status(workflow_id).await
                },
            )
            .await;

        match observed {
            Ok(state) => result.state.advance_to(state),
            Err(e) => {
                warn!(
                    "Keeping last known state of {} in {}: {}",
                    workflow_id, result.environment_id, e
                );
                result.state
            }
        }
    }

    /// Re-queries every environment and returns the aggregate state.
    pub async fn get_test_status(&self, test_id: &str) -> Result<TestStatus> {
        let mut test = self.get_test(test_id).await?;

        let states = join_all(test.environment_results.iter().map(|r| self.refresh(r))).await;

        let mut changed = false;
        for (result, state) in test.environment_results.iter_mut().zip(states) {
            if result.state != state {
                info!(
                    "Environment {} of test {}: {} -> {}",
                    result.environment_id, test_id, result.state, state
                );
                result.state = state;
                changed = true;
            }
        }
        if changed {
            put_record(self.store.as_ref(), TESTS_TABLE, test_id, &test).await?;
        }

        Ok(TestStatus {
            state: test.aggregate_state(),
            environment_states: test.environment_results,
        })
    }

    async fn log_of(&self, result: &EnvironmentResult) -> EnvironmentLog {
        let record = match &result.workflow_id {
            None => {
                let mut record = RunRecord::new("", result.state);
                record.workflow_log.stderr = result.message.clone().unwrap_or_default();
                record
            }
            Some(workflow_id) => {
                let fetched = self
                    .bounded(
                        format!("logs of {} in {}", workflow_id, result.environment_id),
                        async {
                            let adapter = self.adapter(&result.environment_id).await?;
                            adapter.get_log(workflow_id).await
                        },
                    )
                    .await;

                match fetched {
                    Ok(mut record) => {
                        record.state = result.state.advance_to(record.state);
                        record
                    }
                    Err(e) => {
                        warn!(
                            "No logs for {} in {}: {}",
                            workflow_id, result.environment_id, e
                        );
                        RunRecord::new(workflow_id.clone(), result.state)
                    }
                }
            }
        };

        EnvironmentLog {
            environment_id: result.environment_id.clone(),
            record,
        }
    }

    /// Logs of every environment of a test.
    pub async fn get_test_log(&self, test_id: &str) -> Result<Vec<EnvironmentLog>> {
        let test = self.get_test(test_id).await?;
        Ok(join_all(test.environment_results.iter().map(|r| self.log_of(r))).await)
    }
}
