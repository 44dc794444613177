//! Guaranteed Cleanup
//!
//! The exit handler of a single-node instance. Whatever ends the run
//! (the engine finishing, the work failing, or the watchdog expiring),
//! the handler runs exactly once and:
//!
//! 1. records the terminal state (`COMPLETE` only for exit code 0)
//! 2. records the end time
//! 3. disarms the watchdog
//! 4. terminates the instance
//!
//! Concurrent callers wait for the first one to finish and then see the
//! same outcome.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio::task::AbortHandle;

use super::compute::ComputeProvider;
use super::{timestamp, STATE_TABLE, TIMING_TABLE};
use crate::model::CanonicalState;
use crate::storage::KeyValueStore;

/// Why the instance is exiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    /// The engine ran and exited with this code
    Finished(i32),
    /// The work failed before the engine produced an exit code
    Failed(String),
    /// The watchdog expired
    TimedOut,
}

impl ExitCause {
    pub fn terminal_state(&self) -> CanonicalState {
        match self {
            Self::Finished(0) => CanonicalState::Complete,
            _ => CanonicalState::ExecutorError,
        }
    }

    fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Finished(code) => Some(*code),
            _ => None,
        }
    }
}

struct HandlerInner {
    store: Arc<dyn KeyValueStore>,
    compute: Arc<dyn ComputeProvider>,
    run_id: String,
    instance_id: String,
    outcome: OnceCell<CanonicalState>,
    watchdog: Mutex<Option<AbortHandle>>,
    work: Mutex<Option<AbortHandle>>,
}

/// Single exit path of an instance. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ExitHandler {
    inner: Arc<HandlerInner>,
}

fn take(slot: &Mutex<Option<AbortHandle>>) -> Option<AbortHandle> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn store_handle(slot: &Mutex<Option<AbortHandle>>, handle: AbortHandle) {
    match slot.lock() {
        Ok(mut guard) => *guard = Some(handle),
        Err(poisoned) => *poisoned.into_inner() = Some(handle),
    }
}

impl ExitHandler {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        compute: Arc<dyn ComputeProvider>,
        run_id: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                store,
                compute,
                run_id: run_id.into(),
                instance_id: instance_id.into(),
                outcome: OnceCell::new(),
                watchdog: Mutex::new(None),
                work: Mutex::new(None),
            }),
        }
    }

    /// Starts the watchdog. When `timeout` elapses before the handler has
    /// run, it fires with [`ExitCause::TimedOut`].
    pub fn arm_watchdog(&self, timeout: Duration) {
        let handler = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(
                "Run {} exceeded its {}s limit",
                handler.inner.run_id,
                timeout.as_secs()
            );
            handler.fire(ExitCause::TimedOut).await;
        });
        store_handle(&self.inner.watchdog, task.abort_handle());
    }

    /// Registers the main work so a timeout can stop it.
    pub fn guard_work(&self, work: AbortHandle) {
        store_handle(&self.inner.work, work);
    }

    /// Returns true once the handler has recorded an outcome.
    pub fn has_fired(&self) -> bool {
        self.inner.outcome.initialized()
    }

    /// Runs the exit sequence, or waits for the run already in progress,
    /// and returns the recorded terminal state.
    pub async fn fire(&self, cause: ExitCause) -> CanonicalState {
        *self
            .inner
            .outcome
            .get_or_init(|| self.exit(cause))
            .await
    }

    async fn exit(&self, cause: ExitCause) -> CanonicalState {
        let inner = &self.inner;
        let state = cause.terminal_state();
        info!("Run {} exiting with {} ({:?})", inner.run_id, state, cause);

        if let Err(e) = inner
            .store
            .update(STATE_TABLE, &inner.run_id, "state", Value::String(state.to_string()))
            .await
        {
            error!("Failed to record terminal state of {}: {}", inner.run_id, e);
        }
        if let Some(code) = cause.exit_code() {
            if let Err(e) = inner
                .store
                .update(STATE_TABLE, &inner.run_id, "exit_code", Value::from(code))
                .await
            {
                error!("Failed to record exit code of {}: {}", inner.run_id, e);
            }
        }
        if let Err(e) = inner
            .store
            .update(
                TIMING_TABLE,
                &inner.run_id,
                "end_time",
                Value::String(timestamp(Utc::now())),
            )
            .await
        {
            error!("Failed to record end time of {}: {}", inner.run_id, e);
        }

        // The watchdog is the caller when it timed out; aborting it then
        // would cancel this very sequence.
        if cause != ExitCause::TimedOut {
            if let Some(watchdog) = take(&inner.watchdog) {
                watchdog.abort();
            }
        } else if let Some(work) = take(&inner.work) {
            work.abort();
        }

        if let Err(e) = inner.compute.terminate(&inner.instance_id).await {
            warn!("Failed to terminate instance {}: {}", inner.instance_id, e);
        }
        state
    }
}
