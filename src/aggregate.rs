//! Status/Log Aggregation
//!
//! Pure translation from what each backend reports to the canonical
//! shapes. Nothing here performs I/O; adapters fetch the raw material
//! and hand it over.
//!
//! # State tables
//!
//! One table per native vocabulary. A value missing from its table maps
//! to `UNKNOWN`.
//!
//! # Log shape
//!
//! Every backend is normalized into one workflow-level [`LogEntry`] plus
//! zero or more task-level entries carrying a task name.

use std::collections::{BTreeMap, HashMap};

use chrono::{TimeZone, Utc};
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::backend::job_graph::{JobDescription, RUNNER_JOB_NAME};
use crate::backend::single_node::RunTiming;
use crate::model::{CanonicalState, LogEntry, RunRecord};

/// Native state vocabularies known to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeVocabulary {
    /// WES endpoints, current and legacy spellings
    Wes,
    /// Cromwell's own workflow states
    Cromwell,
    /// Job states of the remote execution platform
    JobPlatform,
    /// States written by single-node instances
    SingleNode,
}

type StateTable = HashMap<&'static str, CanonicalState>;

static WES_STATES: Lazy<StateTable> = Lazy::new(|| {
    let mut table: StateTable = CanonicalState::ALL
        .iter()
        .map(|state| (state.as_str(), *state))
        .collect();
    table.extend([
        ("Unknown", CanonicalState::Unknown),
        ("Queued", CanonicalState::Queued),
        ("Initializing", CanonicalState::Initializing),
        ("Running", CanonicalState::Running),
        ("Paused", CanonicalState::Paused),
        ("Complete", CanonicalState::Complete),
        ("Error", CanonicalState::ExecutorError),
        ("SystemError", CanonicalState::SystemError),
        ("Canceled", CanonicalState::Canceled),
    ]);
    table
});

static CROMWELL_STATES: Lazy<StateTable> = Lazy::new(|| {
    HashMap::from([
        ("Submitted", CanonicalState::Queued),
        ("Running", CanonicalState::Running),
        ("Aborting", CanonicalState::Canceled),
        ("Aborted", CanonicalState::Canceled),
        ("Failed", CanonicalState::ExecutorError),
        ("Succeeded", CanonicalState::Complete),
    ])
});

static JOB_PLATFORM_STATES: Lazy<StateTable> = Lazy::new(|| {
    HashMap::from([
        ("idle", CanonicalState::Queued),
        ("runnable", CanonicalState::Queued),
        ("running", CanonicalState::Running),
        ("waiting_on_input", CanonicalState::Running),
        ("waiting_on_output", CanonicalState::Running),
        ("debug_hold", CanonicalState::Paused),
        ("done", CanonicalState::Complete),
        ("failed", CanonicalState::ExecutorError),
        ("terminating", CanonicalState::ExecutorError),
        ("terminated", CanonicalState::ExecutorError),
    ])
});

static SINGLE_NODE_STATES: Lazy<StateTable> = Lazy::new(|| {
    HashMap::from([
        ("PROVISIONING", CanonicalState::Initializing),
        ("RUNNING", CanonicalState::Running),
        ("COMPLETE", CanonicalState::Complete),
        ("EXECUTOR_ERROR", CanonicalState::ExecutorError),
    ])
});

/// Maps a native state onto the canonical enum.
pub fn map_state(vocabulary: NativeVocabulary, native: &str) -> CanonicalState {
    let table = match vocabulary {
        NativeVocabulary::Wes => &WES_STATES,
        NativeVocabulary::Cromwell => &CROMWELL_STATES,
        NativeVocabulary::JobPlatform => &JOB_PLATFORM_STATES,
        NativeVocabulary::SingleNode => &SINGLE_NODE_STATES,
    };
    table
        .get(native.trim())
        .copied()
        .unwrap_or(CanonicalState::Unknown)
}

/// Engine log objects, relative to a run's log prefix.
pub const ENGINE_STDOUT: &str = "engine-stdout.log";
pub const ENGINE_STDERR: &str = "engine-stderr.log";

/// Builds the record of a single-node run from its bookkeeping and the
/// harvested log artifacts.
///
/// `artifacts` maps paths relative to `{run_id}/logs/` to their content.
/// Task artifacts are grouped by directory; a directory counts as a task
/// once any of `stdout`, `stderr` or `rc` is present, so partially
/// uploaded tasks still show up.
pub fn single_node_record(
    workflow_id: &str,
    state: CanonicalState,
    timing: Option<&RunTiming>,
    exit_code: Option<i32>,
    artifacts: &BTreeMap<String, String>,
) -> RunRecord {
    let mut record = RunRecord::new(workflow_id, state);

    if let Some(timing) = timing {
        record.workflow_log.start_time = timing.start_time.clone();
        record.workflow_log.end_time = timing.end_time.clone();
    }
    record.workflow_log.exit_code = exit_code;

    let mut tasks: BTreeMap<&str, LogEntry> = BTreeMap::new();
    for (path, content) in artifacts {
        match path.as_str() {
            ENGINE_STDOUT => record.workflow_log.stdout = content.clone(),
            ENGINE_STDERR => record.workflow_log.stderr = content.clone(),
            _ => {
                let Some((task, artifact)) = path.rsplit_once('/') else {
                    continue;
                };
                let entry = tasks.entry(task).or_insert_with(|| LogEntry::task(task));
                match artifact {
                    "stdout" => entry.stdout = content.clone(),
                    "stderr" => entry.stderr = content.clone(),
                    "rc" => entry.exit_code = content.trim().parse().ok(),
                    _ => {}
                }
            }
        }
    }

    record.task_logs = tasks
        .into_values()
        .filter(|t| !t.stdout.is_empty() || !t.stderr.is_empty() || t.exit_code.is_some())
        .collect();
    record
}

/// Formats a platform timestamp (milliseconds since the epoch).
pub fn format_millis(millis: Option<i64>) -> String {
    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Derives one state from every job tagged with a correlation id.
///
/// Any failed job fails the run. A finished coordination job decides the
/// outcome; until then the most advanced outstanding job does, so the
/// answer does not depend on which jobs the platform's search returns
/// first.
pub fn job_graph_state(jobs: &[JobDescription]) -> CanonicalState {
    if jobs.is_empty() {
        return CanonicalState::Unknown;
    }

    let states: Vec<(bool, CanonicalState)> = jobs
        .iter()
        .map(|job| {
            (
                job.name == RUNNER_JOB_NAME,
                map_state(NativeVocabulary::JobPlatform, &job.state),
            )
        })
        .collect();

    if states.iter().any(|(_, state)| state.is_error()) {
        return CanonicalState::ExecutorError;
    }

    if let Some((_, runner)) = states.iter().find(|(is_runner, _)| *is_runner) {
        if runner.is_terminal() {
            return *runner;
        }
    }

    states
        .iter()
        .map(|(_, state)| *state)
        .filter(|state| !state.is_terminal())
        .max()
        .unwrap_or(CanonicalState::Queued)
}

/// Task entry for one platform job.
pub fn job_task_log(job: &JobDescription, log: String) -> LogEntry {
    LogEntry {
        name: Some(format!("{}:{}", job.executable_name, job.id)),
        stdout: log,
        stderr: String::new(),
        start_time: format_millis(job.started_running),
        end_time: format_millis(job.stopped_running),
        exit_code: None,
    }
}

/// Builds the record of a job-graph run from its tagged jobs, the task
/// jobs launched under the coordination job, and their fetched logs.
///
/// Only tagged jobs decide the state. The coordination job's times stand
/// for the workflow.
pub fn job_graph_record(
    workflow_id: &str,
    jobs: &[(JobDescription, String)],
    children: &[(JobDescription, String)],
) -> RunRecord {
    let descriptions: Vec<JobDescription> = jobs.iter().map(|(job, _)| job.clone()).collect();
    let mut record = RunRecord::new(workflow_id, job_graph_state(&descriptions));

    if let Some((runner, _)) = jobs.iter().find(|(job, _)| job.name == RUNNER_JOB_NAME) {
        record.workflow_log.start_time = format_millis(runner.started_running);
        record.workflow_log.end_time = format_millis(runner.stopped_running);
    }

    record.task_logs = jobs
        .iter()
        .chain(children)
        .map(|(job, log)| job_task_log(job, log.clone()))
        .collect();
    record
}

fn text_field(value: &Value, field: &str) -> String {
    match value.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn exit_code_field(value: &Value) -> Option<i32> {
    match value.get("exit_code")? {
        Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn wes_log_entry(value: &Value) -> LogEntry {
    let name = text_field(value, "name");
    LogEntry {
        name: if name.is_empty() { None } else { Some(name) },
        stdout: text_field(value, "stdout"),
        stderr: text_field(value, "stderr"),
        start_time: text_field(value, "start_time"),
        end_time: text_field(value, "end_time"),
        exit_code: exit_code_field(value),
    }
}

/// Normalizes a WES run log response.
///
/// Accepts `workflow_log` or the newer `run_log` for the workflow-level
/// record. Task entries without a name are given their position.
pub fn wes_record(workflow_id: &str, body: &Value) -> RunRecord {
    let state = map_state(NativeVocabulary::Wes, &text_field(body, "state"));
    let mut record = RunRecord::new(workflow_id, state);

    if let Some(log) = body.get("workflow_log").or_else(|| body.get("run_log")) {
        record.workflow_log = wes_log_entry(log);
        record.workflow_log.name = None;
    }

    if let Some(Value::Array(tasks)) = body.get("task_logs") {
        record.task_logs = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| {
                let mut entry = wes_log_entry(task);
                if entry.name.is_none() {
                    entry.name = Some(format!("task-{}", index));
                }
                entry
            })
            .collect();
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: &str, name: &str, state: &str) -> JobDescription {
        JobDescription {
            id: id.to_string(),
            name: name.to_string(),
            executable_name: name.to_string(),
            state: state.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_unmapped_values_are_unknown() {
        assert_eq!(map_state(NativeVocabulary::Wes, "Bogus"), CanonicalState::Unknown);
        assert_eq!(map_state(NativeVocabulary::Cromwell, ""), CanonicalState::Unknown);
        assert_eq!(
            map_state(NativeVocabulary::JobPlatform, "DONE"),
            CanonicalState::Unknown
        );
    }

    #[test]
    fn test_wes_accepts_both_spellings() {
        for state in CanonicalState::ALL {
            assert_eq!(map_state(NativeVocabulary::Wes, state.as_str()), state);
        }
        assert_eq!(map_state(NativeVocabulary::Wes, "Complete"), CanonicalState::Complete);
        assert_eq!(
            map_state(NativeVocabulary::Wes, "Error"),
            CanonicalState::ExecutorError
        );
    }

    #[test]
    fn test_job_platform_table() {
        let cases = [
            ("running", CanonicalState::Running),
            ("waiting_on_input", CanonicalState::Running),
            ("runnable", CanonicalState::Queued),
            ("terminated", CanonicalState::ExecutorError),
            ("done", CanonicalState::Complete),
        ];
        for (native, expected) in cases {
            assert_eq!(map_state(NativeVocabulary::JobPlatform, native), expected);
        }
    }

    #[test]
    fn test_cromwell_and_single_node_tables() {
        assert_eq!(
            map_state(NativeVocabulary::Cromwell, "Aborted"),
            CanonicalState::Canceled
        );
        assert_eq!(
            map_state(NativeVocabulary::SingleNode, "PROVISIONING"),
            CanonicalState::Initializing
        );
    }

    #[test]
    fn test_single_node_record_groups_tasks() {
        let artifacts: BTreeMap<String, String> = [
            (ENGINE_STDOUT, "engine out"),
            (ENGINE_STDERR, "engine err"),
            ("wf/run-1/call-a/execution/stdout", "a out"),
            ("wf/run-1/call-a/execution/stderr", "a err"),
            ("wf/run-1/call-a/execution/rc", "0\n"),
            ("wf/run-1/call-b/execution/rc", "3"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let timing = RunTiming {
            start_time: "2024-01-01T00:00:00Z".to_string(),
            end_time: "2024-01-01T01:00:00Z".to_string(),
            deadline: "2024-01-01T01:30:00Z".to_string(),
        };

        let record = single_node_record(
            "run-1",
            CanonicalState::ExecutorError,
            Some(&timing),
            Some(1),
            &artifacts,
        );

        assert_eq!(record.workflow_log.stdout, "engine out");
        assert_eq!(record.workflow_log.exit_code, Some(1));
        assert_eq!(record.workflow_log.end_time, "2024-01-01T01:00:00Z");
        assert_eq!(record.task_logs.len(), 2);
        assert_eq!(
            record.task_logs[0].name.as_deref(),
            Some("wf/run-1/call-a/execution")
        );
        assert_eq!(record.task_logs[0].exit_code, Some(0));
        assert_eq!(record.task_logs[1].exit_code, Some(3));
        assert!(record.task_logs[1].stdout.is_empty());
    }

    #[test]
    fn test_job_graph_state_error_wins() {
        let jobs = [
            job("job-1", "localizer", "failed"),
            job("job-2", RUNNER_JOB_NAME, "runnable"),
        ];
        assert_eq!(job_graph_state(&jobs), CanonicalState::ExecutorError);
    }

    #[test]
    fn test_job_graph_state_independent_of_order() {
        let mut jobs = vec![
            job("job-1", "localizer", "running"),
            job("job-2", RUNNER_JOB_NAME, "waiting_on_input"),
        ];
        let forward = job_graph_state(&jobs);
        jobs.reverse();
        assert_eq!(job_graph_state(&jobs), forward);
        assert_eq!(forward, CanonicalState::Running);
    }

    #[test]
    fn test_job_graph_state_runner_decides_when_finished() {
        let jobs = [
            job("job-1", "localizer", "done"),
            job("job-2", RUNNER_JOB_NAME, "done"),
        ];
        assert_eq!(job_graph_state(&jobs), CanonicalState::Complete);

        let localizers_only = [job("job-1", "localizer", "done")];
        assert_eq!(job_graph_state(&localizers_only), CanonicalState::Queued);
        assert_eq!(job_graph_state(&[]), CanonicalState::Unknown);
    }

    #[test]
    fn test_job_graph_record_uses_runner_times() {
        let mut runner = job("job-2", RUNNER_JOB_NAME, "done");
        runner.started_running = Some(0);
        runner.stopped_running = Some(60_000);

        let record = job_graph_record("wf-1", &[(runner, "compiled".to_string())], &[]);
        assert_eq!(record.workflow_log.start_time, "1970-01-01T00:00:00");
        assert_eq!(record.workflow_log.end_time, "1970-01-01T00:01:00");
        assert_eq!(record.task_logs[0].name.as_deref(), Some("WES dxWDL Runner:job-2"));
        assert_eq!(record.task_logs[0].stdout, "compiled");
        assert_eq!(format_millis(None), "");
    }

    #[test]
    fn test_job_graph_record_appends_task_jobs() {
        let runner = job("job-2", RUNNER_JOB_NAME, "done");
        let task = job("job-3", "align", "failed");

        let record = job_graph_record(
            "wf-1",
            &[(runner, String::new())],
            &[(task, "task align failed".to_string())],
        );
        assert_eq!(record.state, CanonicalState::Complete);
        assert_eq!(record.task_logs.len(), 2);
        assert_eq!(record.task_logs[1].name.as_deref(), Some("align:job-3"));
        assert_eq!(record.task_logs[1].stdout, "task align failed");
    }

    #[test]
    fn test_wes_record_normalization() {
        let body = json!({
            "state": "Complete",
            "run_log": {"stdout": "out", "start_time": "t0", "exit_code": "0"},
            "task_logs": [
                {"name": "call-a", "stdout": "a", "exit_code": 0},
                {"stdout": "b", "exit_code": null}
            ]
        });
        let record = wes_record("w1", &body);

        assert_eq!(record.state, CanonicalState::Complete);
        assert_eq!(record.workflow_log.stdout, "out");
        assert_eq!(record.workflow_log.exit_code, Some(0));
        assert_eq!(record.task_logs[0].name.as_deref(), Some("call-a"));
        assert_eq!(record.task_logs[1].name.as_deref(), Some("task-1"));
        assert_eq!(record.task_logs[1].exit_code, None);
    }
}
