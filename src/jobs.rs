//! Asynchronous validation jobs
//!
//! Each submitted request derives a description string from its graph, is
//! checked for a sane `max-runtime` parameter, and then runs on its own
//! worker through the orchestrator in validation mode. The registry is the
//! only state shared across workers and sits behind a single mutex; status
//! and summary views are computed from a snapshot taken under that lock.
//! Jobs are kept for the lifetime of the process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::describe::Describer;
use crate::error::JobError;
use crate::graph::Graph;
use crate::orchestrator::PipelineRunner;
use crate::resources::Resources;

const DEFAULT_MAX_RUNTIME_SECS: i64 = 10;

/// Lifecycle state of a validation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Running,
    Completed,
    Error,
}

/// A request to validate one pipeline graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub pipeline_graph: Graph,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Map<String, Value>>,
}

/// Status view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationJobStatus {
    pub id: String,
    pub start_time: i64,
    pub elapsed_time: i64,
    pub state: JobState,
    pub is_valid: Option<bool>,
    pub error_message: Option<Vec<String>>,
}

/// Summary view: the job id plus the original request.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationJobSummary {
    pub id: String,
    pub request: ValidationRequest,
}

#[derive(Debug, Clone)]
struct ValidationJob {
    id: String,
    request: ValidationRequest,
    /// Derived launch string actually validated; kept for debugging.
    #[allow(dead_code)]
    pipeline_description: String,
    state: JobState,
    start_time: i64,
    end_time: Option<i64>,
    is_valid: Option<bool>,
    error_message: Option<Vec<String>>,
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Coerce the `max-runtime` parameter to an integer number of seconds.
/// Numbers truncate; numeric strings must parse as integers.
fn coerce_max_runtime(value: &Value) -> Result<i64, JobError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .ok_or(JobError::MaxRuntimeNotInteger),
        Value::String(s) => s.parse().map_err(|_| JobError::MaxRuntimeNotInteger),
        _ => Err(JobError::MaxRuntimeNotInteger),
    }
}

/// Tracks validation jobs and runs each on its own worker.
///
/// Cloning shares the registry; the manager is cheap to pass around.
#[derive(Clone)]
pub struct ValidationJobManager {
    jobs: Arc<Mutex<HashMap<String, ValidationJob>>>,
    resources: Resources,
    runner_binary: Option<PathBuf>,
}

impl ValidationJobManager {
    pub fn new(resources: Resources) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            resources,
            runner_binary: None,
        }
    }

    /// Point workers at a specific `pipeline-runner` binary.
    pub fn with_runner_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.runner_binary = Some(path.into());
        self
    }

    /// Start a validation job and return its id.
    ///
    /// The description is derived and the `max-runtime` parameter validated
    /// synchronously; failures there are returned to the caller before any
    /// job exists. Worker concurrency is unbounded: one task per job.
    pub fn submit(&self, request: ValidationRequest) -> Result<String, JobError> {
        let pipeline_description =
            Describer::new(&self.resources).describe(&request.pipeline_graph)?;

        let max_runtime = match request
            .parameters
            .as_ref()
            .and_then(|params| params.get("max-runtime"))
        {
            Some(value) => coerce_max_runtime(value)?,
            None => DEFAULT_MAX_RUNTIME_SECS,
        };
        if max_runtime < 1 {
            return Err(JobError::MaxRuntimeTooSmall);
        }

        let hard_timeout = Duration::from_secs(max_runtime as u64 + 60);
        let job_id = Uuid::new_v4().simple().to_string();

        let job = ValidationJob {
            id: job_id.clone(),
            request,
            pipeline_description: pipeline_description.clone(),
            state: JobState::Running,
            start_time: epoch_millis(),
            end_time: None,
            is_valid: None,
            error_message: None,
        };

        self.lock_jobs().insert(job_id.clone(), job);

        info!(
            job = %job_id,
            max_runtime,
            hard_timeout_secs = hard_timeout.as_secs(),
            "validation started"
        );

        let manager = self.clone();
        let worker_job_id = job_id.clone();
        tokio::spawn(async move {
            manager
                .execute_validation(worker_job_id, pipeline_description, max_runtime, hard_timeout)
                .await;
        });

        Ok(job_id)
    }

    async fn execute_validation(
        &self,
        job_id: String,
        pipeline_description: String,
        max_runtime: i64,
        hard_timeout: Duration,
    ) {
        let runner = match PipelineRunner::validation(max_runtime as f64) {
            Ok(runner) => runner.with_hard_timeout(hard_timeout),
            Err(err) => {
                self.record_job_error(&job_id, err.to_string());
                return;
            }
        };
        let runner = match &self.runner_binary {
            Some(path) => runner.with_runner_binary(path.clone()),
            None => runner,
        };

        match runner.validate(&pipeline_description).await {
            Ok(outcome) => {
                let mut jobs = self.lock_jobs();
                let Some(job) = jobs.get_mut(&job_id) else {
                    return;
                };
                job.end_time = Some(epoch_millis());
                job.is_valid = Some(outcome.is_valid);
                job.error_message = (!outcome.errors.is_empty()).then(|| outcome.errors.clone());

                if outcome.is_valid {
                    job.state = JobState::Completed;
                    info!(job = %job_id, "validation job completed, pipeline is valid");
                } else {
                    job.state = JobState::Error;
                    error!(job = %job_id, errors = ?outcome.errors, "validation job failed");
                }
            }
            Err(err) => self.record_job_error(&job_id, err.to_string()),
        }
    }

    /// Mark the job failed and append the message. Workers never propagate
    /// exceptions to their caller.
    fn record_job_error(&self, job_id: &str, message: String) {
        {
            let mut jobs = self.lock_jobs();
            if let Some(job) = jobs.get_mut(job_id) {
                job.state = JobState::Error;
                job.end_time = Some(epoch_millis());
                job.error_message
                    .get_or_insert_with(Vec::new)
                    .push(message.clone());
            }
        }
        error!(job = %job_id, %message, "validation job error");
    }

    pub fn job_status(&self, job_id: &str) -> Option<ValidationJobStatus> {
        let jobs = self.lock_jobs();
        jobs.get(job_id).map(build_status)
    }

    pub fn all_job_statuses(&self) -> Vec<ValidationJobStatus> {
        let jobs = self.lock_jobs();
        let mut statuses: Vec<ValidationJobStatus> = jobs.values().map(build_status).collect();
        statuses.sort_by_key(|s| s.start_time);
        statuses
    }

    pub fn job_summary(&self, job_id: &str) -> Option<ValidationJobSummary> {
        let jobs = self.lock_jobs();
        jobs.get(job_id).map(|job| ValidationJobSummary {
            id: job.id.clone(),
            request: job.request.clone(),
        })
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, ValidationJob>> {
        self.jobs.lock().expect("job registry lock poisoned")
    }
}

fn build_status(job: &ValidationJob) -> ValidationJobStatus {
    let elapsed_time = match job.end_time {
        Some(end) => end - job.start_time,
        None => epoch_millis() - job.start_time,
    };
    ValidationJobStatus {
        id: job.id.clone(),
        start_time: job.start_time,
        elapsed_time,
        state: job.state,
        is_valid: job.is_valid,
        error_message: job.error_message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_with_params(graph: Graph, params: serde_json::Value) -> ValidationRequest {
        let parameters = match params {
            Value::Object(map) => Some(map),
            _ => None,
        };
        ValidationRequest {
            pipeline_graph: graph,
            parameters,
        }
    }

    fn simple_graph() -> Graph {
        use crate::graph::{Edge, Node};
        Graph::new(
            vec![
                Node::element("0", "videotestsrc"),
                Node::element("1", "fakesink"),
            ],
            vec![Edge::new("0", "0", "1")],
        )
    }

    #[test]
    fn coerce_accepts_integers_and_numeric_strings() {
        assert_eq!(coerce_max_runtime(&json!(10)).unwrap(), 10);
        assert_eq!(coerce_max_runtime(&json!(10.7)).unwrap(), 10);
        assert_eq!(coerce_max_runtime(&json!("15")).unwrap(), 15);
        assert!(coerce_max_runtime(&json!("soon")).is_err());
        assert!(coerce_max_runtime(&json!(null)).is_err());
        assert!(coerce_max_runtime(&json!([1])).is_err());
    }

    #[tokio::test]
    async fn bad_max_runtime_is_rejected_before_any_job_exists() {
        let manager = ValidationJobManager::new(Resources::empty());

        let err = manager
            .submit(request_with_params(
                simple_graph(),
                json!({"max-runtime": "abc"}),
            ))
            .unwrap_err();
        assert!(matches!(err, JobError::MaxRuntimeNotInteger));

        let err = manager
            .submit(request_with_params(simple_graph(), json!({"max-runtime": 0})))
            .unwrap_err();
        assert!(matches!(err, JobError::MaxRuntimeTooSmall));

        assert!(manager.all_job_statuses().is_empty());
    }

    #[tokio::test]
    async fn describe_failure_is_returned_synchronously() {
        let manager = ValidationJobManager::new(Resources::empty());
        let err = manager
            .submit(request_with_params(Graph::default(), json!({})))
            .unwrap_err();
        assert!(matches!(err, JobError::Describe(_)));
        assert!(manager.all_job_statuses().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_ids_return_none() {
        let manager = ValidationJobManager::new(Resources::empty());
        assert!(manager.job_status("missing").is_none());
        assert!(manager.job_summary("missing").is_none());
    }

    #[test]
    fn job_state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&JobState::Running).unwrap(), "\"RUNNING\"");
        assert_eq!(serde_json::to_string(&JobState::Error).unwrap(), "\"ERROR\"");
    }
}
