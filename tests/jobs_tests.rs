//! Validation job manager integration tests

use std::time::Duration;

use pipelens::jobs::{JobState, ValidationJobManager, ValidationRequest};
use pipelens::resources::Resources;
use pipelens::Parser;
use serde_json::json;

const RUNNER_BIN: &str = env!("CARGO_BIN_EXE_pipeline-runner");

fn manager() -> ValidationJobManager {
    ValidationJobManager::new(Resources::empty()).with_runner_binary(RUNNER_BIN)
}

fn request(description: &str, max_runtime: serde_json::Value) -> ValidationRequest {
    let resources = Resources::empty();
    let graph = Parser::new(&resources).parse(description).unwrap();
    let parameters = json!({ "max-runtime": max_runtime });
    ValidationRequest {
        pipeline_graph: graph,
        parameters: match parameters {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        },
    }
}

/// Poll until the job leaves the RUNNING state.
async fn wait_for_completion(manager: &ValidationJobManager, job_id: &str) -> JobState {
    for _ in 0..300 {
        let status = manager.job_status(job_id).expect("job exists");
        if status.state != JobState::Running {
            return status.state;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("job {job_id} did not finish in time");
}

#[tokio::test]
async fn valid_pipeline_completes() {
    let manager = manager();
    let job_id = manager
        .submit(request("videotestsrc num-buffers=3 ! fakesink", json!(2)))
        .unwrap();

    let state = wait_for_completion(&manager, &job_id).await;
    assert_eq!(state, JobState::Completed);

    let status = manager.job_status(&job_id).unwrap();
    assert_eq!(status.is_valid, Some(true));
    assert!(status.error_message.is_none());
    assert!(status.elapsed_time >= 0);
}

#[tokio::test]
async fn invalid_pipeline_ends_in_error_state_with_messages() {
    let manager = manager();
    let job_id = manager
        .submit(request("nosuchelement ! fakesink", json!(2)))
        .unwrap();

    let state = wait_for_completion(&manager, &job_id).await;
    assert_eq!(state, JobState::Error);

    let status = manager.job_status(&job_id).unwrap();
    assert_eq!(status.is_valid, Some(false));
    let errors = status.error_message.expect("captured errors");
    assert!(
        errors.iter().any(|e| e.contains("no element")),
        "errors: {errors:?}"
    );
}

#[tokio::test]
async fn max_runtime_accepts_numeric_strings() {
    let manager = manager();
    let job_id = manager
        .submit(request("videotestsrc num-buffers=3 ! fakesink", json!("2")))
        .unwrap();
    let state = wait_for_completion(&manager, &job_id).await;
    assert_eq!(state, JobState::Completed);
}

#[tokio::test]
async fn summary_returns_the_original_request() {
    let manager = manager();
    let req = request("videotestsrc num-buffers=3 ! fakesink", json!(2));
    let graph = req.pipeline_graph.clone();
    let job_id = manager.submit(req).unwrap();

    let summary = manager.job_summary(&job_id).expect("summary exists");
    assert_eq!(summary.id, job_id);
    assert_eq!(summary.request.pipeline_graph, graph);

    wait_for_completion(&manager, &job_id).await;
}

#[tokio::test]
async fn statuses_list_all_jobs() {
    let manager = manager();
    let a = manager
        .submit(request("videotestsrc num-buffers=3 ! fakesink", json!(2)))
        .unwrap();
    let b = manager
        .submit(request("videotestsrc num-buffers=5 ! fakesink", json!(2)))
        .unwrap();

    let statuses = manager.all_job_statuses();
    assert_eq!(statuses.len(), 2);
    let ids: Vec<&str> = statuses.iter().map(|s| s.id.as_str()).collect();
    assert!(ids.contains(&a.as_str()));
    assert!(ids.contains(&b.as_str()));

    wait_for_completion(&manager, &a).await;
    wait_for_completion(&manager, &b).await;
}
