
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::TempDir;
use test_harness::{test_task, FakeCoordinator, FixtureRepo, Release, PROJECT_SECRET};
use tt_drone::config::ExecutionConfig;
use tt_drone::coordinator::Coordinator;
use tt_drone::drone::InFlight;
use tt_drone::error::{DeployError, ExecuteError};
use tt_drone::model::{Project, TaskResult, DEFAULT_LOG_SCOPE};
use tt_drone::worker::TaskExecutor;

/// Create an executor for one context working under a scratch directory
fn test_executor(project: &Project) -> (TaskExecutor, Arc<FakeCoordinator>, TempDir) {
    let work_dir = TempDir::new().unwrap();
    let coordinator = FakeCoordinator::new(vec![project.clone()]);
    let config = ExecutionConfig {
        work_dir: work_dir.path().to_path_buf(),
        ..Default::default()
    };
    let executor = TaskExecutor::new("drone_0", config, coordinator.clone());
    (executor, coordinator, work_dir)
}

#[tokio::test]
async fn test_result_log_and_release() {
    let repo = FixtureRepo::with_run_output(
        r#"{"result":0,"verification":1,"logs":[{"message":"ok"}]}"#,
    );
    let project = repo.project(1, "");
    let (mut executor, coordinator, _work_dir) = test_executor(&project);

    let outcome = executor.execute(&test_task(42, project)).await.unwrap();

    assert_eq!(outcome.task_id, 42);
    assert_eq!(outcome.result, 0);
    assert_eq!(outcome.verification, 1);
    assert_eq!(outcome.logs_emitted, 1);

    let logs = coordinator.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, 7);
    assert_eq!(logs[0].message, "ok");
    assert_eq!(logs[0].scope, DEFAULT_LOG_SCOPE);
    assert!(logs[0].timestamp > 0);

    assert_eq!(
        coordinator.releases(),
        vec![Release {
            task_id: 42,
            result: 0,
            verification: 1
        }]
    );
}

#[tokio::test]
async fn test_missing_run_does_not_release() {
    let repo = FixtureRepo::new();
    repo.write_file("README", "no recipe here");
    repo.commit("init");
    let project = repo.project(1, "");
    let (mut executor, coordinator, _work_dir) = test_executor(&project);

    let err = executor.execute(&test_task(7, project)).await.unwrap_err();

    assert!(matches!(err, ExecuteError::MissingExecutable(ref path) if path.ends_with("run")));
    assert!(err.requires_failed_release());
    assert!(coordinator.release_attempts().is_empty());
    assert!(coordinator.logs().is_empty());
}

#[tokio::test]
async fn test_recipe_receives_task_and_secret() {
    let repo = FixtureRepo::new();
    repo.write_script(
        "run",
        r#"printf '%s' "$1" > task.json
printf '%s' "$2" > secret.txt
echo '{"result":0}'"#,
    );
    repo.commit("run");
    let project = repo.project(3, "");
    let (mut executor, _coordinator, _work_dir) = test_executor(&project);

    let mut task = test_task(11, project.clone());
    task.recipe = "payload".to_string();
    executor.execute(&task).await.unwrap();

    let checkout = executor.cache().get(3).unwrap().path.clone();
    let secret = std::fs::read_to_string(checkout.join("secret.txt")).unwrap();
    assert_eq!(secret, PROJECT_SECRET);

    let argument: Value =
        serde_json::from_str(&std::fs::read_to_string(checkout.join("task.json")).unwrap())
            .unwrap();
    assert_eq!(argument["id"], 11);
    assert_eq!(argument["recipe"], "payload");
    let embedded: Value = serde_json::from_str(argument["project"].as_str().unwrap()).unwrap();
    assert_eq!(embedded["id"], 3);
}

#[tokio::test]
async fn test_malformed_output_is_an_error() {
    let repo = FixtureRepo::with_run_output("this is not json");
    let project = repo.project(1, "");
    let (mut executor, coordinator, _work_dir) = test_executor(&project);

    let err = executor.execute(&test_task(5, project)).await.unwrap_err();

    assert!(matches!(err, ExecuteError::MalformedOutput(_)));
    assert!(err.requires_failed_release());
    assert!(coordinator.release_attempts().is_empty());
}

#[tokio::test]
async fn test_non_zero_exit_still_applies_result() {
    let repo = FixtureRepo::new();
    repo.write_script("run", "echo '{\"result\":1}'\necho 'boom' >&2\nexit 3");
    repo.commit("run");
    let project = repo.project(1, "");
    let (mut executor, coordinator, _work_dir) = test_executor(&project);

    let outcome = executor.execute(&test_task(8, project)).await.unwrap();

    assert_eq!(outcome.result, 1);
    assert_eq!(
        coordinator.releases(),
        vec![Release {
            task_id: 8,
            result: 1,
            verification: 0
        }]
    );
}

#[tokio::test]
async fn test_time_limit_kills_recipe() {
    let repo = FixtureRepo::new();
    repo.write_script("run", "exec sleep 30");
    repo.commit("run");
    let project = repo.project(1, "");
    let (mut executor, coordinator, _work_dir) = test_executor(&project);

    let mut task = test_task(9, project);
    task.max_assign_time = 1;

    let started = Instant::now();
    let err = executor.execute(&task).await.unwrap_err();

    assert!(matches!(err, ExecuteError::TimedOut(1)));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(coordinator.release_attempts().is_empty());
}

#[tokio::test]
async fn test_follow_up_tasks_use_submission_defaults() {
    let repo = FixtureRepo::with_run_output(
        r#"{"result":0,"tasks":[{"project":2,"recipe":"next"},{"project":3,"recipe":"other","priority":9,"hash64":77,"unique_str":"u"}]}"#,
    );
    let project = repo.project(1, "");
    let (mut executor, coordinator, _work_dir) = test_executor(&project);

    let outcome = executor.execute(&test_task(4, project)).await.unwrap();
    assert_eq!(outcome.tasks_submitted, 2);

    let submissions = coordinator.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].project, 2);
    assert_eq!(submissions[0].recipe, "next");
    assert_eq!(submissions[0].priority, 1);
    assert_eq!(submissions[0].max_assign_time, 3600);
    assert_eq!(submissions[0].verification_count, 1);
    assert_eq!(submissions[0].max_retries, 3);
    assert_eq!(submissions[1].priority, 9);
    assert_eq!(submissions[1].hash64, 77);
    assert_eq!(submissions[1].unique_str, "u");

    assert_eq!(coordinator.releases().len(), 1);
}

#[tokio::test]
async fn test_failing_log_does_not_block_later_hooks() {
    let repo = FixtureRepo::with_run_output("{}");
    let project = repo.project(1, "");
    let (executor, coordinator, _work_dir) = test_executor(&project);

    // Level 2 (panic) has no coordinator endpoint
    let result = TaskResult::parse(
        r#"{"result":0,"logs":[{"level":2,"message":"lost"},{"level":4,"message":"kept","scope":"custom","timestamp":1000}],"tasks":[{"project":1,"recipe":"r"}]}"#,
    )
    .unwrap();
    let outcome = executor
        .apply_result(&test_task(6, project), result)
        .await
        .unwrap();

    assert_eq!(outcome.logs_emitted, 1);
    assert_eq!(outcome.tasks_submitted, 1);

    let logs = coordinator.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "kept");
    assert_eq!(logs[0].level, 4);
    assert_eq!(logs[0].scope, "custom");
    assert_eq!(logs[0].timestamp, 1000);
    assert_eq!(coordinator.releases().len(), 1);
}

#[tokio::test]
async fn test_release_failure_is_not_retried_as_failed() {
    let repo = FixtureRepo::with_run_output(r#"{"result":0}"#);
    let project = repo.project(1, "");
    let (mut executor, coordinator, _work_dir) = test_executor(&project);
    coordinator.set_fail_releases(true);

    let err = executor.execute(&test_task(10, project)).await.unwrap_err();

    assert!(matches!(err, ExecuteError::Release(_)));
    assert!(!err.requires_failed_release());
    assert_eq!(coordinator.release_attempts().len(), 1);
}

#[tokio::test]
async fn test_deploy_failure_surfaces_as_execute_error() {
    let project = test_harness::test_project(1, "/nonexistent/repository", "");
    let (mut executor, coordinator, _work_dir) = test_executor(&project);

    let err = executor.execute(&test_task(12, project)).await.unwrap_err();

    assert!(matches!(
        err,
        ExecuteError::Deploy(DeployError::CommandFailed { ref command, .. }) if command == "git clone"
    ));
    assert!(err.requires_failed_release());
    assert!(coordinator.release_attempts().is_empty());
}

#[tokio::test]
async fn test_bad_log_entry_keeps_the_result() {
    let repo = FixtureRepo::with_run_output(
        r#"{"result":0,"verification":1,"logs":[{"level":300,"message":"x"},{"level":"info","message":"y"},{"message":"ok","timestamp":1700000000.5}],"tasks":[{"project":2,"recipe":"r"}]}"#,
    );
    let project = repo.project(1, "");
    let (mut executor, coordinator, _work_dir) = test_executor(&project);

    let outcome = executor.execute(&test_task(13, project)).await.unwrap();

    assert_eq!(outcome.logs_emitted, 1);
    assert_eq!(outcome.tasks_submitted, 1);

    let logs = coordinator.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "ok");
    assert_eq!(logs[0].timestamp, 1_700_000_000);
    assert_eq!(coordinator.submissions()[0].project, 2);
    assert_eq!(
        coordinator.releases(),
        vec![Release {
            task_id: 13,
            result: 0,
            verification: 1
        }]
    );
}

#[tokio::test]
async fn test_task_leaves_in_flight_before_release() {
    let repo = FixtureRepo::with_run_output(r#"{"result":0}"#);
    let project = repo.project(1, "");
    let (executor, coordinator, _work_dir) = test_executor(&project);
    let in_flight = Arc::new(InFlight::new());
    let mut executor = executor.with_in_flight(in_flight.clone());
    coordinator.watch_in_flight(in_flight.clone());

    // Mirror what an execution context does once the lease succeeds
    coordinator.push_task(test_task(14, project));
    let task = coordinator.lease_task(1).await.unwrap().unwrap();
    in_flight.insert(task.id);

    executor.execute(&task).await.unwrap();

    assert!(in_flight.is_empty());
    assert_eq!(coordinator.release_attempts().len(), 1);
    assert!(coordinator.violations().is_empty(), "{:?}", coordinator.violations());
}
