use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::StatusCode;
use tokio::process::Command;

use crate::config::ExecutionConfig;
use crate::coordinator::Coordinator;
use crate::drone::InFlight;
use crate::error::ExecuteError;
use crate::model::{LogEntry, SubmitTask, Task, TaskResult};
use crate::worker::deploy::{is_file, Deployment, DeploymentCache};

/// What happened to a task that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: i64,
    pub result: i32,
    pub verification: i64,
    /// Log entries the coordinator accepted a request for
    pub logs_emitted: usize,
    /// Follow-up tasks the coordinator accepted a request for
    pub tasks_submitted: usize,
    pub release_status: StatusCode,
    pub elapsed: Duration,
}

/// Runs leased tasks for one execution context.
///
/// A task runs as `./run <task-json> <project-secret>` inside the project
/// checkout. Its stdout must be a single [`TaskResult`] document. On a
/// well-formed result the executor, in order:
/// 1. emits every log entry of the result,
/// 2. submits every follow-up task,
/// 3. releases the task with the result code and verification.
///
/// A failing hook is logged and never prevents the following ones. Errors
/// before the release (deployment, missing `run`, malformed output, time
/// limit) leave the task leased; releasing it is the caller's job.
///
/// With an in-flight set attached, the task leaves it right before the
/// release request is sent, so nobody else releases it again.
pub struct TaskExecutor {
    coordinator: Arc<dyn Coordinator>,
    cache: DeploymentCache,
    config: ExecutionConfig,
    in_flight: Option<Arc<InFlight>>,
}

impl TaskExecutor {
    pub fn new(
        context_name: impl Into<String>,
        config: ExecutionConfig,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        let cache = DeploymentCache::new(context_name, config.clone(), coordinator.clone());
        Self {
            coordinator,
            cache,
            config,
            in_flight: None,
        }
    }

    pub fn with_in_flight(mut self, in_flight: Arc<InFlight>) -> Self {
        self.in_flight = Some(in_flight);
        self
    }

    pub fn cache(&self) -> &DeploymentCache {
        &self.cache
    }

    /// Deploy the task's project if needed, run the recipe and apply its result.
    pub async fn execute(&mut self, task: &Task) -> Result<TaskOutcome, ExecuteError> {
        let started = Instant::now();
        tracing::info!(
            context = %self.cache.context_name(),
            task_id = task.id,
            project_id = task.project.id,
            "Executing task"
        );

        let deployment = self.cache.ensure(&task.project).await?;
        let result = self.run_recipe(task, &deployment).await?;
        let mut outcome = self.apply_result(task, result).await?;
        outcome.elapsed = started.elapsed();

        tracing::info!(
            task_id = outcome.task_id,
            result = outcome.result,
            release_status = %outcome.release_status,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Task completed"
        );
        Ok(outcome)
    }

    fn time_limit(&self, task: &Task) -> Option<Duration> {
        if self.config.enforce_time_limit && task.max_assign_time > 0 {
            Some(Duration::from_secs(task.max_assign_time as u64))
        } else {
            None
        }
    }

    async fn run_recipe(
        &self,
        task: &Task,
        deployment: &Deployment,
    ) -> Result<TaskResult, ExecuteError> {
        let run = deployment.path.join("run");
        if !is_file(&run).await {
            return Err(ExecuteError::MissingExecutable(run));
        }

        let argument = task.to_recipe_argument().map_err(ExecuteError::Encode)?;
        let mut command = Command::new(&run);
        command
            .arg(argument)
            .arg(&deployment.secret)
            .current_dir(&deployment.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match self.time_limit(task) {
            // Dropping the timed out future kills the child
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| ExecuteError::TimedOut(limit.as_secs()))?,
            None => command.output().await,
        }
        .map_err(ExecuteError::Spawn)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            tracing::warn!(
                task_id = task.id,
                status = %output.status,
                stderr = %stderr.trim(),
                "Recipe exited unsuccessfully"
            );
        }

        TaskResult::parse(&stdout).map_err(|e| {
            tracing::error!(
                task_id = task.id,
                project_id = task.project.id,
                error = %e,
                stdout = %stdout.trim(),
                stderr = %stderr.trim(),
                "Recipe produced malformed output"
            );
            ExecuteError::MalformedOutput(e)
        })
    }

    /// Apply the post-task hooks of a recipe result and release the task.
    pub async fn apply_result(
        &self,
        task: &Task,
        result: TaskResult,
    ) -> Result<TaskOutcome, ExecuteError> {
        let now = Utc::now().timestamp();
        let mut logs_emitted = 0;
        for entry in &result.logs {
            if self.emit_log(task, entry, now).await {
                logs_emitted += 1;
            }
        }

        let mut tasks_submitted = 0;
        for follow_up in &result.tasks {
            let submission = SubmitTask::from(follow_up.clone());
            match self.coordinator.submit_task(&submission).await {
                Ok(status) => {
                    tracing::debug!(task_id = task.id, project_id = submission.project, status = %status, "Follow-up task submitted");
                    tasks_submitted += 1;
                }
                Err(e) => {
                    tracing::warn!(task_id = task.id, project_id = submission.project, error = %e, "Failed to submit follow-up task");
                }
            }
        }

        let verification = result.verification_or_default();
        if let Some(in_flight) = &self.in_flight {
            in_flight.remove(task.id);
        }
        let release_status = self
            .coordinator
            .release_task(task.id, result.result, verification)
            .await
            .map_err(|e| {
                tracing::error!(task_id = task.id, error = %e, "Failed to release task");
                ExecuteError::Release(e)
            })?;
        if !release_status.is_success() {
            tracing::warn!(task_id = task.id, status = %release_status, "Coordinator refused release");
        }

        Ok(TaskOutcome {
            task_id: task.id,
            result: result.result,
            verification,
            logs_emitted,
            tasks_submitted,
            release_status,
            elapsed: Duration::ZERO,
        })
    }

    async fn emit_log(&self, task: &Task, entry: &LogEntry, now: i64) -> bool {
        let level = match entry.level_or_default() {
            Ok(level) => level,
            Err(raw) => {
                tracing::warn!(task_id = task.id, level = %raw, message = %entry.message, "Skipping log with unsupported level");
                return false;
            }
        };
        match self
            .coordinator
            .emit_log(
                level,
                &entry.message,
                entry.timestamp_or(now),
                entry.scope_or_default(),
            )
            .await
        {
            Ok(status) => {
                tracing::debug!(task_id = task.id, status = %status, message = %entry.message, "Log submitted");
                true
            }
            Err(e) => {
                tracing::warn!(task_id = task.id, error = %e, message = %entry.message, "Failed to submit log");
                false
            }
        }
    }
}
