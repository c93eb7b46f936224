use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;
use crate::drone::in_flight::InFlight;
use crate::drone::release_failed;
use crate::model::{Project, Task};
use crate::worker::TaskExecutor;

/// One lease/execute/release loop.
pub(crate) struct ExecutionContext {
    name: String,
    coordinator: Arc<dyn Coordinator>,
    executor: TaskExecutor,
    in_flight: Arc<InFlight>,
    idle_backoff: Duration,
}

impl ExecutionContext {
    pub(crate) fn new(
        name: String,
        coordinator: Arc<dyn Coordinator>,
        executor: TaskExecutor,
        in_flight: Arc<InFlight>,
        idle_backoff: Duration,
    ) -> Self {
        Self {
            name,
            coordinator,
            executor,
            in_flight,
            idle_backoff,
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Shutdown is checked before each pass over the project list, so a task
    /// that was already leased is executed and released before the loop exits.
    /// Only the idle backoff is cut short by a shutdown request.
    pub(crate) async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(context = %self.name, "Execution context started");

        let mut projects: Vec<Project> = Vec::new();
        while !shutdown.is_cancelled() {
            if projects.is_empty() {
                projects = self.load_projects().await;
            }

            if !self.run_pass(&projects).await {
                tracing::debug!(context = %self.name, "No tasks, waiting");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_backoff) => {}
                }
            }
        }

        tracing::info!(context = %self.name, "Execution context stopped");
    }

    /// Fetch the project list, most preferred first. Empty on failure.
    async fn load_projects(&self) -> Vec<Project> {
        match self.coordinator.list_projects().await {
            Ok(mut projects) => {
                Project::sort_by_priority(&mut projects);
                tracing::info!(
                    context = %self.name,
                    projects = ?projects.iter().map(|p| p.id).collect::<Vec<_>>(),
                    "Loaded project list"
                );
                projects
            }
            Err(e) => {
                tracing::warn!(context = %self.name, error = %e, "Failed to list projects");
                Vec::new()
            }
        }
    }

    /// Try each project in priority order and run the first task leased.
    /// Returns whether a task was run.
    async fn run_pass(&mut self, projects: &[Project]) -> bool {
        for project in projects {
            match self.coordinator.lease_task(project.id).await {
                Ok(Some(task)) => {
                    self.run_task(task).await;
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        context = %self.name,
                        project_id = project.id,
                        error = %e,
                        "Lease attempt failed"
                    );
                }
            }
        }
        false
    }

    async fn run_task(&mut self, task: Task) {
        self.in_flight.insert(task.id);

        if let Err(e) = self.executor.execute(&task).await {
            tracing::error!(
                context = %self.name,
                task_id = task.id,
                project_id = task.project.id,
                error = %e,
                "Task execution failed"
            );
            if e.requires_failed_release() {
                self.in_flight.remove(task.id);
                release_failed(self.coordinator.as_ref(), task.id).await;
            }
        }

        // Already gone unless the task never reached a release attempt
        self.in_flight.remove(task.id);
    }
}
