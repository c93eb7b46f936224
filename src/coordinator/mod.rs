//! Everything that talks to the task-tracker coordinator.
//!
//! - [`Coordinator`]: the authenticated operations the drone relies on. The
//!   HTTP client implements it; tests plug in an in-memory fake.
//! - [`CoordinatorClient`]: signed HTTP client with the two-tier retry policy
//!   described on [`RetryPolicy`](crate::config::RetryPolicy).
//! - [`signing`]: timestamp and HMAC helpers shared by the client and tests.

pub mod client;
pub mod signing;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::ClientError;
use crate::model::{Project, SubmitTask, Task};

pub use client::CoordinatorClient;

/// Authenticated coordinator operations.
///
/// Calls that only report something back (submit, release, log, access
/// request) hand the raw HTTP status to the caller, which decides whether a
/// non-success status is worth a warning.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Projects visible to this worker, in coordinator order.
    async fn list_projects(&self) -> Result<Vec<Project>, ClientError>;

    /// Lease the next task of a project. `Ok(None)` means nothing is available.
    async fn lease_task(&self, project_id: i64) -> Result<Option<Task>, ClientError>;

    async fn submit_task(&self, task: &SubmitTask) -> Result<StatusCode, ClientError>;

    async fn release_task(
        &self,
        task_id: i64,
        result: i32,
        verification: i64,
    ) -> Result<StatusCode, ClientError>;

    /// Submit a log line. `level` is the coordinator's numeric level; levels
    /// without an endpoint are rejected without a network call.
    async fn emit_log(
        &self,
        level: u8,
        message: &str,
        timestamp: i64,
        scope: &str,
    ) -> Result<StatusCode, ClientError>;

    async fn request_project_access(
        &self,
        project_id: i64,
        assign: bool,
        submit: bool,
    ) -> Result<StatusCode, ClientError>;

    /// Per-worker secret of a project, handed to its recipes.
    async fn fetch_project_secret(&self, project_id: i64) -> Result<String, ClientError>;
}

/// Response envelope used by every coordinator endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub content: Option<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TaskContent {
    pub task: Task,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProjectsContent {
    #[serde(default)]
    pub projects: Vec<Project>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SecretContent {
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WorkerContent {
    pub worker: RegisteredWorker,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RegisteredWorker {
    pub id: i64,
    pub alias: String,
    pub secret: String,
}
