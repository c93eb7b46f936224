//! The drone supervisor.
//!
//! A [`Drone`] runs a fixed number of execution contexts, each an independent
//! lease/execute/release loop with its own deployment cache. The contexts
//! share one [`InFlight`] set so that whatever they were working on when the
//! process is asked to stop can be released as failed instead of waiting for
//! the coordinator's lease timeout. A task leaves the set just before its
//! first release request, so a context aborted mid-release is not released
//! a second time.
//!
//! # Shutdown
//!
//! 1. The shutdown token is cancelled (SIGINT/SIGTERM in the binary)
//! 2. Every context finishes its current task and exits; idle ones wake up
//! 3. Contexts still running when the grace period elapses, or when the
//!    force token is cancelled (a second signal in the binary), are aborted,
//!    which kills their child processes
//! 4. Every id left in the in-flight set is released with [`RESULT_FAILED`]

pub mod bootstrap;
mod context;
pub mod in_flight;

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::DroneConfig;
use crate::coordinator::Coordinator;
use crate::worker::TaskExecutor;
use context::ExecutionContext;

pub use bootstrap::{load_or_register, request_access_to_all, Bootstrap};
pub use in_flight::InFlight;

/// Result code for tasks released by the drone itself.
pub const RESULT_FAILED: i32 = 2;

/// What the shutdown protocol did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks released as failed
    pub released: Vec<i64>,
    /// Tasks whose release call errored
    pub release_errors: Vec<i64>,
    /// Contexts aborted after the grace period or a forced shutdown
    pub aborted_contexts: usize,
}

pub struct Drone {
    config: DroneConfig,
    coordinator: Arc<dyn Coordinator>,
    in_flight: Arc<InFlight>,
    force_shutdown: CancellationToken,
}

impl Drone {
    pub fn new(config: DroneConfig, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            config,
            coordinator,
            in_flight: Arc::new(InFlight::new()),
            force_shutdown: CancellationToken::new(),
        }
    }

    /// Once shutting down, abort every context as soon as `force` is
    /// cancelled instead of waiting for the grace period.
    pub fn with_force_shutdown(mut self, force: CancellationToken) -> Self {
        self.force_shutdown = force;
        self
    }

    pub fn config(&self) -> &DroneConfig {
        &self.config
    }

    /// The set of tasks currently executing.
    pub fn in_flight(&self) -> Arc<InFlight> {
        self.in_flight.clone()
    }

    /// Run every execution context until `shutdown` is cancelled, then release
    /// the tasks left in flight.
    pub async fn run(&self, shutdown: CancellationToken) -> ShutdownReport {
        let mut contexts = JoinSet::new();
        for index in 0..self.config.contexts {
            let name = self.config.context_name(index);
            let executor = TaskExecutor::new(
                name.clone(),
                self.config.execution.clone(),
                self.coordinator.clone(),
            )
            .with_in_flight(self.in_flight.clone());
            let context = ExecutionContext::new(
                name,
                self.coordinator.clone(),
                executor,
                self.in_flight.clone(),
                self.config.idle_backoff,
            );
            contexts.spawn(context.run(shutdown.clone()));
        }
        tracing::info!(
            alias = %self.config.alias,
            contexts = self.config.contexts,
            "Drone started"
        );

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = self.force_shutdown.cancelled() => {}
        }
        tracing::info!(
            in_flight = ?self.in_flight.snapshot(),
            "Shutting down, waiting for execution contexts"
        );

        let aborted_contexts = self.join_contexts(&mut contexts).await;
        let mut report = self.release_in_flight().await;
        report.aborted_contexts = aborted_contexts;

        tracing::info!(
            released = ?report.released,
            release_errors = ?report.release_errors,
            aborted_contexts = report.aborted_contexts,
            "Drone stopped"
        );
        report
    }

    /// Wait for every context to exit. Returns how many had to be aborted.
    async fn join_contexts(&self, contexts: &mut JoinSet<()>) -> usize {
        let grace = self.config.shutdown_grace;
        let grace_elapsed = async move {
            match grace {
                Some(grace) => tokio::time::sleep(grace).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(grace_elapsed);

        let reason = loop {
            tokio::select! {
                joined = contexts.join_next() => match joined {
                    None => return 0,
                    Some(Err(e)) if e.is_panic() => {
                        tracing::error!(error = %e, "Execution context panicked");
                    }
                    Some(_) => {}
                },
                _ = &mut grace_elapsed => break "grace period elapsed",
                _ = self.force_shutdown.cancelled() => break "forced shutdown",
            }
        };

        let remaining = contexts.len();
        tracing::warn!(remaining, reason, "Aborting execution contexts");
        contexts.abort_all();
        while contexts.join_next().await.is_some() {}
        remaining
    }

    /// Release every task still in flight as failed.
    pub async fn release_in_flight(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        for task_id in self.in_flight.snapshot() {
            self.in_flight.remove(task_id);
            if release_failed(self.coordinator.as_ref(), task_id).await {
                report.released.push(task_id);
            } else {
                report.release_errors.push(task_id);
            }
        }
        report
    }
}

/// Release a task with [`RESULT_FAILED`] and no verification. Returns whether
/// the coordinator was reached.
pub(crate) async fn release_failed(coordinator: &dyn Coordinator, task_id: i64) -> bool {
    match coordinator.release_task(task_id, RESULT_FAILED, 0).await {
        Ok(status) => {
            if status.is_success() {
                tracing::info!(task_id, "Released task as failed");
            } else {
                tracing::warn!(task_id, status = %status, "Coordinator refused failed release");
            }
            true
        }
        Err(e) => {
            tracing::error!(task_id, error = %e, "Failed to release task");
            false
        }
    }
}
