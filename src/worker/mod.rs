//! Task execution for a single execution context.
//!
//! - **Deployment**: [`DeploymentCache`] keeps one checkout per project,
//!   cloned with git and prepared by the project's optional `setup` script.
//! - **Execution**: [`TaskExecutor`] runs the project's `run` executable for a
//!   leased task and applies the result it prints.
//!
//! # Execution Flow
//!
//! 1. The drone leases a task and hands it to [`TaskExecutor::execute`]
//! 2. [`DeploymentCache::ensure`] clones/checks out the project version if needed
//! 3. `run <task-json> <secret>` is spawned in the checkout, stdout captured
//! 4. Log entries and follow-up tasks from the result are submitted
//! 5. The task is released with the recipe's result code

pub mod deploy;
pub mod executor;

pub use deploy::{Deployment, DeploymentCache};
pub use executor::{TaskExecutor, TaskOutcome};
