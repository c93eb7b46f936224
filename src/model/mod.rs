//! Data exchanged with the coordinator and with recipe executables.
//!
//! - [`Project`] and [`Task`] are decoded from coordinator responses.
//! - [`TaskResult`] is decoded from the stdout of a recipe's `run` executable.
//! - [`SubmitTask`] is the body of a task submission, with the client defaults
//!   applied to every field a follow-up task leaves out.

pub mod result;
pub mod task;

pub use result::{FollowUpTask, LogEntry, LogLevel, SubmitTask, TaskResult, DEFAULT_LOG_SCOPE};
pub use task::{Project, Task};
