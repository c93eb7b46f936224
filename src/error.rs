use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Errors raised while talking to the coordinator.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Coordinator unreachable after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Still rate limited after {waits} waits")]
    RateLimited { waits: u32 },

    #[error("Unsupported log level {0}")]
    UnsupportedLogLevel(u8),

    #[error("Request requires a worker identity")]
    Unauthenticated,

    #[error("Registration rejected ({status}): {message}")]
    RegistrationRejected { status: StatusCode, message: String },

    #[error("Unexpected status {status} from {endpoint}")]
    UnexpectedStatus {
        endpoint: String,
        status: StatusCode,
    },

    #[error("Malformed response from {endpoint}: {reason}")]
    MalformedResponse { endpoint: String, reason: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised while materializing a project checkout.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Failed to fetch secret for project {project_id}: {source}")]
    Secret {
        project_id: i64,
        #[source]
        source: ClientError,
    },

    #[error("Filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Errors raised while running a leased task.
#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("Deployment failed: {0}")]
    Deploy(#[from] DeployError),

    #[error("{0} doesn't exist")]
    MissingExecutable(PathBuf),

    #[error("Failed to spawn recipe: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Recipe exceeded its {0}s time limit")]
    TimedOut(u64),

    #[error("Malformed recipe output: {0}")]
    MalformedOutput(#[source] serde_json::Error),

    #[error("Failed to encode task: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Release failed: {0}")]
    Release(#[source] ClientError),
}

impl ExecuteError {
    /// Failed-release rule: every execution error leaves the task leased on
    /// the coordinator and must be released as failed by the caller, except a
    /// failed release call itself, which has already been attempted with the
    /// recipe's own result.
    pub fn requires_failed_release(&self) -> bool {
        !matches!(self, ExecuteError::Release(_))
    }
}

/// Errors raised by the credential store.
#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Failed to access credentials at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid credentials file {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Errors that stop the drone from starting.
#[derive(Error, Debug)]
pub enum DroneError {
    #[error("Coordinator error: {0}")]
    Client(#[from] ClientError),

    #[error("Credentials error: {0}")]
    Credentials(#[from] CredentialsError),
}

pub type Result<T> = std::result::Result<T, DroneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_failure_does_not_require_another_release() {
        let err = ExecuteError::Release(ClientError::Unauthenticated);
        assert!(!err.requires_failed_release());
    }

    #[test]
    fn execution_failures_require_failed_release() {
        let malformed = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let errors = [
            ExecuteError::MissingExecutable(PathBuf::from("work/main/7_v1/run")),
            ExecuteError::MalformedOutput(malformed),
            ExecuteError::TimedOut(30),
            ExecuteError::Deploy(DeployError::CommandFailed {
                command: "git clone".to_string(),
                status: "exit status: 128".to_string(),
                stderr: "fatal: repository not found".to_string(),
            }),
        ];
        for err in errors {
            assert!(err.requires_failed_release(), "{err}");
        }
    }
}
