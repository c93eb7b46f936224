use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_COORDINATOR_URL: &str = "https://tt.simon987.net/api";

/// Retry behaviour of the coordinator client.
///
/// Two independent tiers:
/// - **Network tier**: transport failures (connect, timeout, reset) are retried
///   immediately, at most `max_attempts` times in total.
/// - **Rate-limit tier**: an HTTP 429 carries a `rate_limit_delay` in seconds.
///   The client sleeps `rate_limit_scale * rate_limit_delay` and sends the same
///   request again. These waits never consume network attempts and are
///   unbounded unless `max_rate_limit_waits` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub rate_limit_scale: f64,
    pub max_rate_limit_waits: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_scale: 20.0,
            max_rate_limit_waits: None,
        }
    }
}

impl RetryPolicy {
    /// How long to back off for a server-supplied `rate_limit_delay`.
    pub fn rate_limit_backoff(&self, rate_limit_delay: f64) -> Duration {
        Duration::from_secs_f64((rate_limit_delay * self.rate_limit_scale).max(0.0))
    }
}

/// Configuration for the coordinator HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL, without trailing slash (e.g. "https://tt.simon987.net/api")
    pub base_url: String,
    /// Timeout applied to every individual HTTP request
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_COORDINATOR_URL.to_string(),
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            user_agent: format!("tt_drone/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// How recipes and setup scripts are run.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Root directory that holds one sub-directory per execution context
    pub work_dir: PathBuf,
    /// Kill `run` once the task's `max_assign_time` has elapsed
    pub enforce_time_limit: bool,
    /// Treat a non-zero `setup` exit as a deployment failure
    pub fail_on_setup_error: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
            enforce_time_limit: true,
            fail_on_setup_error: true,
        }
    }
}

/// Configuration of the drone supervisor.
#[derive(Debug, Clone)]
pub struct DroneConfig {
    /// Prefix for execution context names (`{alias}_{index}`)
    pub alias: String,
    /// Number of concurrent execution contexts
    pub contexts: usize,
    /// Sleep between passes that found no task
    pub idle_backoff: Duration,
    /// Upper bound on waiting for contexts at shutdown; `None` waits forever
    pub shutdown_grace: Option<Duration>,
    pub execution: ExecutionConfig,
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            alias: "drone".to_string(),
            contexts: 10,
            idle_backoff: Duration::from_secs(10),
            shutdown_grace: None,
            execution: ExecutionConfig::default(),
        }
    }
}

impl DroneConfig {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            ..Default::default()
        }
    }

    pub fn with_contexts(mut self, contexts: usize) -> Self {
        self.contexts = contexts;
        self
    }

    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.execution.work_dir = work_dir.into();
        self
    }

    /// Name of the execution context with the given index.
    pub fn context_name(&self, index: usize) -> String {
        format!("{}_{}", self.alias, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.rate_limit_scale, 20.0);
        assert!(policy.max_rate_limit_waits.is_none());
    }

    #[test]
    fn rate_limit_backoff_is_scaled_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.rate_limit_backoff(1.0), Duration::from_secs(20));
        assert_eq!(policy.rate_limit_backoff(0.5), Duration::from_secs(10));
        assert_eq!(policy.rate_limit_backoff(0.0), Duration::ZERO);
        assert_eq!(policy.rate_limit_backoff(0.005), Duration::from_millis(100));
    }

    #[test]
    fn rate_limit_backoff_ignores_negative_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.rate_limit_backoff(-3.0), Duration::ZERO);
    }

    #[test]
    fn client_config_default() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.base_url, DEFAULT_COORDINATOR_URL);
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert!(cfg.user_agent.starts_with("tt_drone/"));
    }

    #[test]
    fn client_config_new_strips_trailing_slash() {
        let cfg = ClientConfig::new("http://127.0.0.1:42901/");
        assert_eq!(cfg.base_url, "http://127.0.0.1:42901");
    }

    #[test]
    fn execution_config_default() {
        let cfg = ExecutionConfig::default();
        assert_eq!(cfg.work_dir, PathBuf::from("work"));
        assert!(cfg.enforce_time_limit);
        assert!(cfg.fail_on_setup_error);
    }

    #[test]
    fn drone_config_default() {
        let cfg = DroneConfig::default();
        assert_eq!(cfg.alias, "drone");
        assert_eq!(cfg.contexts, 10);
        assert_eq!(cfg.idle_backoff, Duration::from_secs(10));
        assert!(cfg.shutdown_grace.is_none());
    }

    #[test]
    fn drone_config_builders() {
        let cfg = DroneConfig::new("edge")
            .with_contexts(4)
            .with_idle_backoff(Duration::from_millis(50))
            .with_shutdown_grace(Duration::from_secs(1))
            .with_work_dir("/tmp/drone");
        assert_eq!(cfg.contexts, 4);
        assert_eq!(cfg.idle_backoff, Duration::from_millis(50));
        assert_eq!(cfg.shutdown_grace, Some(Duration::from_secs(1)));
        assert_eq!(cfg.execution.work_dir, PathBuf::from("/tmp/drone"));
    }

    #[test]
    fn context_names_use_alias_and_index() {
        let cfg = DroneConfig::new("edge");
        assert_eq!(cfg.context_name(0), "edge_0");
        assert_eq!(cfg.context_name(9), "edge_9");
    }
}
