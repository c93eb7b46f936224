use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scope attached to log entries that do not name one.
pub const DEFAULT_LOG_SCOPE: &str = "tt_drone";

/// Numeric log levels understood by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Fatal = 1,
    Panic = 2,
    Error = 3,
    Warn = 4,
    Info = 5,
    Debug = 6,
    Trace = 7,
}

impl LogLevel {
    /// Coordinator log endpoint for this level. Only trace, info, warn and
    /// error can be submitted.
    pub fn endpoint(&self) -> Option<&'static str> {
        match self {
            LogLevel::Trace => Some("/log/trace"),
            LogLevel::Info => Some("/log/info"),
            LogLevel::Warn => Some("/log/warn"),
            LogLevel::Error => Some("/log/error"),
            LogLevel::Debug | LogLevel::Panic | LogLevel::Fatal => None,
        }
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(LogLevel::Fatal),
            2 => Ok(LogLevel::Panic),
            3 => Ok(LogLevel::Error),
            4 => Ok(LogLevel::Warn),
            5 => Ok(LogLevel::Info),
            6 => Ok(LogLevel::Debug),
            7 => Ok(LogLevel::Trace),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Fatal => write!(f, "fatal"),
            LogLevel::Panic => write!(f, "panic"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}

/// Document a recipe prints on stdout once it is done.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskResult {
    pub result: i32,
    #[serde(default)]
    pub verification: Option<i64>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub tasks: Vec<FollowUpTask>,
}

impl TaskResult {
    pub fn parse(stdout: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(stdout.trim())
    }

    pub fn verification_or_default(&self) -> i64 {
        self.verification.unwrap_or(0)
    }
}

/// A log line requested by a recipe.
///
/// `level` and `timestamp` are kept as raw JSON so that one odd entry cannot
/// make the whole result undecodable; they are interpreted per entry when the
/// log is emitted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogEntry {
    /// Numeric level; missing means trace
    #[serde(default)]
    pub level: Option<Value>,
    pub message: String,
    /// Unix timestamp in seconds; missing means "now"
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl LogEntry {
    /// Level code to submit. `Err` carries the raw value when it is not a
    /// level code at all.
    pub fn level_or_default(&self) -> Result<u8, &Value> {
        match &self.level {
            None | Some(Value::Null) => Ok(LogLevel::Trace as u8),
            Some(raw) => raw
                .as_u64()
                .and_then(|code| u8::try_from(code).ok())
                .ok_or(raw),
        }
    }

    /// Timestamp in whole seconds. Fractional timestamps are truncated;
    /// anything that is not a number falls back to `now`.
    pub fn timestamp_or(&self, now: i64) -> i64 {
        match &self.timestamp {
            Some(raw) => raw
                .as_i64()
                .or_else(|| raw.as_f64().map(|t| t as i64))
                .unwrap_or(now),
            None => now,
        }
    }

    pub fn scope_or_default(&self) -> &str {
        self.scope.as_deref().unwrap_or(DEFAULT_LOG_SCOPE)
    }
}

/// A task the recipe asks the drone to submit on its behalf.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FollowUpTask {
    pub project: i64,
    pub recipe: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub max_assign_time: Option<i64>,
    #[serde(default)]
    pub hash64: Option<u64>,
    #[serde(default)]
    pub unique_str: Option<String>,
    #[serde(default)]
    pub verification_count: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<i64>,
}

/// Body of `POST /task/submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitTask {
    pub project: i64,
    pub recipe: String,
    pub priority: i64,
    pub max_assign_time: i64,
    #[serde(rename = "hash_u64")]
    pub hash64: u64,
    pub unique_str: String,
    pub verification_count: i64,
    pub max_retries: i64,
}

impl SubmitTask {
    /// A submission with the client defaults for every optional field.
    pub fn new(project: i64, recipe: impl Into<String>) -> Self {
        Self {
            project,
            recipe: recipe.into(),
            priority: 1,
            max_assign_time: 3600,
            hash64: 0,
            unique_str: String::new(),
            verification_count: 1,
            max_retries: 3,
        }
    }
}

impl From<FollowUpTask> for SubmitTask {
    fn from(task: FollowUpTask) -> Self {
        let defaults = SubmitTask::new(task.project, task.recipe);
        Self {
            priority: task.priority.unwrap_or(defaults.priority),
            max_assign_time: task.max_assign_time.unwrap_or(defaults.max_assign_time),
            hash64: task.hash64.unwrap_or(defaults.hash64),
            unique_str: task.unique_str.unwrap_or(defaults.unique_str.clone()),
            verification_count: task
                .verification_count
                .unwrap_or(defaults.verification_count),
            max_retries: task.max_retries.unwrap_or(defaults.max_retries),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_level_round_trips_through_numeric_code() {
        for code in 1..=7u8 {
            let level = LogLevel::try_from(code).unwrap();
            assert_eq!(level as u8, code);
        }
        assert_eq!(LogLevel::try_from(0), Err(0));
        assert_eq!(LogLevel::try_from(8), Err(8));
    }

    #[test]
    fn only_four_levels_have_endpoints() {
        assert_eq!(LogLevel::Trace.endpoint(), Some("/log/trace"));
        assert_eq!(LogLevel::Info.endpoint(), Some("/log/info"));
        assert_eq!(LogLevel::Warn.endpoint(), Some("/log/warn"));
        assert_eq!(LogLevel::Error.endpoint(), Some("/log/error"));
        assert!(LogLevel::Debug.endpoint().is_none());
        assert!(LogLevel::Panic.endpoint().is_none());
        assert!(LogLevel::Fatal.endpoint().is_none());
    }

    #[test]
    fn parse_minimal_result() {
        let result = TaskResult::parse(r#"{"result": 0}"#).unwrap();
        assert_eq!(result.result, 0);
        assert_eq!(result.verification_or_default(), 0);
        assert!(result.logs.is_empty());
        assert!(result.tasks.is_empty());
    }

    #[test]
    fn parse_result_with_trailing_newline() {
        let result = TaskResult::parse("{\"result\": 1, \"verification\": 99}\n").unwrap();
        assert_eq!(result.result, 1);
        assert_eq!(result.verification_or_default(), 99);
    }

    #[test]
    fn parse_rejects_missing_result() {
        assert!(TaskResult::parse(r#"{"verification": 1}"#).is_err());
        assert!(TaskResult::parse("Traceback (most recent call last):").is_err());
        assert!(TaskResult::parse("").is_err());
    }

    #[test]
    fn log_entry_defaults() {
        let result = TaskResult::parse(r#"{"result":0,"logs":[{"message":"ok"}]}"#).unwrap();
        let entry = &result.logs[0];
        assert_eq!(entry.level_or_default(), Ok(LogLevel::Trace as u8));
        assert_eq!(entry.timestamp_or(1234), 1234);
        assert_eq!(entry.scope_or_default(), DEFAULT_LOG_SCOPE);
    }

    #[test]
    fn log_entry_keeps_explicit_fields() {
        let entry: LogEntry = serde_json::from_value(json!({
            "level": 3, "message": "boom", "timestamp": 42, "scope": "crawler"
        }))
        .unwrap();
        assert_eq!(entry.level_or_default(), Ok(3));
        assert_eq!(entry.timestamp_or(1234), 42);
        assert_eq!(entry.scope_or_default(), "crawler");
    }

    #[test]
    fn odd_log_fields_do_not_break_the_result() {
        let result = TaskResult::parse(
            r#"{"result":0,"verification":1,"logs":[
                {"level":300,"message":"too high"},
                {"level":"info","message":"named"},
                {"level":-1,"message":"negative"},
                {"message":"fractional","timestamp":1700000000.5},
                {"message":"text time","timestamp":"yesterday"}
            ],"tasks":[{"project":2,"recipe":"r"}]}"#,
        )
        .unwrap();
        assert_eq!(result.result, 0);
        assert_eq!(result.tasks.len(), 1);

        let logs = &result.logs;
        assert_eq!(logs[0].level_or_default(), Err(&json!(300)));
        assert_eq!(logs[1].level_or_default(), Err(&json!("info")));
        assert!(logs[2].level_or_default().is_err());
        assert_eq!(logs[3].timestamp_or(0), 1_700_000_000);
        assert_eq!(logs[4].timestamp_or(99), 99);
    }

    #[test]
    fn follow_up_task_takes_client_defaults() {
        let follow_up: FollowUpTask =
            serde_json::from_value(json!({"project": 3, "recipe": "next"})).unwrap();
        let submit = SubmitTask::from(follow_up);
        assert_eq!(submit, SubmitTask::new(3, "next"));
        assert_eq!(submit.priority, 1);
        assert_eq!(submit.max_assign_time, 3600);
        assert_eq!(submit.verification_count, 1);
        assert_eq!(submit.max_retries, 3);
    }

    #[test]
    fn follow_up_task_passes_fields_through() {
        let follow_up: FollowUpTask = serde_json::from_value(json!({
            "project": 3, "recipe": "next", "priority": 9, "max_assign_time": 60,
            "hash64": 12345, "unique_str": "abc", "verification_count": 2, "max_retries": 0
        }))
        .unwrap();
        let submit = SubmitTask::from(follow_up);
        assert_eq!(submit.priority, 9);
        assert_eq!(submit.max_assign_time, 60);
        assert_eq!(submit.hash64, 12345);
        assert_eq!(submit.unique_str, "abc");
        assert_eq!(submit.verification_count, 2);
        assert_eq!(submit.max_retries, 0);
    }

    #[test]
    fn submit_task_wire_names() {
        let body = serde_json::to_value(SubmitTask::new(1, "r")).unwrap();
        assert_eq!(body["hash_u64"], 0);
        assert!(body.get("hash64").is_none());
        assert_eq!(body["unique_str"], "");
    }
}
