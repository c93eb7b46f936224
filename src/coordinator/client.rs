use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::config::ClientConfig;
use crate::coordinator::signing::{
    http_date, sign, HEADER_SIGNATURE, HEADER_TIMESTAMP, HEADER_WORKER_ID,
};
use crate::coordinator::{
    Coordinator, Envelope, ProjectsContent, SecretContent, TaskContent, WorkerContent,
};
use crate::credentials::WorkerIdentity;
use crate::error::ClientError;
use crate::model::{LogLevel, Project, SubmitTask, Task};

/// Status and body of a coordinator response that was not rate limited.
#[derive(Debug)]
struct RawResponse {
    status: StatusCode,
    body: String,
}

/// HTTP client for the coordinator API.
///
/// Every authenticated request is signed with the worker secret (see
/// [`signing`](crate::coordinator::signing)). Transport failures are retried up
/// to `retry.max_attempts` times; HTTP 429 responses make the client sleep for
/// the scaled `rate_limit_delay` and try again without consuming an attempt.
/// A call can therefore block for as long as the coordinator keeps rate
/// limiting it, unless `retry.max_rate_limit_waits` is set.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    config: ClientConfig,
    identity: Option<WorkerIdentity>,
}

impl CoordinatorClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            http,
            config,
            identity: None,
        })
    }

    /// Sign all subsequent requests as `identity`.
    pub fn with_identity(mut self, identity: WorkerIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn identity(&self) -> Option<&WorkerIdentity> {
        self.identity.as_ref()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Register a new worker. This is the only unauthenticated call; any
    /// rejection is returned as an error since the drone cannot run without
    /// an identity.
    pub async fn register_worker(&self, alias: &str) -> Result<WorkerIdentity, ClientError> {
        const ENDPOINT: &str = "/worker/create";

        let body = json!({ "alias": alias }).to_string();
        let response = self
            .send(Method::POST, ENDPOINT, Some(body), false)
            .await?;

        if response.status != StatusCode::OK {
            let message = serde_json::from_str::<Envelope<serde_json::Value>>(&response.body)
                .ok()
                .and_then(|env| env.message)
                .unwrap_or(response.body);
            return Err(ClientError::RegistrationRejected {
                status: response.status,
                message,
            });
        }

        let worker = parse_content::<WorkerContent>(ENDPOINT, &response.body)?.worker;
        let identity = WorkerIdentity::from_base64(worker.id, worker.alias, &worker.secret)
            .map_err(|e| malformed(ENDPOINT, format!("secret is not valid base64: {e}")))?;

        tracing::info!(worker_id = identity.id, alias = %identity.alias, "Registered worker");
        Ok(identity)
    }

    async fn get(&self, endpoint: &str) -> Result<RawResponse, ClientError> {
        self.send(Method::GET, endpoint, None, true).await
    }

    async fn post(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<RawResponse, ClientError> {
        self.send(Method::POST, endpoint, Some(body.to_string()), true)
            .await
    }

    /// Send a request, applying both retry tiers.
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<String>,
        authenticated: bool,
    ) -> Result<RawResponse, ClientError> {
        let url = format!("{}{}", self.config.base_url, endpoint);
        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);

        let mut attempts = 0u32;
        let mut rate_limit_waits = 0u32;

        loop {
            let request = self.build_request(
                method.clone(),
                &url,
                endpoint,
                body.as_deref(),
                authenticated,
            )?;

            let last_error = match execute(request).await {
                Ok(response) if response.status == StatusCode::TOO_MANY_REQUESTS => {
                    match parse_rate_limit_delay(&response.body) {
                        Some(delay) => {
                            if retry
                                .max_rate_limit_waits
                                .is_some_and(|max| rate_limit_waits >= max)
                            {
                                return Err(ClientError::RateLimited {
                                    waits: rate_limit_waits,
                                });
                            }
                            rate_limit_waits += 1;

                            let backoff = retry.rate_limit_backoff(delay);
                            tracing::warn!(
                                endpoint,
                                rate_limit_delay = delay,
                                backoff_secs = backoff.as_secs_f64(),
                                "Rate limited by coordinator"
                            );
                            tokio::time::sleep(backoff).await;
                            continue;
                        }
                        None => "HTTP 429 without a usable rate_limit_delay".to_string(),
                    }
                }
                Ok(response) => return Ok(response),
                Err(e) => e.to_string(),
            };

            attempts += 1;
            tracing::warn!(
                endpoint,
                attempt = attempts,
                max_attempts,
                error = %last_error,
                "Coordinator request failed"
            );
            if attempts >= max_attempts {
                return Err(ClientError::RetriesExhausted {
                    attempts,
                    last_error,
                });
            }
        }
    }

    /// Build one signed attempt. Each attempt gets a fresh timestamp.
    fn build_request(
        &self,
        method: Method,
        url: &str,
        endpoint: &str,
        body: Option<&str>,
        authenticated: bool,
    ) -> Result<RequestBuilder, ClientError> {
        let timestamp = http_date(Utc::now());
        let mut request = self
            .http
            .request(method, url)
            .header(HEADER_TIMESTAMP, &timestamp);

        if authenticated {
            let identity = self.identity.as_ref().ok_or(ClientError::Unauthenticated)?;
            let payload = body.unwrap_or(endpoint);
            let signature = sign(identity.secret(), payload.as_bytes(), &timestamp);
            request = request
                .header(HEADER_WORKER_ID, identity.id.to_string())
                .header(HEADER_SIGNATURE, signature);
        }

        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        Ok(request)
    }
}

async fn execute(request: RequestBuilder) -> Result<RawResponse, reqwest::Error> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    Ok(RawResponse { status, body })
}

fn parse_rate_limit_delay(body: &str) -> Option<f64> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("rate_limit_delay")?
        .as_f64()
}

fn malformed(endpoint: &str, reason: impl Into<String>) -> ClientError {
    ClientError::MalformedResponse {
        endpoint: endpoint.to_string(),
        reason: reason.into(),
    }
}

fn parse_envelope<T: DeserializeOwned>(
    endpoint: &str,
    body: &str,
) -> Result<Envelope<T>, ClientError> {
    serde_json::from_str(body).map_err(|e| malformed(endpoint, e.to_string()))
}

/// Parse a successful envelope and return its content.
fn parse_content<T: DeserializeOwned>(endpoint: &str, body: &str) -> Result<T, ClientError> {
    let envelope = parse_envelope::<T>(endpoint, body)?;
    if !envelope.ok {
        let reason = envelope
            .message
            .unwrap_or_else(|| "coordinator answered ok=false".to_string());
        return Err(malformed(endpoint, reason));
    }
    envelope
        .content
        .ok_or_else(|| malformed(endpoint, "missing content"))
}

fn expect_success(endpoint: &str, response: &RawResponse) -> Result<(), ClientError> {
    if response.status.is_success() {
        Ok(())
    } else {
        Err(ClientError::UnexpectedStatus {
            endpoint: endpoint.to_string(),
            status: response.status,
        })
    }
}

#[async_trait]
impl Coordinator for CoordinatorClient {
    async fn list_projects(&self) -> Result<Vec<Project>, ClientError> {
        const ENDPOINT: &str = "/project/list";

        let response = self.get(ENDPOINT).await?;
        expect_success(ENDPOINT, &response)?;
        Ok(parse_content::<ProjectsContent>(ENDPOINT, &response.body)?.projects)
    }

    async fn lease_task(&self, project_id: i64) -> Result<Option<Task>, ClientError> {
        let endpoint = format!("/task/get/{project_id}");

        let response = self.get(&endpoint).await?;
        if !response.status.is_success() {
            // Usually lost access or a revoked identity, not an empty queue
            tracing::warn!(
                project_id,
                status = %response.status,
                body = %response.body,
                "Lease refused by coordinator"
            );
            return Ok(None);
        }

        let envelope = parse_envelope::<TaskContent>(&endpoint, &response.body)?;
        if !envelope.ok {
            return Ok(None);
        }
        envelope
            .content
            .map(|content| Some(content.task))
            .ok_or_else(|| malformed(&endpoint, "missing task"))
    }

    async fn submit_task(&self, task: &SubmitTask) -> Result<StatusCode, ClientError> {
        let body = serde_json::to_value(task).map_err(|e| malformed("/task/submit", e.to_string()))?;
        let response = self.post("/task/submit", &body).await?;
        tracing::debug!(project_id = task.project, status = %response.status, "Task submitted");
        Ok(response.status)
    }

    async fn release_task(
        &self,
        task_id: i64,
        result: i32,
        verification: i64,
    ) -> Result<StatusCode, ClientError> {
        let body = json!({
            "task_id": task_id,
            "result": result,
            "verification": verification,
        });
        let response = self.post("/task/release", &body).await?;
        tracing::debug!(task_id, result, status = %response.status, body = %response.body, "Task released");
        Ok(response.status)
    }

    async fn emit_log(
        &self,
        level: u8,
        message: &str,
        timestamp: i64,
        scope: &str,
    ) -> Result<StatusCode, ClientError> {
        let endpoint = LogLevel::try_from(level)
            .ok()
            .and_then(|l| l.endpoint())
            .ok_or(ClientError::UnsupportedLogLevel(level))?;

        let body = json!({
            "level": level,
            "message": message,
            "timestamp": timestamp,
            "scope": scope,
        });
        Ok(self.post(endpoint, &body).await?.status)
    }

    async fn request_project_access(
        &self,
        project_id: i64,
        assign: bool,
        submit: bool,
    ) -> Result<StatusCode, ClientError> {
        let body = json!({
            "project": project_id,
            "assign": assign,
            "submit": submit,
        });
        let response = self.post("/project/request_access", &body).await?;
        tracing::debug!(project_id, status = %response.status, body = %response.body, "Requested project access");
        Ok(response.status)
    }

    async fn fetch_project_secret(&self, project_id: i64) -> Result<String, ClientError> {
        let endpoint = format!("/project/secret/{project_id}");

        let response = self.get(&endpoint).await?;
        expect_success(&endpoint, &response)?;
        Ok(parse_content::<SecretContent>(&endpoint, &response.body)?.secret)
    }
}
