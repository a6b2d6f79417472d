//! HTTP client for loopd daemon.
//!
//! Communicates with loopd via its local HTTP API (Section 6.1).

use loop_core::{IterationRecord, RunState};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: loopd\n  → or set LOOPD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check LOOPD_TOKEN env var or --token flag")]
    Unauthorized,

    #[error("no capacity: per-workspace run limit reached, wait for a run to complete")]
    NoCapacity,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure loopd is running\n  → check LOOPD_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for creating a run (POST /runs).
#[derive(Debug, Serialize)]
pub struct CreateRunRequest {
    pub task: String,
    pub workspace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iters: Option<u32>,
}

/// Response from create run endpoint.
#[derive(Debug, Deserialize)]
pub struct CreateRunResponse {
    pub run_id: String,
}

#[derive(Debug, Deserialize)]
struct ListRunsResponse {
    runs: Vec<RunState>,
}

#[derive(Debug, Deserialize)]
struct ListIterationsResponse {
    iterations: Vec<IterationRecord>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Default total timeout for daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for loopd.
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the daemon address (for error messages).
    pub fn addr(&self) -> &str {
        &self.base_url
    }

    /// Check if daemon is healthy by probing /health.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for daemon to become ready with exponential backoff.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS).await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady { addr: self.base_url.clone(), timeout_ms });
                    }

                    eprintln!("waiting for daemon at {} (retrying in {}ms)", self.base_url, backoff_ms);

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;

                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();

        if status == 401 {
            return ClientError::Unauthorized;
        }
        if status == 404 {
            return ClientError::RunNotFound("resource not found".to_string());
        }
        if status == 503 {
            return ClientError::NoCapacity;
        }

        let message = response.json::<ErrorResponse>().await.map(|e| e.error).unwrap_or_else(|_| "unknown error".to_string());
        ClientError::HttpError { status, message }
    }

    /// Create a new run.
    /// POST /runs
    pub async fn create_run(&self, req: CreateRunRequest) -> Result<String, ClientError> {
        let url = format!("{}/runs", self.base_url);
        let response = self.http.post(&url).headers(self.headers()).json(&req).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let body: CreateRunResponse = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.run_id)
    }

    /// List all runs.
    /// GET /runs
    pub async fn list_runs(&self) -> Result<Vec<RunState>, ClientError> {
        let url = format!("{}/runs", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let body: ListRunsResponse = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.runs)
    }

    /// Get a single run.
    /// GET /runs/{id}
    pub async fn get_run(&self, run_id: &str) -> Result<RunState, ClientError> {
        let url = format!("{}/runs/{}", self.base_url, run_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// List iterations for a run.
    /// GET /runs/{id}/iterations
    pub async fn list_iterations(&self, run_id: &str) -> Result<Vec<IterationRecord>, ClientError> {
        let url = format!("{}/runs/{}/iterations", self.base_url, run_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let body: ListIterationsResponse = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.iterations)
    }

    /// Cancel a run.
    /// POST /runs/{id}/cancel
    pub async fn cancel_run(&self, run_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/runs/{}/cancel", self.base_url, run_id);
        let response = self.http.post(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        Ok(())
    }

    /// Stream a run's event log via SSE, printing each line as it arrives.
    /// GET /runs/{id}/events
    pub async fn stream_events(&self, run_id: &str) -> Result<(), ClientError> {
        use futures::StreamExt;

        let url = format!("{}/runs/{}/events", self.base_url, run_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(end) = buffer.find("\n\n") {
                let event_str = buffer[..end].to_string();
                buffer = buffer[end + 2..].to_string();

                if let Some(data) = parse_sse_data(&event_str) {
                    println!("{}", data);
                }
            }
        }

        if let Some(data) = parse_sse_data(&buffer) {
            println!("{}", data);
        }

        Ok(())
    }
}

/// Extract the `data:` payload from a raw SSE event string, if present.
fn parse_sse_data(event_str: &str) -> Option<String> {
    for line in event_str.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            return Some(value.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- SSE parsing tests ---

    #[test]
    fn parse_sse_data_extracts_data_field() {
        let event_str = "id: 0\ndata: run started";
        assert_eq!(parse_sse_data(event_str), Some("run started".to_string()));
    }

    #[test]
    fn parse_sse_data_handles_missing_data() {
        let event_str = "id: 0";
        assert!(parse_sse_data(event_str).is_none());
    }

    #[test]
    fn parse_sse_data_trims_whitespace() {
        let event_str = "data:   hello world  ";
        assert_eq!(parse_sse_data(event_str), Some("hello world".to_string()));
    }

    // --- Client construction tests ---

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:4170/", None);
        assert_eq!(client.base_url, "http://localhost:4170");
    }

    #[test]
    fn client_preserves_url_without_trailing_slash() {
        let client = Client::new("http://localhost:4170", None);
        assert_eq!(client.base_url, "http://localhost:4170");
    }

    #[test]
    fn client_stores_auth_token() {
        let client = Client::new("http://localhost:4170", Some("my-secret-token"));
        assert_eq!(client.token, Some("my-secret-token".to_string()));
    }

    #[test]
    fn client_headers_include_content_type() {
        let client = Client::new("http://localhost:4170", None);
        let headers = client.headers();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn client_headers_include_auth_when_token_set() {
        let client = Client::new("http://localhost:4170", Some("test-token"));
        let headers = client.headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer test-token");
    }

    #[test]
    fn client_headers_omit_auth_when_no_token() {
        let client = Client::new("http://localhost:4170", None);
        let headers = client.headers();
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn client_addr_returns_base_url() {
        let client = Client::new("http://localhost:4170", None);
        assert_eq!(client.addr(), "http://localhost:4170");
    }

    // --- Readiness probe tests ---

    #[tokio::test]
    async fn check_health_fails_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999", None);
        let result = client.check_health().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999", None);
        let result = client.wait_for_ready_with_timeout(100).await;

        match result {
            Err(ClientError::DaemonNotReady { addr, timeout_ms }) => {
                assert_eq!(addr, "http://127.0.0.1:19999");
                assert_eq!(timeout_ms, 100);
            }
            _ => panic!("expected DaemonNotReady error"),
        }
    }

    #[test]
    fn daemon_not_ready_error_message_includes_hint() {
        let err = ClientError::DaemonNotReady { addr: "http://127.0.0.1:4170".to_string(), timeout_ms: 5000 };
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:4170"));
        assert!(msg.contains("5000ms"));
        assert!(msg.contains("LOOPD_TOKEN"));
    }

    #[test]
    fn connection_failed_error_suggests_start_command() {
        let err = ClientError::ConnectionFailed { addr: "http://127.0.0.1:4170".to_string() };
        let msg = err.to_string();
        assert!(msg.contains("loopd"), "should suggest starting loopd");
        assert!(msg.contains("LOOPD_ADDR"), "should mention LOOPD_ADDR env var");
    }

    #[test]
    fn unauthorized_error_suggests_token_options() {
        let err = ClientError::Unauthorized;
        let msg = err.to_string();
        assert!(msg.contains("LOOPD_TOKEN"), "should mention LOOPD_TOKEN env var");
        assert!(msg.contains("--token"), "should mention --token flag");
    }

    #[test]
    fn no_capacity_error_explains_cause() {
        let err = ClientError::NoCapacity;
        let msg = err.to_string();
        assert!(msg.contains("per-workspace") || msg.contains("limit"), "should explain capacity limit");
    }
}
