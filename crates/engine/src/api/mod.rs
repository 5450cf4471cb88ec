// Authenticated HTTP client for the remote workspace API.
//
// Every attempt — including retries — first acquires a rate-limiter slot
// at the caller's priority. Overload responses (429) pause the limiter
// globally, sleep out the same window locally, and retry; any other
// non-2xx response maps the error envelope to a typed error immediately.
//
// Transport is abstracted via `ApiTransport` for testability. The
// production implementation wraps reqwest.

pub mod paginate;
pub mod wire;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use atlas_common::error::{Error, Result};

use crate::config::EngineConfig;
use crate::ratelimit::{Priority, RateLimiter};

/// Total attempts per logical call (1 initial + 3 overload retries).
pub const MAX_ATTEMPTS: u32 = 4;

/// Floor for the overload backoff: a missing or malformed `Retry-After`
/// must never produce a zero wait.
const MIN_OVERLOAD_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// A request as handed to the transport layer, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub token: String,
    pub api_version: String,
    pub body: Option<Value>,
}

/// Raw response surfaced by the transport.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Raw `Retry-After` header value, if the server sent one.
    pub retry_after: Option<String>,
    pub body: Value,
}

/// Abstraction over the HTTP transport.
///
/// In production this is `ReqwestTransport`; tests substitute a scripted
/// mock that records requests.
pub trait ApiTransport: Send + Sync {
    fn execute(&self, request: ApiRequest) -> impl Future<Output = Result<ApiResponse>> + Send;
}

// ── Production transport ────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApiTransport for ReqwestTransport {
    fn execute(&self, request: ApiRequest) -> impl Future<Output = Result<ApiResponse>> + Send {
        let http = self.http.clone();
        async move {
            let mut builder = match request.method {
                Method::Get => http.get(&request.url),
                Method::Post => http.post(&request.url),
                Method::Patch => http.patch(&request.url),
                Method::Delete => http.delete(&request.url),
            };
            builder = builder
                .bearer_auth(&request.token)
                .header("X-Api-Version", &request.api_version);
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response =
                builder.send().await.map_err(|error| Error::Transport(error.to_string()))?;
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(ToOwned::to_owned);
            let text =
                response.text().await.map_err(|error| Error::Transport(error.to_string()))?;
            let body = if text.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::Null)
            };

            Ok(ApiResponse { status, retry_after, body })
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Thin authenticated call wrapper over a transport plus the limiter.
pub struct ApiClient<T> {
    transport: Arc<T>,
    limiter: RateLimiter,
    base_url: String,
    token: String,
    api_version: String,
}

impl<T> Clone for ApiClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            limiter: self.limiter.clone(),
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            api_version: self.api_version.clone(),
        }
    }
}

impl<T: ApiTransport> ApiClient<T> {
    pub fn new(config: &EngineConfig, limiter: RateLimiter, transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            limiter,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            api_version: config.api_version.clone(),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    /// Perform one logical API call, retrying overload responses.
    pub async fn call(
        &self,
        path: &str,
        method: Method,
        body: Option<Value>,
        priority: Priority,
    ) -> Result<Value> {
        let request_id = Uuid::new_v4();

        for attempt in 1..=MAX_ATTEMPTS {
            self.limiter.acquire(priority).await;

            let request = ApiRequest {
                method,
                url: format!("{}{}", self.base_url, path),
                token: self.token.clone(),
                api_version: self.api_version.clone(),
                body: body.clone(),
            };
            debug!(%request_id, attempt, method = method.as_str(), path, "api call");

            let response = self.transport.execute(request).await?;

            if response.status == 429 {
                let wait = overload_pause(response.retry_after.as_deref());
                warn!(
                    %request_id,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    "remote overload, pausing all callers"
                );
                self.limiter.pause(wait);
                tokio::time::sleep(wait).await;
                continue;
            }

            if !(200..300).contains(&response.status) {
                return Err(remote_error(response.status, &response.body));
            }

            return Ok(response.body);
        }

        Err(Error::RateLimitExhausted { attempts: MAX_ATTEMPTS })
    }
}

/// Backoff for an overload response. Only positive integer seconds are
/// honored; anything else (absent header, HTTP-date, zero, garbage)
/// falls back to the 1-second floor.
fn overload_pause(retry_after: Option<&str>) -> Duration {
    let seconds = retry_after
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|seconds| *seconds > 0)
        .unwrap_or(1);
    Duration::from_secs(seconds).max(MIN_OVERLOAD_PAUSE)
}

fn remote_error(status: u16, body: &Value) -> Error {
    let envelope = body.get("error").unwrap_or(body);
    let code = envelope
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let message = envelope
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("remote api request failed")
        .to_string();
    Error::RemoteApi { status, code, message }
}

// ── Test transport ──────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::testing::{test_client, MockTransport};
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;

    #[tokio::test]
    async fn call_sends_auth_and_version_headers() {
        let transport = MockTransport::new();
        transport.queue_ok(json!({"ok": true}));
        let client = test_client(transport);

        let body = client
            .call("/items/abc", Method::Get, None, Priority::Interactive)
            .await
            .expect("call should succeed");
        assert_eq!(body["ok"], true);

        let requests = client.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "http://127.0.0.1:4000/items/abc");
        assert_eq!(requests[0].token, "test-token");
        assert_eq!(requests[0].api_version, "2026-06-01");
    }

    #[tokio::test]
    async fn non_overload_errors_surface_immediately_without_retry() {
        let transport = MockTransport::new();
        transport.queue_status(
            400,
            None,
            json!({"code": "validation_error", "message": "title is required"}),
        );
        let client = test_client(transport);

        let error = client
            .call("/items", Method::Post, Some(json!({})), Priority::Interactive)
            .await
            .expect_err("400 should fail");
        match error {
            Error::RemoteApi { status, code, message } => {
                assert_eq!(status, 400);
                assert_eq!(code, "validation_error");
                assert_eq!(message, "title is required");
            }
            other => panic!("expected RemoteApi, got {other:?}"),
        }
        assert_eq!(client.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn error_envelope_may_be_nested_under_error_key() {
        let transport = MockTransport::new();
        transport.queue_status(
            403,
            None,
            json!({"error": {"code": "forbidden", "message": "no access"}}),
        );
        let client = test_client(transport);

        let error = client
            .call("/items/x", Method::Get, None, Priority::Interactive)
            .await
            .expect_err("403 should fail");
        match error {
            Error::RemoteApi { status, code, .. } => {
                assert_eq!(status, 403);
                assert_eq!(code, "forbidden");
            }
            other => panic!("expected RemoteApi, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overload_honors_numeric_retry_after_then_succeeds() {
        let transport = MockTransport::new();
        transport.queue_status(429, Some("2"), json!({}));
        transport.queue_ok(json!({"ok": true}));
        let client = test_client(transport);

        let started = Instant::now();
        let body = client
            .call("/search", Method::Post, Some(json!({})), Priority::Interactive)
            .await
            .expect("retry should succeed");
        assert_eq!(body["ok"], true);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(client.transport.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_retry_after_waits_at_least_one_second() {
        for bad in [None, Some("Wed, 21 Oct 2026 07:28:00 GMT"), Some("0"), Some("soon")] {
            let transport = MockTransport::new();
            transport.queue_status(429, bad, json!({}));
            transport.queue_ok(json!({}));
            let client = test_client(transport);

            let started = Instant::now();
            client
                .call("/search", Method::Post, None, Priority::Interactive)
                .await
                .expect("retry should succeed");
            assert!(
                started.elapsed() >= Duration::from_secs(1),
                "retry_after {bad:?} must pause for at least 1s"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overload_pauses_the_shared_limiter() {
        let transport = MockTransport::new();
        transport.queue_status(429, Some("3"), json!({}));
        transport.queue_ok(json!({}));
        let client = test_client(transport);

        let call = client.call("/search", Method::Post, None, Priority::Background);
        tokio::pin!(call);
        // Poll the call until it has processed the 429 and paused the limiter.
        tokio::select! {
            biased;
            _ = &mut call => panic!("call should still be sleeping out the pause"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        assert!(client.limiter().is_paused());
        call.await.expect("call should eventually succeed");
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_overload_exhausts_retries() {
        let transport = MockTransport::new();
        for _ in 0..MAX_ATTEMPTS {
            transport.queue_status(429, Some("1"), json!({}));
        }
        let client = test_client(transport);

        let error = client
            .call("/search", Method::Post, None, Priority::Interactive)
            .await
            .expect_err("sustained overload should exhaust retries");
        assert_eq!(error, Error::RateLimitExhausted { attempts: MAX_ATTEMPTS });
        assert_eq!(client.transport.request_count(), MAX_ATTEMPTS as usize);
    }

    #[test]
    fn overload_pause_parses_only_positive_integers() {
        assert_eq!(overload_pause(Some("5")), Duration::from_secs(5));
        assert_eq!(overload_pause(Some(" 2 ")), Duration::from_secs(2));
        assert_eq!(overload_pause(Some("0")), Duration::from_secs(1));
        assert_eq!(overload_pause(Some("-3")), Duration::from_secs(1));
        assert_eq!(overload_pause(Some("1.5")), Duration::from_secs(1));
        assert_eq!(overload_pause(Some("Thu, 01 Jan 2026 00:00:00 GMT")), Duration::from_secs(1));
        assert_eq!(overload_pause(None), Duration::from_secs(1));
    }
}
