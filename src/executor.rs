//! Resilient request executor
//!
//! Issues one logical request through an [`HttpTransport`], retrying under a
//! [`RetryPolicy`] and admitting every physical attempt through the shared
//! [`RequestLimiter`].

use crate::config::{Config, RetryOverrides, RetryPolicy};
use crate::error::Result;
use crate::fault::Fault;
use crate::limiter::RequestLimiter;
use crate::retry::run_with_retry;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Per-call request options
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Request method (default: GET)
    pub method: Option<String>,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
    /// Optional request body
    pub body: Option<Bytes>,
    /// Changes to the executor's default retry policy for this call only
    pub retry: Option<RetryOverrides>,
    /// Caller cancellation, observed by every attempt and backoff sleep
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    /// Plain GET with the default policy
    pub fn get() -> Self {
        Self::default()
    }

    /// Use `method` instead of GET
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Add a request header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Send `body` with the request
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Override parts of the retry policy
    #[must_use]
    pub fn with_retry(mut self, overrides: RetryOverrides) -> Self {
        self.retry = Some(overrides);
        self
    }

    /// Observe `token` for cancellation
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Executes requests with retry, per-attempt timeout, backoff and a shared
/// concurrency cap
///
/// Cheap to clone; clones share the transport, the limiter and the attempt
/// counter.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    limiter: RequestLimiter,
    policy: Arc<RetryPolicy>,
    attempts: Arc<AtomicU64>,
}

impl RequestExecutor {
    /// Create an executor over `transport`
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: RequestLimiter,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            limiter,
            policy: Arc::new(policy),
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a reqwest-backed executor from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.fetch.user_agent)?;
        Ok(Self::new(
            Arc::new(transport),
            RequestLimiter::new(config.fetch.max_concurrent_requests),
            config.retry.clone(),
        ))
    }

    /// Default retry policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Shared concurrency limiter
    pub fn limiter(&self) -> &RequestLimiter {
        &self.limiter
    }

    /// Physical attempts made so far by this executor and its clones
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Issue a request and return the 2xx response
    pub async fn request(
        &self,
        target: &str,
        options: RequestOptions,
    ) -> std::result::Result<HttpResponse, Fault> {
        self.request_with(target, options, Ok).await
    }

    /// Issue a request and map the 2xx response
    ///
    /// A failure returned by `map` counts as a failure of that attempt and is
    /// classified like any other.
    pub async fn request_with<T, M>(
        &self,
        target: &str,
        options: RequestOptions,
        map: M,
    ) -> std::result::Result<T, Fault>
    where
        M: Fn(HttpResponse) -> std::result::Result<T, Fault>,
    {
        let RequestOptions {
            method,
            headers,
            body,
            retry,
            cancel,
        } = options;

        let policy = match &retry {
            Some(overrides) => self.policy.with_overrides(overrides),
            None => RetryPolicy::clone(&self.policy),
        };
        let request = HttpRequest {
            method: method.as_deref().unwrap_or("GET").to_ascii_uppercase(),
            url: target.to_string(),
            headers,
            body,
        };
        let method = request.method.clone();
        let map = &map;
        let request = &request;

        run_with_retry(target, &method, &policy, cancel.as_ref(), move |attempt| async move {
            let response = self.send_once(request.clone(), attempt).await?;
            map(response)
        })
        .await
    }

    /// Fetch a non-empty payload
    pub async fn fetch_bytes(
        &self,
        target: &str,
        options: RequestOptions,
    ) -> std::result::Result<Bytes, Fault> {
        self.request_with(target, options, |response| {
            if response.body.is_empty() {
                Err(Fault::empty_payload(target))
            } else {
                Ok(response.body)
            }
        })
        .await
    }

    /// Fetch and decode a JSON document
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        target: &str,
        options: RequestOptions,
    ) -> std::result::Result<T, Fault> {
        self.request_with(target, options, |response| {
            serde_json::from_slice(&response.body).map_err(|e| Fault::decode(target, e))
        })
        .await
    }

    async fn send_once(
        &self,
        request: HttpRequest,
        attempt: u32,
    ) -> std::result::Result<HttpResponse, Fault> {
        let url = request.url.clone();
        let _permit = self.limiter.acquire(&url).await?;
        self.attempts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(url = %url, attempt = attempt, method = %request.method, "Sending request");

        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(Fault::status(url, response.status, response.text()));
        }
        Ok(response)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultKind;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Transport that replays a fixed script of statuses, then repeats the last one
    struct ScriptedTransport {
        script: Mutex<VecDeque<u16>>,
        last: u16,
        sent: AtomicU64,
    }

    impl ScriptedTransport {
        fn new(statuses: &[u16]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(statuses.iter().copied().collect()),
                last: *statuses.last().unwrap(),
                sent: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, _request: HttpRequest) -> std::result::Result<HttpResponse, Fault> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            let status = self.script.lock().await.pop_front().unwrap_or(self.last);
            Ok(HttpResponse {
                status,
                headers: Vec::new(),
                body: Bytes::from_static(b"payload"),
            })
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            per_attempt_timeout: Duration::from_secs(2),
            backoff_base: Duration::from_millis(5),
            backoff_factor: 2.0,
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    fn executor_over(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> RequestExecutor {
        RequestExecutor::new(transport, RequestLimiter::new(4), policy)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_500_until_success_with_exact_backoff() {
        let transport = ScriptedTransport::new(&[500, 500, 200]);
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(250),
            ..fast_policy(3)
        };
        let executor = executor_over(transport.clone(), policy);

        let start = tokio::time::Instant::now();
        let response = executor
            .request("https://data.example.com/a", RequestOptions::get())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 3);
        assert_eq!(executor.attempts(), 3);
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(750) && elapsed < Duration::from_millis(760),
            "slept {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_status_fault() {
        let transport = ScriptedTransport::new(&[503]);
        let executor = executor_over(transport.clone(), fast_policy(4));

        let fault = executor
            .request("https://data.example.com/a", RequestOptions::get())
            .await
            .unwrap_err();

        assert_eq!(fault.status_code(), Some(503));
        assert_eq!(transport.sent.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn per_call_overrides_do_not_touch_default_policy() {
        let transport = ScriptedTransport::new(&[503]);
        let executor = executor_over(transport.clone(), fast_policy(2));

        let overrides = RetryOverrides {
            max_attempts: Some(5),
            ..RetryOverrides::default()
        };
        let _ = executor
            .request(
                "https://data.example.com/a",
                RequestOptions::get().with_retry(overrides),
            )
            .await;
        assert_eq!(transport.sent.load(Ordering::SeqCst), 5);
        assert_eq!(executor.policy().max_attempts, 2);

        let _ = executor
            .request("https://data.example.com/a", RequestOptions::get())
            .await;
        assert_eq!(transport.sent.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn status_retry_is_independent_of_method() {
        let transport = ScriptedTransport::new(&[503, 201]);
        let executor = executor_over(transport.clone(), fast_policy(3));

        let response = executor
            .request(
                "https://data.example.com/a",
                RequestOptions::get().with_method("post"),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn not_found_is_attempted_once() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut policy = fast_policy(5);
        policy.retryable_status_codes.insert(404);
        let executor = executor_over(Arc::new(ReqwestTransport::new("test").unwrap()), policy);

        let url = format!("{}/missing.png", mock_server.uri());
        let fault = executor
            .fetch_bytes(&url, RequestOptions::get())
            .await
            .unwrap_err();

        assert!(fault.is_not_found());
        assert_eq!(fault.url(), Some(url.as_str()));
        assert_eq!(executor.attempts(), 1);
    }

    #[tokio::test]
    async fn empty_payload_is_retried_then_reported() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty.png"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&mock_server)
            .await;

        let executor = executor_over(
            Arc::new(ReqwestTransport::new("test").unwrap()),
            fast_policy(3),
        );

        let fault = executor
            .fetch_bytes(
                &format!("{}/empty.png", mock_server.uri()),
                RequestOptions::get(),
            )
            .await
            .unwrap_err();

        assert!(matches!(fault.kind(), FaultKind::EmptyPayload { .. }));
    }

    #[tokio::test]
    async fn fetch_json_decodes_and_rejects_garbage() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"[1, 2, 3]"#))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bad.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let executor = executor_over(
            Arc::new(ReqwestTransport::new("test").unwrap()),
            fast_policy(3),
        );

        let values: Vec<u32> = executor
            .fetch_json(
                &format!("{}/ok.json", mock_server.uri()),
                RequestOptions::get(),
            )
            .await
            .unwrap();
        assert_eq!(values, vec![1, 2, 3]);

        let fault = executor
            .fetch_json::<Vec<u32>>(
                &format!("{}/bad.json", mock_server.uri()),
                RequestOptions::get(),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(fault.kind(), FaultKind::Decode { .. }),
            "decode failures are terminal"
        );
    }

    #[tokio::test]
    async fn post_header_and_body_are_resent_on_retry() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header("x-trace", "abc"))
            .and(body_string("payload"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header("x-trace", "abc"))
            .and(body_string("payload"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let executor = executor_over(
            Arc::new(ReqwestTransport::new("test").unwrap()),
            fast_policy(3),
        );
        let options = RequestOptions::get()
            .with_method("post")
            .with_header("x-trace", "abc")
            .with_body("payload");

        let response = executor
            .request(&format!("{}/submit", mock_server.uri()), options)
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.text(), "created");
        assert_eq!(executor.attempts(), 2);
    }

    #[tokio::test]
    async fn slow_server_times_out_per_attempt() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let policy = RetryPolicy {
            per_attempt_timeout: Duration::from_millis(100),
            ..fast_policy(2)
        };
        let executor = executor_over(Arc::new(ReqwestTransport::new("test").unwrap()), policy);

        let fault = executor
            .request(&mock_server.uri(), RequestOptions::get())
            .await
            .unwrap_err();

        assert!(matches!(fault.kind(), FaultKind::Timeout { timeout_ms: 100, .. }));
    }

    #[tokio::test]
    async fn caller_cancellation_aborts_in_flight_attempt() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let executor = executor_over(
            Arc::new(ReqwestTransport::new("test").unwrap()),
            fast_policy(5),
        );
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let fault = executor
            .request(&mock_server.uri(), RequestOptions::get().with_cancel(token))
            .await
            .unwrap_err();

        assert!(matches!(fault.kind(), FaultKind::Cancelled { .. }));
        assert_eq!(executor.attempts(), 1, "no retry after caller cancellation");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn limiter_slot_is_released_after_each_attempt() {
        let transport = ScriptedTransport::new(&[500, 500, 200]);
        let executor = RequestExecutor::new(transport, RequestLimiter::new(1), fast_policy(3));

        executor
            .request("https://data.example.com/a", RequestOptions::get())
            .await
            .unwrap();

        assert_eq!(executor.limiter().in_flight(), 0);
    }
}
