//! HTTP transport abstraction
//!
//! [`HttpTransport`] performs exactly one physical request. Retry, timeouts,
//! cancellation and the concurrency cap are layered on top by
//! [`RequestExecutor`](crate::executor::RequestExecutor). Dropping the future
//! returned by [`HttpTransport::send`] aborts the request.

use crate::error::Result;
use crate::fault::Fault;
use async_trait::async_trait;
use bytes::Bytes;

/// Outbound request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    /// Upper-case request method (e.g. "GET")
    pub method: String,
    /// Target URL
    pub url: String,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
    /// Optional request body
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// A body-less GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// Inbound response, fully buffered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers (names lower-cased)
    pub headers: Vec<(String, String)>,
    /// Response payload
    pub body: Bytes,
}

impl HttpResponse {
    /// True for 2xx statuses
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First value of the header `name` (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Payload decoded as (lossy) UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Performs a single HTTP request
///
/// Implementations map connection-level problems, including any deadline of
/// their own, to [`FaultKind::Network`](crate::fault::FaultKind::Network).
/// [`FaultKind::Timeout`](crate::fault::FaultKind::Timeout) belongs to the
/// retry layer's per-attempt deadline. A non-2xx status is not a failure at
/// this layer.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `request` and buffer the whole response
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, Fault>;
}

/// Production [`HttpTransport`] backed by `reqwest`
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport sending `user_agent` with every request
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, Fault> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| Fault::invalid_request(&url, e))?;

        let mut builder = self.client.request(method, &url);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| map_reqwest_error(&url, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(&url, e))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(url: &str, e: reqwest::Error) -> Fault {
    if e.is_builder() {
        Fault::invalid_request(url, e)
    } else {
        Fault::network(url, e)
    }
}
