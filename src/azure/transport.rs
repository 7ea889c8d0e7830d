use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;

use crate::utils::errors::{NetworkErrorKind, TransportError};
use crate::utils::retry::{RetryPolicy, Sleeper, TokioSleeper};

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

/// Sends one request with a bearer token and returns whatever status came back.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest, token: &str) -> Result<ApiResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: &ApiRequest, token: &str) -> Result<ApiResponse, TransportError> {
        self.as_ref().send(request, token).await
    }
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("azsql-firewall/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Network {
                kind: NetworkErrorKind::Other,
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

fn classify(err: &reqwest::Error) -> NetworkErrorKind {
    if err.is_timeout() {
        return NetworkErrorKind::TimedOut;
    }
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionReset => return NetworkErrorKind::ConnectionReset,
                io::ErrorKind::ConnectionRefused => return NetworkErrorKind::ConnectionRefused,
                io::ErrorKind::ConnectionAborted => return NetworkErrorKind::ConnectionAborted,
                io::ErrorKind::TimedOut => return NetworkErrorKind::TimedOut,
                io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                    return NetworkErrorKind::HostUnreachable;
                }
                io::ErrorKind::BrokenPipe => return NetworkErrorKind::BrokenPipe,
                _ => {}
            }
        }
        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return NetworkErrorKind::NameResolution;
        }
        source = inner.source();
    }
    NetworkErrorKind::Other
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest, token: &str) -> Result<ApiResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json");
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json; charset=utf-8")
                .json(body);
        }
        let to_error = |e: reqwest::Error| TransportError::Network {
            kind: classify(&e),
            message: e.to_string(),
        };
        let response = builder.send().await.map_err(to_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(to_error)?;
        Ok(ApiResponse { status, body })
    }
}

/// Retries allow-listed failures of the wrapped transport.
pub struct RetryingTransport<T> {
    inner: T,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
}

impl<T: Transport> RetryingTransport<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            sleeper: Arc::new(TokioSleeper),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Once `cancel` fires, in-flight attempts and waits end with
    /// [`TransportError::Cancelled`].
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl<T: Transport> Transport for RetryingTransport<T> {
    async fn send(&self, request: &ApiRequest, token: &str) -> Result<ApiResponse, TransportError> {
        let mut delays = self.policy.delays();
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                outcome = self.inner.send(request, token) => outcome,
            };
            let reason = match &outcome {
                Ok(response) if RetryPolicy::is_retryable_status(response.status) => {
                    Some(format!("status {}", response.status))
                }
                Err(e) if e.is_transient() => Some(e.to_string()),
                _ => None,
            };
            let Some(reason) = reason else {
                return outcome;
            };
            let Some(delay) = delays.next() else {
                tracing::warn!(
                    "{} {} still failing with {} after {} attempts",
                    request.method,
                    request.url,
                    reason,
                    attempt
                );
                return outcome;
            };
            tracing::warn!(
                "{} {} failed with {} (attempt {}/{}), retrying in {:?}",
                request.method,
                request.url,
                reason,
                attempt,
                self.policy.retry_count,
                delay
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = self.sleeper.sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
