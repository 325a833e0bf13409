//! HTTP transport used by every query and fetch.
//!
//! The core only ever issues GET requests through [`Transport`], so tests can
//! swap in a stub and callers can wrap the transport with caching or rate
//! limiting. Retrying server errors is the transport's job, never the core's.

use crate::error::ArchiveError;
use crate::types::TransportConfig;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, warn};

/// A GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    /// Query parameters in order; keys may repeat (e.g. `filter`).
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: impl ToString) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// All values of a query parameter, in order.
    pub fn query_values(&self, key: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First value of a query parameter.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query_values(key).into_iter().next()
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-success status into [`ArchiveError::Http`].
    pub fn error_for_status(self, url: &str) -> Result<Self, ArchiveError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ArchiveError::Http {
                url: url.to_string(),
                status: self.status,
            })
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ArchiveError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Issues GET requests.
///
/// Implementations are shared between concurrent callers, so they must be
/// `Send + Sync`.
pub trait Transport: Send + Sync {
    fn get(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, ArchiveError>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn get(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, ArchiveError>> + Send {
        (**self).get(request)
    }
}

/// [`Transport`] backed by a pooled `reqwest` client, retrying server errors
/// and connection failures with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> Result<Self, ArchiveError> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_connections)
            .user_agent(concat!("webrefine/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<HttpResponse, ArchiveError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(HttpResponse { status, body })
    }
}

impl Transport for ReqwestTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, ArchiveError> {
        debug!("GET {} {:?}", request.url, request.query);

        let retry_strategy = ExponentialBackoff::from_millis(2)
            .factor(self.config.backoff_factor_ms)
            .map(jitter)
            .take(self.config.max_retries);

        Retry::spawn(retry_strategy, || {
            let request = &request;
            async move {
                let result = self
                    .send_once(request)
                    .await
                    .and_then(|response| {
                        if response.status >= 500 {
                            Err(ArchiveError::Http {
                                url: request.url.clone(),
                                status: response.status,
                            })
                        } else {
                            Ok(response)
                        }
                    });
                match result {
                    Ok(response) => Ok(response),
                    Err(e) if e.is_transient() => {
                        warn!("Request to {} failed, retrying: {}", request.url, e);
                        RetryError::to_transient(e)
                    }
                    Err(e) => RetryError::to_permanent(e),
                }
            }
        })
        .await
    }
}
