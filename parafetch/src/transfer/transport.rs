//! HTTP transport abstraction for range requests.
//!
//! [`RangeTransport`] is the seam between the engine and the network. The
//! engine only needs two things from it: a probe that reports the object's
//! size and whether ranges are honoured, and a ranged GET that yields the
//! body in pieces. [`ReqwestTransport`] is the production implementation;
//! tests inject in-memory transports.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::error::{ConfigError, FetchError};

/// Boxed future type for dyn-compatible async traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// =============================================================================
// Transport Seam
// =============================================================================

/// Byte interval requested from the server.
///
/// `end` is exclusive; `None` asks for everything from `start` onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeRequest {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Value for the `Range` header, or `None` when the whole object is
    /// requested.
    ///
    /// HTTP ranges are inclusive, so `[start, end)` renders as
    /// `bytes=start-(end-1)`.
    pub fn header_value(&self) -> Option<String> {
        match self.end {
            Some(end) if end > self.start => Some(format!("bytes={}-{}", self.start, end - 1)),
            Some(_) => Some(format!("bytes={}-{}", self.start, self.start)),
            None if self.start == 0 => None,
            None => Some(format!("bytes={}-", self.start)),
        }
    }
}

/// What a probe learned about the remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeInfo {
    /// Total size, if the server reported it.
    pub total_size: Option<u64>,
    /// Whether the server answered a range request with 206.
    pub accepts_ranges: bool,
}

/// Response body of one range request.
pub trait RangeBody: Send {
    /// HTTP status code of the response.
    fn status(&self) -> u16;

    /// Next piece of the body, or `None` at end of stream.
    fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, FetchError>>;
}

/// Network seam used by the engine.
pub trait RangeTransport: Send + Sync {
    /// Discovers size and range support for `url`.
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ProbeInfo, FetchError>>;

    /// Issues a GET for `range`. Status checking is left to the caller.
    fn get<'a>(
        &'a self,
        url: &'a str,
        range: RangeRequest,
    ) -> BoxFuture<'a, Result<Box<dyn RangeBody>, FetchError>>;
}

/// Extracts the complete length from a `Content-Range` value such as
/// `bytes 0-0/1234` or `bytes */1234`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

// =============================================================================
// Reqwest Transport
// =============================================================================

/// [`RangeTransport`] backed by an async reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with default timeouts and no proxy.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_config(&EngineConfig::default())
    }

    /// Builds the client from engine settings: connect timeout, user agent
    /// and optional proxy.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone());

        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy.url())
                .map_err(|e| ConfigError::Invalid(format!("invalid proxy {}: {}", proxy.url(), e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn probe_url(&self, url: &str) -> Result<ProbeInfo, FetchError> {
        let response = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let content_range_total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);

        let info = match status {
            StatusCode::PARTIAL_CONTENT => ProbeInfo {
                total_size: content_range_total,
                accepts_ranges: true,
            },
            StatusCode::OK => ProbeInfo {
                total_size: response.content_length(),
                accepts_ranges: false,
            },
            // An empty object cannot satisfy bytes=0-0.
            StatusCode::RANGE_NOT_SATISFIABLE if content_range_total == Some(0) => ProbeInfo {
                total_size: Some(0),
                accepts_ranges: true,
            },
            other => return Err(FetchError::from_status(other.as_u16())),
        };

        debug!(
            url = %url,
            status = status.as_u16(),
            total_size = ?info.total_size,
            accepts_ranges = info.accepts_ranges,
            "Probed remote object"
        );
        Ok(info)
    }

    async fn get_range(
        &self,
        url: &str,
        range: RangeRequest,
    ) -> Result<Box<dyn RangeBody>, FetchError> {
        let mut request = self.client.get(url);
        if let Some(value) = range.header_value() {
            trace!(url = %url, range = %value, "Requesting range");
            request = request.header(RANGE, value);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;
        Ok(Box::new(ReqwestBody { response }))
    }
}

impl RangeTransport for ReqwestTransport {
    fn probe<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<ProbeInfo, FetchError>> {
        Box::pin(self.probe_url(url))
    }

    fn get<'a>(
        &'a self,
        url: &'a str,
        range: RangeRequest,
    ) -> BoxFuture<'a, Result<Box<dyn RangeBody>, FetchError>> {
        Box::pin(self.get_range(url, range))
    }
}

struct ReqwestBody {
    response: reqwest::Response,
}

impl RangeBody for ReqwestBody {
    fn status(&self) -> u16 {
        self.response.status().as_u16()
    }

    fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, FetchError>> {
        Box::pin(async move { self.response.chunk().await.map_err(map_reqwest_error) })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if let Some(status) = err.status() {
        return FetchError::from_status(status.as_u16());
    }
    if err.is_timeout() {
        return FetchError::Network(format!("timed out: {}", err));
    }
    FetchError::Network(err.to_string())
}

// =============================================================================
// Tests
// =============================================================================
