//! Intercepted requests and the network they fall through to

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::Method;
use reqwest::Client;
use url::Url;

use super::WorkerError;
use super::storage::StoredResponse;
use crate::clock::{Clock, SystemClock};

/// What kind of resource a request loads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Top-level navigation
    Document,
    /// Script
    Script,
    /// Stylesheet
    Style,
    /// Image
    Image,
    /// Web font
    Font,
    /// Web app manifest
    Manifest,
    /// `fetch()`/XHR and everything else
    Other,
}

impl Destination {
    /// Parse a `Sec-Fetch-Dest` header value
    #[must_use]
    pub fn from_fetch_dest(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "document" | "iframe" | "frame" => Self::Document,
            "script" | "worker" | "sharedworker" => Self::Script,
            "style" => Self::Style,
            "image" => Self::Image,
            "font" => Self::Font,
            "manifest" => Self::Manifest,
            _ => Self::Other,
        }
    }
}

/// A request seen by the offline cache controller
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL
    pub url: Url,
    /// Resource type
    pub destination: Destination,
    /// Headers forwarded to the network
    pub headers: Vec<(String, String)>,
    /// Request body; empty for GET
    pub body: Vec<u8>,
}

impl WorkerRequest {
    /// A GET request with no extra headers
    #[must_use]
    pub fn get(url: Url, destination: Destination) -> Self {
        Self {
            method: Method::GET,
            url,
            destination,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Store key: the URL without its fragment
    #[must_use]
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.into()
    }
}

/// How the network should treat intermediate HTTP caches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Normal fetch
    Default,
    /// Bypass intermediate caches and go to the origin
    Reload,
}

/// Network the controller falls through to
///
/// Implementations resolve with any HTTP response, successful or not, and
/// fail only when no response was obtained at all.
#[async_trait]
pub trait Network: Send + Sync {
    /// Perform `request`
    async fn fetch(&self, request: &WorkerRequest, mode: FetchMode) -> Result<StoredResponse, WorkerError>;
}

/// Headers worth forwarding from an intercepted request
const FORWARDED_HEADERS: &[&str] = &[
    "accept",
    "accept-language",
    "authorization",
    "content-type",
    "if-none-match",
    "if-modified-since",
    "user-agent",
];

/// [`Network`] backed by an HTTP client
pub struct HttpNetwork {
    client: Client,
    clock: Arc<dyn Clock>,
}

impl HttpNetwork {
    /// Create a network with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            clock: Arc::new(SystemClock),
        })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &WorkerRequest, mode: FetchMode) -> Result<StoredResponse, WorkerError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in &request.headers {
            if FORWARDED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        if mode == FetchMode::Reload {
            builder = builder
                .header("cache-control", "no-cache")
                .header("pragma", "no-cache");
        }

        let response = builder
            .send()
            .await
            .map_err(|e| WorkerError::Network(format!("{} {}: {e}", request.method, request.url)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| WorkerError::Network(format!("Failed to read body of {}: {e}", request.url)))?;

        Ok(StoredResponse {
            status,
            headers,
            body: body.to_vec(),
            stored_at: self.clock.now_ms(),
        })
    }
}
