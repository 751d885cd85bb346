//! Spreadsheet upstream client
//!
//! Talks to the Google Sheets v4 REST API with an API key passed as a query
//! parameter. Credentials are never logged or echoed in errors.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::UpstreamConfig;
use crate::failsafe::UpstreamQuota;
use crate::{Error, Result};

/// Cell values of one sheet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetValues {
    /// A1 range the upstream reported for the data
    pub range: String,
    /// Rows of cell values, rendered as strings
    pub values: Vec<Vec<String>>,
}

/// Source of spreadsheet data
#[async_trait]
pub trait SheetSource: Send + Sync {
    /// Titles of every sheet in the spreadsheet
    async fn fetch_list(&self) -> Result<Vec<String>>;

    /// All cell values of one sheet
    async fn fetch_values(&self, sheet: &str) -> Result<SheetValues>;
}

/// HTTP client for the spreadsheet API
pub struct SheetsClient {
    client: Client,
    base_url: Url,
    api_key: String,
    spreadsheet_id: String,
    quota: UpstreamQuota,
}

impl SheetsClient {
    /// Create a client, failing with [`Error::ConfigurationMissing`] when
    /// the API key or spreadsheet id is absent
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| Error::ConfigurationMissing("upstream API key".to_string()))?;
        let spreadsheet_id = config
            .resolve_spreadsheet_id()
            .ok_or_else(|| Error::ConfigurationMissing("spreadsheet id".to_string()))?;

        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("Invalid upstream base_url: {e}")))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("sheet-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            api_key,
            spreadsheet_id,
            quota: UpstreamQuota::per_minute(config.max_requests_per_minute),
        })
    }

    /// Build `{base}/v4/spreadsheets/{id}[/values/{sheet}]`
    fn spreadsheet_url(&self, sheet: Option<&str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| Error::Config("Upstream base_url cannot be a base".to_string()))?;
            segments
                .pop_if_empty()
                .extend(["v4", "spreadsheets", &self.spreadsheet_id]);
            if let Some(sheet) = sheet {
                segments.extend(["values", sheet]);
            }
        }
        Ok(url)
    }

    async fn get_json(&self, url: Url, query: &[(&str, &str)]) -> Result<Value> {
        self.quota.acquire().await;

        debug!(path = %url.path(), "Upstream request");
        let response = self
            .client
            .get(url)
            .query(&[("key", self.api_key.as_str())])
            .query(query)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(describe_transport_error(&e)))?;

        handle_response(response).await
    }
}

#[async_trait]
impl SheetSource for SheetsClient {
    async fn fetch_list(&self) -> Result<Vec<String>> {
        let url = self.spreadsheet_url(None)?;
        let body = self
            .get_json(url, &[("fields", "sheets.properties.title")])
            .await?;

        let titles = body
            .get("sheets")
            .and_then(Value::as_array)
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|s| s.pointer("/properties/title").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(titles)
    }

    async fn fetch_values(&self, sheet: &str) -> Result<SheetValues> {
        let url = self.spreadsheet_url(Some(sheet))?;
        let body = self.get_json(url, &[]).await?;
        Ok(parse_values(sheet, &body))
    }
}

/// Source installed when credentials are missing at startup
///
/// Every call fails with [`Error::ConfigurationMissing`] without touching
/// the network, so the router still answers with a misconfiguration error.
pub struct UnconfiguredSource {
    reason: String,
}

impl UnconfiguredSource {
    /// Create a source that reports `reason` on every call
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SheetSource for UnconfiguredSource {
    async fn fetch_list(&self) -> Result<Vec<String>> {
        Err(Error::ConfigurationMissing(self.reason.clone()))
    }

    async fn fetch_values(&self, _sheet: &str) -> Result<SheetValues> {
        Err(Error::ConfigurationMissing(self.reason.clone()))
    }
}

/// Map a non-success status to [`Error::UpstreamRejected`], otherwise decode JSON
async fn handle_response(response: Response) -> Result<Value> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<Value>()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("Failed to read upstream body: {e}")));
    }

    let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| {
            body.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        warn!(status = status.as_u16(), "Upstream denied access");
    }

    Err(Error::UpstreamRejected {
        status: status.as_u16(),
        message,
    })
}

fn describe_transport_error(e: &reqwest::Error) -> String {
    // Strip the URL: it carries the API key as a query parameter
    let kind = if e.is_timeout() {
        "timed out"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    format!("Upstream {kind}")
}

fn parse_values(sheet: &str, body: &Value) -> SheetValues {
    let range = body
        .get("range")
        .and_then(Value::as_str)
        .unwrap_or(sheet)
        .to_string();

    let values = body
        .get("values")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    row.as_array()
                        .map(|cells| cells.iter().map(cell_to_string).collect())
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default();

    SheetValues { range, values }
}

fn cell_to_string(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
