//! HTTP router and handlers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Query, State},
    http::{HeaderName, HeaderValue, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use super::client::client_identifier;
use crate::cache::{LIST_KEY, LIST_TTL, MAX_CACHE_SIZE, SHEET_TTL, TtlCache, sheet_key};
use crate::failsafe::{RateDecision, RateLimitPolicy, RateLimiter};
use crate::upstream::{SheetSource, SheetValues};
use crate::{Error, Result};

/// `Cache-Control` sent with successful sheet responses
pub const CACHE_CONTROL_VALUE: &str = "public, s-maxage=300, stale-while-revalidate=600";

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Payload stored in the response cache
#[derive(Debug, Clone, PartialEq)]
pub enum CachedPayload {
    /// Sheet titles
    List(Vec<String>),
    /// Values of one sheet
    Sheet(SheetValues),
}

impl CachedPayload {
    fn to_json(&self, cached: bool) -> serde_json::Value {
        match self {
            Self::List(sheets) => json!({ "sheets": sheets, "cached": cached }),
            Self::Sheet(data) => json!({
                "values": data.values,
                "range": data.range,
                "cached": cached,
            }),
        }
    }
}

/// Shared application state
///
/// The limiter and cache are owned here rather than living in globals so
/// each router instance (and each test) gets its own.
pub struct AppState {
    /// Per-client rate limiter
    pub limiter: Arc<RateLimiter>,
    /// Response cache
    pub cache: Arc<TtlCache<CachedPayload>>,
    /// Spreadsheet data source
    pub source: Arc<dyn SheetSource>,
}

impl AppState {
    /// State with the default limiter policy and cache bounds
    #[must_use]
    pub fn new(source: Arc<dyn SheetSource>) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::new(RateLimitPolicy::default())),
            cache: Arc::new(TtlCache::new(SHEET_TTL, MAX_CACHE_SIZE)),
            source,
        }
    }
}

/// Which resource a sheets request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
enum SheetRequest {
    List,
    Sheet(String),
}

impl SheetRequest {
    fn cache_key(&self) -> String {
        match self {
            Self::List => LIST_KEY.to_string(),
            Self::Sheet(name) => sheet_key(name),
        }
    }

    fn ttl(&self) -> Duration {
        match self {
            Self::List => LIST_TTL,
            Self::Sheet(_) => SHEET_TTL,
        }
    }
}

/// Query string of `GET /api/sheets`
#[derive(Debug, Default, Deserialize)]
struct SheetsQuery {
    action: Option<String>,
    sheet: Option<String>,
}

impl SheetsQuery {
    fn into_request(self) -> Result<SheetRequest> {
        if self.action.as_deref() == Some("list") {
            return Ok(SheetRequest::List);
        }
        match self.sheet.map(|s| s.trim().to_string()) {
            Some(name) if !name.is_empty() => Ok(SheetRequest::Sheet(name)),
            _ => Err(Error::ValidationFailed(
                "either action=list or sheet is required".to_string(),
            )),
        }
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            X_RATELIMIT_LIMIT,
            X_RATELIMIT_REMAINING,
            X_RATELIMIT_RESET,
            X_CACHE,
            header::RETRY_AFTER,
        ]);

    #[allow(deprecated)]
    let timeout = TimeoutLayer::new(request_timeout);

    // The sheets route sits outside the timeout layer and enforces its own
    // deadline, so a slow upstream still gets rate-limit headers.
    Router::new()
        .route("/health", get(health_handler))
        .fallback(fallback_handler)
        .layer(timeout)
        .route(
            "/api/sheets",
            get(move |state: State<Arc<AppState>>, request: Request<Body>| {
                sheets_handler(state, request, request_timeout)
            })
            .options(preflight_handler),
        )
        .layer(cors)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /api/sheets` handler
async fn sheets_handler(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    request_timeout: Duration,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identifier(request.headers(), peer);

    let decision = state.limiter.check(&client);
    let mut response = if decision.allowed {
        let query = Query::<SheetsQuery>::try_from_uri(request.uri())
            .map(|Query(q)| q)
            .unwrap_or_default();
        let served = tokio::time::timeout(request_timeout, serve_sheets(&state, query))
            .await
            .unwrap_or_else(|_| {
                Err(Error::UpstreamUnavailable(format!(
                    "no answer within {}s",
                    request_timeout.as_secs_f32()
                )))
            });
        match served {
            Ok(response) => response,
            Err(e) => {
                log_failure(&client, &e);
                e.into_response()
            }
        }
    } else {
        warn!(client = %client, reset_at = decision.reset_at, "Rate limit exceeded");
        Error::RateLimited {
            retry_after_secs: decision.retry_after_secs(state.limiter.now_ms()),
        }
        .into_response()
    };

    apply_rate_limit_headers(&mut response, &decision);
    response
}

/// Validate, consult the cache, fall back to the upstream, write through
async fn serve_sheets(state: &AppState, query: SheetsQuery) -> Result<Response> {
    let request = query.into_request()?;
    let key = request.cache_key();

    if let Some(payload) = state.cache.get(&key) {
        debug!(key = %key, "Cache hit");
        return Ok(payload_response(&payload, true));
    }

    debug!(key = %key, "Cache miss, fetching upstream");
    let payload = match &request {
        SheetRequest::List => CachedPayload::List(state.source.fetch_list().await?),
        SheetRequest::Sheet(name) => CachedPayload::Sheet(state.source.fetch_values(name).await?),
    };
    state.cache.set_with_ttl(&key, payload.clone(), request.ttl());

    Ok(payload_response(&payload, false))
}

fn payload_response(payload: &CachedPayload, cached: bool) -> Response {
    (
        StatusCode::OK,
        [
            (header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_VALUE)),
            (
                X_CACHE,
                HeaderValue::from_static(if cached { "HIT" } else { "MISS" }),
            ),
        ],
        Json(payload.to_json(cached)),
    )
        .into_response()
}

fn apply_rate_limit_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_secs()));
}

fn log_failure(client: &str, e: &Error) {
    if e.is_retryable() {
        warn!(client = %client, code = e.code(), error = %e, "Sheets request failed, retryable");
    } else if e.status_code().is_server_error() {
        error!(client = %client, code = e.code(), error = %e, "Sheets request failed");
    } else {
        info!(client = %client, code = e.code(), error = %e, "Sheets request rejected");
    }
}

/// CORS preflight; answered before any rate limiting
async fn preflight_handler() -> StatusCode {
    StatusCode::OK
}

async fn fallback_handler(method: Method) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Not found", "details": "not_found", "offline": false })),
    )
        .into_response()
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "cache": state.cache.stats(),
        "rate_limiter": {
            "limit": state.limiter.limit(),
            "active_clients": state.limiter.active_clients(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(action: Option<&str>, sheet: Option<&str>) -> SheetsQuery {
        SheetsQuery {
            action: action.map(str::to_string),
            sheet: sheet.map(str::to_string),
        }
    }

    #[test]
    fn list_action_takes_precedence() {
        assert_eq!(
            query(Some("list"), Some("Roster")).into_request().unwrap(),
            SheetRequest::List
        );
    }

    #[test]
    fn sheet_name_is_trimmed() {
        assert_eq!(
            query(None, Some("  Roster ")).into_request().unwrap(),
            SheetRequest::Sheet("Roster".to_string())
        );
    }

    #[test]
    fn missing_parameters_fail_validation() {
        for q in [query(None, None), query(Some("other"), None), query(None, Some(" "))] {
            assert!(matches!(q.into_request(), Err(Error::ValidationFailed(_))));
        }
    }

    #[test]
    fn cache_keys() {
        assert_eq!(SheetRequest::List.cache_key(), "list");
        assert_eq!(
            SheetRequest::Sheet("Roster".into()).cache_key(),
            "sheet:Roster"
        );
    }

    #[test]
    fn payload_shapes() {
        let list = CachedPayload::List(vec!["A".into()]).to_json(true);
        assert_eq!(list, json!({"sheets": ["A"], "cached": true}));

        let sheet = CachedPayload::Sheet(SheetValues {
            range: "A!A1:B1".into(),
            values: vec![vec!["x".into(), "y".into()]],
        })
        .to_json(false);
        assert_eq!(
            sheet,
            json!({"values": [["x", "y"]], "range": "A!A1:B1", "cached": false})
        );
    }
}
