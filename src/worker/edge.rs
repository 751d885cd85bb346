//! Edge host
//!
//! An HTTP front placed before the application origin. Every request is
//! offered to the [`OfflineCacheController`]; intercepted requests are
//! answered by it and the rest go straight to the origin. Control routes
//! under `/__worker/` stand in for the page-to-worker message channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    AGE_SWEEP_INTERVAL, Destination, FetchMode, FetchOutcome, HttpNetwork, LoggingClientHost,
    MemoryCacheStorage, Network, Notification, OfflineCacheController, StoredResponse, WorkerError,
    WorkerMessage, WorkerRequest, WorkerState,
};
use crate::config::Config;
use crate::gateway::shutdown_signal;
use crate::{Error, Result};

/// Response header naming where the edge host got the response from
pub const X_OFFLINE_CACHE: HeaderName = HeaderName::from_static("x-offline-cache");

/// Source tag for requests the controller did not intercept
pub const PASSTHROUGH: &str = "passthrough";

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// State shared by the edge routes
pub struct EdgeState {
    /// Controller every request is offered to
    pub controller: Arc<OfflineCacheController>,
    /// Network used for requests the controller passes through
    pub network: Arc<dyn Network>,
}

/// Create the edge router
pub fn create_edge_router(state: Arc<EdgeState>, request_timeout: Duration) -> Router {
    #[allow(deprecated)]
    let timeout = TimeoutLayer::new(request_timeout);

    Router::new()
        .route("/__worker/state", get(state_handler))
        .route("/__worker/message", post(message_handler))
        .route("/__worker/sync/{tag}", post(sync_handler))
        .route("/__worker/push", post(push_handler))
        .route("/__worker/notification-click", post(click_handler))
        .fallback(intercept_handler)
        .layer(timeout)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn state_handler(State(state): State<Arc<EdgeState>>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.controller.state(),
        "version": state.controller.version(),
    }))
}

async fn message_handler(
    State(state): State<Arc<EdgeState>>,
    Json(message): Json<WorkerMessage>,
) -> Response {
    match state.controller.handle_message(&message).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => worker_error_response(&e),
    }
}

async fn sync_handler(
    State(state): State<Arc<EdgeState>>,
    Path(tag): Path<String>,
) -> Json<serde_json::Value> {
    let handled = state.controller.handle_sync(&tag).await;
    Json(json!({ "tag": tag, "handled": handled }))
}

async fn push_handler(State(state): State<Arc<EdgeState>>, body: Bytes) -> Json<Notification> {
    Json(state.controller.handle_push(Some(body.as_ref())).await)
}

async fn click_handler(
    State(state): State<Arc<EdgeState>>,
    Json(notification): Json<Notification>,
) -> Json<serde_json::Value> {
    let outcome = state.controller.handle_notification_click(&notification).await;
    Json(json!({ "outcome": outcome }))
}

fn worker_error_response(e: &WorkerError) -> Response {
    let status = match e {
        WorkerError::Lifecycle { .. } => StatusCode::CONFLICT,
        WorkerError::Timeout(..) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

/// Offer the request to the controller, or send it to the origin
async fn intercept_handler(State(state): State<Arc<EdgeState>>, request: Request<Body>) -> Response {
    let request = match into_worker_request(state.controller.origin(), request).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    match state.controller.handle_fetch(&request).await {
        FetchOutcome::Respond { response, source } => into_http(&response, source.as_str()),
        FetchOutcome::Passthrough => match state.network.fetch(&request, FetchMode::Default).await {
            Ok(response) => into_http(&response, PASSTHROUGH),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Origin unreachable");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "error": "The origin could not be reached.", "offline": true })),
                )
                    .into_response()
            }
        },
    }
}

/// Rebase the incoming request onto the controller's origin
async fn into_worker_request(
    origin: &Url,
    request: Request<Body>,
) -> std::result::Result<WorkerRequest, Response> {
    let (parts, body) = request.into_parts();

    let mut url = origin.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response())?;

    let headers = parts
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    Ok(WorkerRequest {
        method: parts.method,
        destination: destination_of(&parts.headers),
        url,
        headers,
        body: body.to_vec(),
    })
}

/// Resource type from `Sec-Fetch-Dest`, else `Accept: text/html` for navigations
fn destination_of(headers: &HeaderMap) -> Destination {
    if let Some(dest) = headers.get("sec-fetch-dest").and_then(|v| v.to_str().ok()) {
        return Destination::from_fetch_dest(dest);
    }
    let wants_html = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"));
    if wants_html {
        Destination::Document
    } else {
        Destination::Other
    }
}

fn into_http(stored: &StoredResponse, source: &'static str) -> Response {
    let mut response = Response::new(Body::from(stored.body.clone()));
    *response.status_mut() = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let headers = response.headers_mut();
    for (name, value) in stored.replay_headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers.insert(X_OFFLINE_CACHE, HeaderValue::from_static(source));
    response
}

/// Edge host server
pub struct EdgeHost {
    config: Config,
    state: Arc<EdgeState>,
}

impl EdgeHost {
    /// Create an edge host with in-memory stores and an HTTP network
    pub fn new(config: Config) -> Result<Self> {
        let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(config.server.request_timeout)?);
        let controller = OfflineCacheController::new(
            &config.worker,
            Arc::new(MemoryCacheStorage::new()),
            Arc::clone(&network),
            Arc::new(LoggingClientHost),
        )?;

        Ok(Self {
            config,
            state: Arc::new(EdgeState {
                controller: Arc::new(controller),
                network,
            }),
        })
    }

    /// Install and activate the controller, then serve until Ctrl-C or SIGTERM
    ///
    /// A failed install or activation leaves the controller redundant; the
    /// host keeps serving with every request passed through.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.worker.edge_port,
        );

        let controller = &self.state.controller;
        if let Err(e) = controller.install().await {
            warn!(error = %e, "Install failed, passing all requests through");
        }
        if controller.should_activate() {
            if let Err(e) = controller.activate().await {
                warn!(error = %e, "Activation failed, passing all requests through");
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        spawn_age_sweeper(controller, &shutdown_tx);

        let app = create_edge_router(Arc::clone(&self.state), self.config.server.request_timeout);
        let listener = TcpListener::bind(addr).await?;

        info!(
            origin = %controller.origin(),
            version = %controller.version(),
            active = controller.state() == WorkerState::Activated,
            "Edge host listening on http://{addr}"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        controller.wait_for_background().await;
        Ok(())
    }
}

/// Start the hourly age-based sweep of the named stores
pub fn spawn_age_sweeper(controller: &Arc<OfflineCacheController>, shutdown_tx: &broadcast::Sender<()>) {
    let controller = Arc::clone(controller);
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(AGE_SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match controller.sweep_expired().await {
                        Ok(removed) => debug!(removed, "Age sweep finished"),
                        Err(e) => warn!(error = %e, "Age sweep failed"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}
