//! Tests for the offline cache controller behind the edge host

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

use sheet_gateway::config::WorkerConfig;
use sheet_gateway::worker::edge::{EdgeState, X_OFFLINE_CACHE, create_edge_router};
use sheet_gateway::worker::{
    CacheStorage, FetchMode, LoggingClientHost, MemoryCacheStorage, Network, OfflineCacheController,
    StoredResponse, WorkerError, WorkerRequest, WorkerState,
};

const ORIGIN: &str = "http://app.test";

/// Origin stand-in: a fixed table of pages that can be taken offline
#[derive(Default)]
struct ScriptedOrigin {
    pages: Mutex<HashMap<String, StoredResponse>>,
    seen: Mutex<Vec<(Method, String)>>,
    offline: AtomicBool,
}

impl ScriptedOrigin {
    fn serve(&self, path: &str, content_type: &str, body: &str) {
        self.pages.lock().insert(
            format!("{ORIGIN}{path}"),
            StoredResponse::with_body(200, content_type, body, 0),
        );
    }
}

#[async_trait]
impl Network for ScriptedOrigin {
    async fn fetch(&self, request: &WorkerRequest, _mode: FetchMode) -> Result<StoredResponse, WorkerError> {
        self.seen.lock().push((request.method.clone(), request.cache_key()));
        if self.offline.load(Ordering::SeqCst) {
            return Err(WorkerError::Network("connection refused".into()));
        }
        Ok(self
            .pages
            .lock()
            .get(&request.cache_key())
            .cloned()
            .unwrap_or_else(|| StoredResponse::with_body(404, "text/plain", "not found", 0)))
    }
}

struct Edge {
    router: Router,
    controller: Arc<OfflineCacheController>,
    origin: Arc<ScriptedOrigin>,
    storage: Arc<MemoryCacheStorage>,
}

async fn edge(activate: bool) -> Edge {
    let origin = Arc::new(ScriptedOrigin::default());
    origin.serve("/", "text/html", "<html>shell</html>");
    origin.serve("/index.html", "text/html", "<html>shell</html>");
    origin.serve("/css/styles.css", "text/css", "body{}");
    origin.serve("/js/app.js", "text/javascript", "main()");

    let storage = Arc::new(MemoryCacheStorage::new());
    let config = WorkerConfig {
        origin: ORIGIN.to_string(),
        ..WorkerConfig::default()
    };
    let controller = Arc::new(
        OfflineCacheController::new(
            &config,
            storage.clone(),
            origin.clone(),
            Arc::new(LoggingClientHost),
        )
        .unwrap(),
    );

    if activate {
        let report = controller.install().await.unwrap();
        assert_eq!(report.cached, 4);
        assert_eq!(report.failed.len(), 2);
        controller.activate().await.unwrap();
    }

    let router = create_edge_router(
        Arc::new(EdgeState {
            controller: controller.clone(),
            network: origin.clone(),
        }),
        Duration::from_secs(5),
    );
    Edge {
        router,
        controller,
        origin,
        storage,
    }
}

fn navigate(path: &str) -> Request<Body> {
    Request::get(path)
        .header(header::ACCEPT, "text/html,application/xhtml+xml")
        .body(Body::empty())
        .unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn source(response: &Response) -> &str {
    response
        .headers()
        .get(X_OFFLINE_CACHE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

// ============================================================================
// Fetch strategies
// ============================================================================

#[tokio::test]
async fn test_offline_navigation_serves_root_document() {
    let edge = edge(true).await;
    edge.origin.offline.store(true, Ordering::SeqCst);

    let response = edge.router.oneshot(navigate("/reports/weekly")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(source(&response), "root-fallback");
    assert_eq!(body_string(response).await, "<html>shell</html>");
}

#[tokio::test]
async fn test_online_navigation_comes_from_network() {
    let edge = edge(true).await;
    edge.origin.serve("/reports/weekly", "text/html", "<html>weekly</html>");

    let response = edge.router.clone().oneshot(navigate("/reports/weekly")).await.unwrap();
    assert_eq!(source(&response), "network");
    assert_eq!(body_string(response).await, "<html>weekly</html>");

    edge.origin.offline.store(true, Ordering::SeqCst);
    let response = edge.router.oneshot(navigate("/reports/weekly")).await.unwrap();
    assert_eq!(source(&response), "cache");
    assert_eq!(body_string(response).await, "<html>weekly</html>");
}

#[tokio::test]
async fn test_api_offline_without_copy_is_json_503() {
    let edge = edge(true).await;
    edge.origin.offline.store(true, Ordering::SeqCst);

    let response = edge
        .router
        .oneshot(Request::get("/api/sheets?sheet=Roster").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(source(&response), "offline");

    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["offline"], true);
}

#[tokio::test]
async fn test_static_asset_served_from_install_cache() {
    let edge = edge(true).await;
    edge.origin.offline.store(true, Ordering::SeqCst);

    let response = edge
        .router
        .oneshot(Request::get("/css/styles.css").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(source(&response), "cache");
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/css"
    );
    assert_eq!(body_string(response).await, "body{}");
    edge.controller.wait_for_background().await;
}

#[tokio::test]
async fn test_requests_pass_through_before_activation() {
    let edge = edge(false).await;
    assert_eq!(edge.controller.state(), WorkerState::Parsed);

    let response = edge.router.oneshot(navigate("/")).await.unwrap();
    assert_eq!(source(&response), "passthrough");
    assert!(edge.storage.store_names().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_post_passes_through_with_body() {
    let edge = edge(true).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/feedback")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"ok":true}"#))
        .unwrap();
    let response = edge.router.oneshot(request).await.unwrap();
    assert_eq!(source(&response), "passthrough");
    assert_eq!(
        edge.origin.seen.lock().last().cloned(),
        Some((Method::POST, format!("{ORIGIN}/api/feedback")))
    );
}

#[tokio::test]
async fn test_passthrough_to_unreachable_origin_is_bad_gateway() {
    let edge = edge(false).await;
    edge.origin.offline.store(true, Ordering::SeqCst);

    let response = edge.router.oneshot(navigate("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

// ============================================================================
// Control routes
// ============================================================================

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_version_and_clear_cache_messages() {
    let edge = edge(true).await;

    let response = edge
        .router
        .clone()
        .oneshot(post_json("/__worker/message", &json!({"type": "GET_VERSION"})))
        .await
        .unwrap();
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body, json!({"type": "VERSION", "version": "v1"}));

    let response = edge
        .router
        .oneshot(post_json("/__worker/message", &json!({"type": "CLEAR_CACHE"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(edge.storage.store_names().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_skip_waiting_message_activates_installed_worker() {
    let edge = edge(false).await;
    edge.controller.install().await.unwrap();

    let response = edge
        .router
        .oneshot(post_json("/__worker/message", &json!({"type": "SKIP_WAITING"})))
        .await
        .unwrap();
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body, json!({"type": "SKIP_WAITING", "activated": true}));
    assert_eq!(edge.controller.state(), WorkerState::Activated);
}

#[tokio::test]
async fn test_sync_and_push_routes() {
    let edge = edge(true).await;

    let response = edge
        .router
        .clone()
        .oneshot(Request::post("/__worker/sync/sync-data").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body, json!({"tag": "sync-data", "handled": true}));

    let response = edge
        .router
        .oneshot(Request::post("/__worker/push").body(Body::from("Roster updated")).unwrap())
        .await
        .unwrap();
    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["body"], "Roster updated");
    assert_eq!(body["url"], "/");
}
