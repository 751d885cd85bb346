//! Lifecycle and request interception
//!
//! Record age for the store sweep counts from when the controller wrote the
//! record (`StoredResponse::stored_at`), not from the response's `Date`
//! header. A response re-fetched in the background starts a new age.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::events::{ClickOutcome, ClientHost, MessageReply, Notification, SYNC_DATA_TAG, WorkerMessage};
use super::network::{Destination, FetchMode, Network, WorkerRequest};
use super::storage::{CacheStorage, StoredResponse};
use super::{STATIC_EXTENSIONS, StoreClass, WorkerError};
use crate::clock::{Clock, SystemClock};
use crate::config::WorkerConfig;

/// Lifecycle state; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Created, install not started
    Parsed,
    /// Populating the static store
    Installing,
    /// Installed and waiting to activate
    Installed,
    /// Cleaning up stale stores
    Activating,
    /// Intercepting requests
    Activated,
    /// Failed a lifecycle phase; never intercepts
    Redundant,
}

/// Strategy chosen for an intercepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Data API: network first, cached copy or offline JSON on failure
    NetworkFirstApi,
    /// Static assets: cached copy first, refreshed in the background
    CacheFirstRefresh,
    /// Navigations: network first, cached page or root document on failure
    NetworkFirstDocument,
    /// Everything else: cached copy first, network on miss
    CacheFirst,
}

/// Where an intercepted response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// Fresh from the network
    Network,
    /// A cached copy of the requested resource
    Cache,
    /// The cached root document standing in for an uncached page
    RootFallback,
    /// Synthesized because nothing else was available
    Offline,
}

impl ResponseSource {
    /// Header-friendly name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cache => "cache",
            Self::RootFallback => "root-fallback",
            Self::Offline => "offline",
        }
    }
}

/// Result of intercepting a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Not intercepted; default network behaviour applies
    Passthrough,
    /// Answered by the controller
    Respond {
        /// Response to deliver
        response: StoredResponse,
        /// Origin of the response
        source: ResponseSource,
    },
}

/// Summary of the install phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    /// Manifest entries stored
    pub cached: usize,
    /// Manifest URLs that could not be stored
    pub failed: Vec<String>,
}

/// Summary of the activate phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
    /// Stale stores deleted
    pub deleted_stores: Vec<String>,
    /// Pages claimed
    pub claimed: usize,
    /// Records removed by the age sweep
    pub swept: usize,
}

/// Offline cache controller
pub struct OfflineCacheController {
    origin: Url,
    version: String,
    manifest: Vec<Url>,
    allowed_hosts: Vec<String>,
    api_prefix: String,
    install_timeout: Duration,
    activate_timeout: Duration,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    clients: Arc<dyn ClientHost>,
    clock: Arc<dyn Clock>,
    state: RwLock<WorkerState>,
    skip_waiting: AtomicBool,
    background: Mutex<JoinSet<()>>,
}

impl OfflineCacheController {
    /// Create a controller in the [`WorkerState::Parsed`] state
    pub fn new(
        config: &WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        clients: Arc<dyn ClientHost>,
    ) -> Result<Self, WorkerError> {
        let origin = Url::parse(&config.origin)
            .map_err(|e| WorkerError::Config(format!("Invalid origin '{}': {e}", config.origin)))?;

        let manifest = config
            .manifest
            .iter()
            .map(|path| {
                origin
                    .join(path)
                    .map_err(|e| WorkerError::Config(format!("Invalid manifest entry '{path}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            origin,
            version: config.version.clone(),
            manifest,
            allowed_hosts: config
                .allowed_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            api_prefix: config.api_prefix.clone(),
            install_timeout: config.install_timeout,
            activate_timeout: config.activate_timeout,
            storage,
            network,
            clients,
            clock: Arc::new(SystemClock),
            state: RwLock::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            background: Mutex::new(JoinSet::new()),
        })
    }

    /// Read time from `clock` instead of the system clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    /// Version tag embedded in store names
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Origin the controller serves
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Name of the current store for `class`
    pub fn store_name(&self, class: StoreClass) -> String {
        class.store_name(&self.version)
    }

    fn begin(&self, action: &'static str, expected: WorkerState, next: WorkerState) -> Result<(), WorkerError> {
        let mut state = self.state.write();
        if *state != expected {
            return Err(WorkerError::Lifecycle {
                action,
                state: *state,
            });
        }
        *state = next;
        Ok(())
    }

    fn finish(&self, next: WorkerState) {
        *self.state.write() = next;
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Populate the static store from the manifest
    ///
    /// Individual fetch failures are logged and reported, never fatal.
    /// Exceeding the install timeout makes the worker redundant.
    pub async fn install(&self) -> Result<InstallReport, WorkerError> {
        self.begin("install", WorkerState::Parsed, WorkerState::Installing)?;
        info!(version = %self.version, entries = self.manifest.len(), "Installing");

        match tokio::time::timeout(self.install_timeout, self.populate_static()).await {
            Ok(Ok(report)) => {
                self.finish(WorkerState::Installed);
                if !report.failed.is_empty() {
                    warn!(failed = ?report.failed, "Some manifest entries were not cached");
                }
                info!(cached = report.cached, "Installed");
                self.skip_waiting();
                Ok(report)
            }
            Ok(Err(e)) => {
                self.finish(WorkerState::Redundant);
                Err(e)
            }
            Err(_) => {
                self.finish(WorkerState::Redundant);
                Err(WorkerError::Timeout("install", self.install_timeout))
            }
        }
    }

    async fn populate_static(&self) -> Result<InstallReport, WorkerError> {
        let store = self.store_name(StoreClass::Static);
        self.storage.open(&store).await?;

        let fetches = self.manifest.iter().map(|url| async move {
            let request = WorkerRequest::get(url.clone(), Destination::Other);
            let result = self.network.fetch(&request, FetchMode::Reload).await;
            (request, result)
        });

        let mut report = InstallReport::default();
        for (request, result) in join_all(fetches).await {
            let key = request.cache_key();
            match result {
                Ok(mut response) if response.is_success() => {
                    response.stored_at = self.clock.now_ms();
                    match self.storage.put(&store, &key, response).await {
                        Ok(()) => report.cached += 1,
                        Err(e) => {
                            warn!(url = %key, error = %e, "Failed to store manifest entry");
                            report.failed.push(key);
                        }
                    }
                }
                Ok(response) => {
                    debug!(url = %key, status = response.status, "Manifest entry not cacheable");
                    report.failed.push(key);
                }
                Err(e) => {
                    debug!(url = %key, error = %e, "Manifest entry fetch failed");
                    report.failed.push(key);
                }
            }
        }
        Ok(report)
    }

    /// Allow activation without waiting for open pages to close
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::Relaxed);
    }

    /// Whether the worker is installed and cleared to activate
    pub fn should_activate(&self) -> bool {
        self.state() == WorkerState::Installed && self.skip_waiting.load(Ordering::Relaxed)
    }

    /// Delete stale stores, claim open pages and sweep aged records
    pub async fn activate(&self) -> Result<ActivateReport, WorkerError> {
        self.begin("activate", WorkerState::Installed, WorkerState::Activating)?;

        match tokio::time::timeout(self.activate_timeout, self.run_activation()).await {
            Ok(Ok(report)) => {
                self.finish(WorkerState::Activated);
                info!(
                    version = %self.version,
                    deleted = report.deleted_stores.len(),
                    claimed = report.claimed,
                    swept = report.swept,
                    "Activated"
                );
                Ok(report)
            }
            Ok(Err(e)) => {
                self.finish(WorkerState::Redundant);
                Err(e)
            }
            Err(_) => {
                self.finish(WorkerState::Redundant);
                Err(WorkerError::Timeout("activate", self.activate_timeout))
            }
        }
    }

    async fn run_activation(&self) -> Result<ActivateReport, WorkerError> {
        let current: Vec<String> = StoreClass::ALL
            .iter()
            .map(|class| self.store_name(*class))
            .collect();

        let mut report = ActivateReport::default();
        for name in self.storage.store_names().await? {
            if !current.contains(&name) {
                self.storage.delete_store(&name).await?;
                debug!(store = %name, "Deleted stale store");
                report.deleted_stores.push(name);
            }
        }
        report.deleted_stores.sort();

        report.claimed = self.clients.claim().await;
        report.swept = self.sweep_expired().await?;
        Ok(report)
    }

    /// Remove records older than their store class allows
    ///
    /// Age is measured from the write time, so an origin `Date` header has no
    /// effect on when a record goes.
    pub async fn sweep_expired(&self) -> Result<usize, WorkerError> {
        let now = self.clock.now_ms();
        let mut removed = 0;

        for class in StoreClass::ALL {
            let store = self.store_name(class);
            #[allow(clippy::cast_possible_truncation)]
            let max_age_ms = class.max_age().as_millis() as u64;

            for key in self.storage.keys(&store).await? {
                let expired = self
                    .storage
                    .get(&store, &key)
                    .await?
                    .is_some_and(|record| record.age_ms(now) > max_age_ms);
                if expired && self.storage.delete(&store, &key).await? {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(removed, "Swept aged records");
        }
        Ok(removed)
    }

    /// Delete every named store
    pub async fn clear_all(&self) -> Result<usize, WorkerError> {
        let mut deleted = 0;
        for name in self.storage.store_names().await? {
            if self.storage.delete_store(&name).await? {
                deleted += 1;
            }
        }
        info!(stores = deleted, "Cleared all stores");
        Ok(deleted)
    }

    // =========================================================================
    // Fetch
    // =========================================================================

    fn is_same_origin(&self, url: &Url) -> bool {
        url.scheme() == self.origin.scheme()
            && url.host_str() == self.origin.host_str()
            && url.port_or_known_default() == self.origin.port_or_known_default()
    }

    fn is_allowed_host(&self, url: &Url) -> bool {
        url.host_str()
            .is_some_and(|host| self.allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)))
    }

    fn has_static_extension(url: &Url) -> bool {
        url.path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|file| file.rsplit_once('.'))
            .is_some_and(|(_, ext)| STATIC_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    /// Pick the strategy for `request`, or `None` when it is not intercepted
    pub fn classify(&self, request: &WorkerRequest) -> Option<Strategy> {
        if request.method != axum::http::Method::GET {
            return None;
        }

        let same_origin = self.is_same_origin(&request.url);
        let allowed_host = self.is_allowed_host(&request.url);
        if !same_origin && !allowed_host {
            return None;
        }

        if same_origin && request.url.path().starts_with(&self.api_prefix) {
            Some(Strategy::NetworkFirstApi)
        } else if allowed_host || Self::has_static_extension(&request.url) {
            Some(Strategy::CacheFirstRefresh)
        } else if request.destination == Destination::Document {
            Some(Strategy::NetworkFirstDocument)
        } else {
            Some(Strategy::CacheFirst)
        }
    }

    /// Intercept a request
    ///
    /// Only an activated controller intercepts. Every intercepted request
    /// resolves to a response; network and storage failures degrade to a
    /// cached copy or a synthesized offline response.
    pub async fn handle_fetch(&self, request: &WorkerRequest) -> FetchOutcome {
        if self.state() != WorkerState::Activated {
            return FetchOutcome::Passthrough;
        }
        let Some(strategy) = self.classify(request) else {
            return FetchOutcome::Passthrough;
        };

        debug!(url = %request.url, ?strategy, "Intercepted");
        let (response, source) = match strategy {
            Strategy::NetworkFirstApi => self.network_first_api(request).await,
            Strategy::CacheFirstRefresh => self.cache_first(request, StoreClass::Static, true).await,
            Strategy::NetworkFirstDocument => self.network_first_document(request).await,
            Strategy::CacheFirst => self.cache_first(request, StoreClass::Dynamic, false).await,
        };
        FetchOutcome::Respond { response, source }
    }

    async fn network_first_api(&self, request: &WorkerRequest) -> (StoredResponse, ResponseSource) {
        let key = request.cache_key();
        match self.network.fetch(request, FetchMode::Default).await {
            Ok(response) => {
                if response.is_success() {
                    self.store(StoreClass::Api, &key, response.clone()).await;
                }
                (response, ResponseSource::Network)
            }
            Err(e) => {
                debug!(url = %key, error = %e, "API fetch failed, trying cache");
                match self.lookup(&key).await {
                    Some(cached) => (cached, ResponseSource::Cache),
                    None => (self.offline_api_response(), ResponseSource::Offline),
                }
            }
        }
    }

    async fn network_first_document(&self, request: &WorkerRequest) -> (StoredResponse, ResponseSource) {
        let key = request.cache_key();
        match self.network.fetch(request, FetchMode::Default).await {
            Ok(response) => {
                if response.is_success() {
                    self.store(StoreClass::Dynamic, &key, response.clone()).await;
                }
                (response, ResponseSource::Network)
            }
            Err(e) => {
                debug!(url = %key, error = %e, "Navigation failed, trying cache");
                if let Some(cached) = self.lookup(&key).await {
                    return (cached, ResponseSource::Cache);
                }
                let root = self.origin.join("/").map(String::from).unwrap_or_default();
                match self.lookup(&root).await {
                    Some(shell) => (shell, ResponseSource::RootFallback),
                    None => (self.offline_placeholder(), ResponseSource::Offline),
                }
            }
        }
    }

    async fn cache_first(
        &self,
        request: &WorkerRequest,
        class: StoreClass,
        refresh: bool,
    ) -> (StoredResponse, ResponseSource) {
        let key = request.cache_key();
        if let Some(cached) = self.lookup(&key).await {
            if refresh {
                self.spawn_refresh(request.clone(), class);
            }
            return (cached, ResponseSource::Cache);
        }

        match self.network.fetch(request, FetchMode::Default).await {
            Ok(response) => {
                if response.is_success() {
                    self.store(class, &key, response.clone()).await;
                }
                (response, ResponseSource::Network)
            }
            Err(e) => {
                debug!(url = %key, error = %e, "Fetch failed with nothing cached");
                (self.offline_placeholder(), ResponseSource::Offline)
            }
        }
    }

    /// Refresh a cached record without blocking the response
    ///
    /// The task is detached; its failures are logged and discarded.
    fn spawn_refresh(&self, request: WorkerRequest, class: StoreClass) {
        let storage = Arc::clone(&self.storage);
        let network = Arc::clone(&self.network);
        let clock = Arc::clone(&self.clock);
        let store = self.store_name(class);

        let mut tasks = self.background.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let key = request.cache_key();
            match network.fetch(&request, FetchMode::Default).await {
                Ok(mut response) if response.is_success() => {
                    response.stored_at = clock.now_ms();
                    if let Err(e) = storage.put(&store, &key, response).await {
                        debug!(url = %key, error = %e, "Background refresh not stored");
                    }
                }
                Ok(response) => {
                    debug!(url = %key, status = response.status, "Background refresh skipped");
                }
                Err(e) => debug!(url = %key, error = %e, "Background refresh failed"),
            }
        });
    }

    /// Wait for every background refresh started so far
    pub async fn wait_for_background(&self) {
        let mut tasks = std::mem::take(&mut *self.background.lock());
        while tasks.join_next().await.is_some() {}
    }

    async fn lookup(&self, key: &str) -> Option<StoredResponse> {
        match self.storage.match_any(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(url = %key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    async fn store(&self, class: StoreClass, key: &str, mut response: StoredResponse) {
        response.stored_at = self.clock.now_ms();
        if let Err(e) = self.storage.put(&self.store_name(class), key, response).await {
            warn!(url = %key, error = %e, "Failed to cache response");
        }
    }

    fn offline_api_response(&self) -> StoredResponse {
        let body = json!({
            "error": "You are offline and this data has not been saved on this device yet.",
            "offline": true,
        });
        StoredResponse::with_body(
            503,
            "application/json",
            body.to_string(),
            self.clock.now_ms(),
        )
    }

    fn offline_placeholder(&self) -> StoredResponse {
        StoredResponse::with_body(503, "text/plain; charset=utf-8", "Offline", self.clock.now_ms())
    }

    // =========================================================================
    // Messages, sync, push
    // =========================================================================

    /// Handle a control message from a page
    pub async fn handle_message(&self, message: &WorkerMessage) -> Result<MessageReply, WorkerError> {
        match message {
            WorkerMessage::SkipWaiting => {
                self.skip_waiting();
                let activated = if self.should_activate() {
                    self.activate().await?;
                    true
                } else {
                    false
                };
                Ok(MessageReply::SkipWaiting { activated })
            }
            WorkerMessage::ClearCache => Ok(MessageReply::CacheCleared {
                stores: self.clear_all().await?,
            }),
            WorkerMessage::GetVersion => Ok(MessageReply::Version {
                version: self.version.clone(),
            }),
        }
    }

    /// Handle a background sync event, returning whether the tag is known
    pub async fn handle_sync(&self, tag: &str) -> bool {
        if tag == SYNC_DATA_TAG {
            info!(tag = %tag, "Background sync requested; nothing queued");
            true
        } else {
            debug!(tag = %tag, "Ignoring unknown sync tag");
            false
        }
    }

    /// Turn a push payload into a displayed notification
    pub async fn handle_push(&self, payload: Option<&[u8]>) -> Notification {
        let notification = Notification::from_push(payload);
        self.clients.show_notification(&notification).await;
        notification
    }

    /// Close a clicked notification and bring its target page forward
    pub async fn handle_notification_click(&self, notification: &Notification) -> ClickOutcome {
        self.clients.close_notification(&notification.tag).await;

        let target = self
            .origin
            .join(&notification.url)
            .map_or_else(|_| notification.url.clone(), String::from);

        if self.clients.focus(&target).await {
            ClickOutcome::Focused
        } else {
            self.clients.open_window(&target).await;
            ClickOutcome::Opened
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;
    use crate::worker::MemoryCacheStorage;

    /// Network answering from a fixed table; `offline` fails every fetch
    #[derive(Default)]
    struct ScriptedNetwork {
        pages: Mutex<HashMap<String, StoredResponse>>,
        offline: AtomicBool,
        calls: AtomicUsize,
    }

    impl ScriptedNetwork {
        fn serve(&self, url: &str, status: u16, body: &str) {
            self.pages
                .lock()
                .insert(url.to_string(), StoredResponse::with_body(status, "text/plain", body, 0));
        }

        fn go_offline(&self) {
            self.offline.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Network for ScriptedNetwork {
        async fn fetch(&self, request: &WorkerRequest, _mode: FetchMode) -> Result<StoredResponse, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(WorkerError::Network("offline".into()));
            }
            Ok(self
                .pages
                .lock()
                .get(&request.cache_key())
                .cloned()
                .unwrap_or_else(|| StoredResponse::with_body(404, "text/plain", "missing", 0)))
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        shown: Mutex<Vec<String>>,
        closed: Mutex<Vec<String>>,
        opened: Mutex<Vec<String>>,
        open_pages: Vec<String>,
    }

    #[async_trait]
    impl ClientHost for RecordingHost {
        async fn claim(&self) -> usize {
            self.open_pages.len()
        }

        async fn show_notification(&self, notification: &Notification) {
            self.shown.lock().push(notification.title.clone());
        }

        async fn close_notification(&self, tag: &str) {
            self.closed.lock().push(tag.to_string());
        }

        async fn focus(&self, url: &str) -> bool {
            self.open_pages.iter().any(|p| p == url)
        }

        async fn open_window(&self, url: &str) {
            self.opened.lock().push(url.to_string());
        }
    }

    const ORIGIN: &str = "http://app.test";

    fn config() -> WorkerConfig {
        WorkerConfig {
            origin: ORIGIN.to_string(),
            manifest: vec!["/".to_string(), "/css/styles.css".to_string()],
            ..WorkerConfig::default()
        }
    }

    struct Harness {
        controller: OfflineCacheController,
        storage: Arc<MemoryCacheStorage>,
        network: Arc<ScriptedNetwork>,
        clock: Arc<ManualClock>,
    }

    fn harness_with_host(host: Arc<dyn ClientHost>) -> Harness {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = Arc::new(ScriptedNetwork::default());
        network.serve("http://app.test/", 200, "shell");
        network.serve("http://app.test/css/styles.css", 200, "body{}");
        let clock = Arc::new(ManualClock::new(1_000_000));
        let controller = OfflineCacheController::new(
            &config(),
            storage.clone(),
            network.clone(),
            host,
        )
        .unwrap()
        .with_clock(clock.clone());
        Harness {
            controller,
            storage,
            network,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with_host(Arc::new(RecordingHost {
            open_pages: vec![format!("{ORIGIN}/")],
            ..RecordingHost::default()
        }))
    }

    async fn activated() -> Harness {
        let h = harness();
        h.controller.install().await.unwrap();
        h.controller.activate().await.unwrap();
        h
    }

    fn get(path: &str, destination: Destination) -> WorkerRequest {
        WorkerRequest::get(Url::parse(ORIGIN).unwrap().join(path).unwrap(), destination)
    }

    fn respond(outcome: FetchOutcome) -> (StoredResponse, ResponseSource) {
        match outcome {
            FetchOutcome::Respond { response, source } => (response, source),
            FetchOutcome::Passthrough => panic!("expected an intercepted response"),
        }
    }

    #[tokio::test]
    async fn install_caches_manifest_and_reports_failures() {
        let h = harness();
        h.network.pages.lock().remove("http://app.test/css/styles.css");

        let report = h.controller.install().await.unwrap();
        assert_eq!(report.cached, 1);
        assert_eq!(report.failed, vec!["http://app.test/css/styles.css".to_string()]);
        assert_eq!(h.controller.state(), WorkerState::Installed);
        assert!(h.controller.should_activate());

        let keys = h.storage.keys("static-v1").await.unwrap();
        assert_eq!(keys, vec!["http://app.test/".to_string()]);
    }

    #[tokio::test]
    async fn lifecycle_rejects_out_of_order_calls() {
        let h = harness();
        assert!(matches!(
            h.controller.activate().await,
            Err(WorkerError::Lifecycle {
                action: "activate",
                state: WorkerState::Parsed
            })
        ));
        h.controller.install().await.unwrap();
        assert!(h.controller.install().await.is_err());
    }

    #[tokio::test]
    async fn activate_deletes_stale_stores_and_claims() {
        let h = harness();
        h.storage.open("static-v0").await.unwrap();
        h.storage.open("api-v0").await.unwrap();
        h.controller.install().await.unwrap();

        let report = h.controller.activate().await.unwrap();
        assert_eq!(report.deleted_stores, vec!["api-v0".to_string(), "static-v0".to_string()]);
        assert_eq!(report.claimed, 1);
        assert_eq!(h.controller.state(), WorkerState::Activated);
        assert_eq!(h.storage.store_names().await.unwrap(), vec!["static-v1".to_string()]);
    }

    #[tokio::test]
    async fn passthrough_before_activation_and_for_foreign_requests() {
        let h = harness();
        let page = get("/about", Destination::Document);
        assert_eq!(h.controller.handle_fetch(&page).await, FetchOutcome::Passthrough);

        let h = activated().await;
        let foreign = WorkerRequest::get(Url::parse("https://tracker.example/p.js").unwrap(), Destination::Script);
        assert_eq!(h.controller.handle_fetch(&foreign).await, FetchOutcome::Passthrough);

        let mut post = get("/api/sheets", Destination::Other);
        post.method = axum::http::Method::POST;
        assert_eq!(h.controller.handle_fetch(&post).await, FetchOutcome::Passthrough);
    }

    #[test]
    fn classification() {
        let h = harness();
        let c = &h.controller;
        assert_eq!(c.classify(&get("/api/sheets?action=list", Destination::Other)), Some(Strategy::NetworkFirstApi));
        assert_eq!(c.classify(&get("/js/app.js", Destination::Script)), Some(Strategy::CacheFirstRefresh));
        let font = WorkerRequest::get(Url::parse("https://fonts.gstatic.com/s/a").unwrap(), Destination::Font);
        assert_eq!(c.classify(&font), Some(Strategy::CacheFirstRefresh));
        assert_eq!(c.classify(&get("/roster", Destination::Document)), Some(Strategy::NetworkFirstDocument));
        assert_eq!(c.classify(&get("/data/feed", Destination::Other)), Some(Strategy::CacheFirst));
    }

    #[tokio::test]
    async fn api_falls_back_to_cache_then_offline_json() {
        let h = activated().await;
        h.network.serve("http://app.test/api/sheets?sheet=Roster", 200, "fresh");

        let request = get("/api/sheets?sheet=Roster", Destination::Other);
        let (response, source) = respond(h.controller.handle_fetch(&request).await);
        assert_eq!((response.body.as_slice(), source), (b"fresh".as_slice(), ResponseSource::Network));

        h.network.go_offline();
        let (response, source) = respond(h.controller.handle_fetch(&request).await);
        assert_eq!((response.body.as_slice(), source), (b"fresh".as_slice(), ResponseSource::Cache));

        let uncached = get("/api/sheets?sheet=Other", Destination::Other);
        let (response, source) = respond(h.controller.handle_fetch(&uncached).await);
        assert_eq!(source, ResponseSource::Offline);
        assert_eq!(response.status, 503);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["offline"], true);
    }

    #[tokio::test]
    async fn failed_api_responses_are_not_cached() {
        let h = activated().await;
        h.network.serve("http://app.test/api/sheets?sheet=Gone", 404, "nope");

        let request = get("/api/sheets?sheet=Gone", Destination::Other);
        let (response, _) = respond(h.controller.handle_fetch(&request).await);
        assert_eq!(response.status, 404);
        assert!(h.storage.keys("api-v1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn static_hit_refreshes_in_background() {
        let h = activated().await;
        h.network.serve("http://app.test/css/styles.css", 200, "body{color:red}");
        let calls = h.network.calls.load(Ordering::SeqCst);

        let request = get("/css/styles.css", Destination::Style);
        let (response, source) = respond(h.controller.handle_fetch(&request).await);
        assert_eq!(source, ResponseSource::Cache);
        assert_eq!(response.body, b"body{}".to_vec());

        h.controller.wait_for_background().await;
        assert_eq!(h.network.calls.load(Ordering::SeqCst), calls + 1);
        let (response, _) = respond(h.controller.handle_fetch(&request).await);
        assert_eq!(response.body, b"body{color:red}".to_vec());
    }

    #[tokio::test]
    async fn background_refresh_failure_is_discarded() {
        let h = activated().await;
        h.network.go_offline();

        let request = get("/css/styles.css", Destination::Style);
        let (_, source) = respond(h.controller.handle_fetch(&request).await);
        assert_eq!(source, ResponseSource::Cache);
        h.controller.wait_for_background().await;

        let (response, _) = respond(h.controller.handle_fetch(&request).await);
        assert_eq!(response.body, b"body{}".to_vec());
    }

    #[tokio::test]
    async fn offline_navigation_falls_back_to_root_document() {
        let h = activated().await;
        h.network.go_offline();

        let (response, source) = respond(h.controller.handle_fetch(&get("/roster", Destination::Document)).await);
        assert_eq!(source, ResponseSource::RootFallback);
        assert_eq!(response.body, b"shell".to_vec());
    }

    #[tokio::test]
    async fn offline_navigation_prefers_cached_page() {
        let h = activated().await;
        h.network.serve("http://app.test/roster", 200, "roster page");
        let page = get("/roster", Destination::Document);
        respond(h.controller.handle_fetch(&page).await);

        h.network.go_offline();
        let (response, source) = respond(h.controller.handle_fetch(&page).await);
        assert_eq!(source, ResponseSource::Cache);
        assert_eq!(response.body, b"roster page".to_vec());
    }

    #[tokio::test]
    async fn cache_first_miss_while_offline_is_placeholder() {
        let h = activated().await;
        h.network.go_offline();
        let (response, source) = respond(h.controller.handle_fetch(&get("/data/feed", Destination::Other)).await);
        assert_eq!(source, ResponseSource::Offline);
        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn sweep_removes_aged_records_per_class() {
        let h = activated().await;
        h.network.serve("http://app.test/api/sheets?action=list", 200, "[]");
        respond(h.controller.handle_fetch(&get("/api/sheets?action=list", Destination::Other)).await);

        h.clock.advance(6 * 60 * 1000);
        assert_eq!(h.controller.sweep_expired().await.unwrap(), 1);
        assert!(h.storage.keys("api-v1").await.unwrap().is_empty());
        assert_eq!(h.storage.keys("static-v1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn record_age_ignores_origin_date_header() {
        let h = activated().await;
        let mut dated = StoredResponse::with_body(200, "application/json", "[]", 0);
        dated
            .headers
            .push(("date".into(), "Mon, 01 Jan 2001 00:00:00 GMT".into()));
        h.network
            .pages
            .lock()
            .insert("http://app.test/api/sheets?action=list".into(), dated);
        respond(h.controller.handle_fetch(&get("/api/sheets?action=list", Destination::Other)).await);

        let stored = h
            .storage
            .match_any("http://app.test/api/sheets?action=list")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.stored_at, h.clock.now_ms());

        h.clock.advance(4 * 60 * 1000);
        assert_eq!(h.controller.sweep_expired().await.unwrap(), 0);
        assert_eq!(h.storage.keys("api-v1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn messages() {
        let h = harness();
        h.controller.install().await.unwrap();

        let reply = h.controller.handle_message(&WorkerMessage::SkipWaiting).await.unwrap();
        assert_eq!(reply, MessageReply::SkipWaiting { activated: true });
        assert_eq!(h.controller.state(), WorkerState::Activated);

        let reply = h.controller.handle_message(&WorkerMessage::GetVersion).await.unwrap();
        assert_eq!(reply, MessageReply::Version { version: "v1".into() });

        let reply = h.controller.handle_message(&WorkerMessage::ClearCache).await.unwrap();
        assert_eq!(reply, MessageReply::CacheCleared { stores: 1 });
        assert!(h.storage.store_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_answers_known_tag_only() {
        let h = harness();
        assert!(h.controller.handle_sync(SYNC_DATA_TAG).await);
        assert!(!h.controller.handle_sync("other").await);
    }

    #[tokio::test]
    async fn push_and_click() {
        let host = Arc::new(RecordingHost {
            open_pages: vec!["http://app.test/?sheet=Roster".to_string()],
            ..RecordingHost::default()
        });
        let h = harness_with_host(host.clone());

        let n = h
            .controller
            .handle_push(Some(br#"{"title":"Roster","url":"/?sheet=Roster"}"#.as_slice()))
            .await;
        assert_eq!(host.shown.lock().clone(), vec!["Roster".to_string()]);

        assert_eq!(h.controller.handle_notification_click(&n).await, ClickOutcome::Focused);
        assert_eq!(host.closed.lock().clone(), vec![n.tag.clone()]);

        let other = Notification::default();
        assert_eq!(h.controller.handle_notification_click(&other).await, ClickOutcome::Opened);
        assert_eq!(host.opened.lock().clone(), vec!["http://app.test/".to_string()]);
    }
}
