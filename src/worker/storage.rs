//! Named cache stores of serialized response records

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::WorkerError;

/// Headers dropped when a stored response is replayed: the body is held
/// decoded and in full, so framing and encoding headers no longer apply.
const UNREPLAYABLE_HEADERS: &[&str] = &[
    "connection",
    "content-encoding",
    "content-length",
    "keep-alive",
    "transfer-encoding",
];

/// A response as held in a named store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Decoded response body
    pub body: Vec<u8>,
    /// Epoch millis at which the response was stored; ages count from here,
    /// not from the response `Date` header
    pub stored_at: u64,
}

impl StoredResponse {
    /// Build a response with a single `content-type` header
    #[must_use]
    pub fn with_body(status: u16, content_type: &str, body: impl Into<Vec<u8>>, now_ms: u64) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body: body.into(),
            stored_at: now_ms,
        }
    }

    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Headers safe to send again with the stored body
    pub fn replay_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter(|(k, _)| {
                !UNREPLAYABLE_HEADERS
                    .iter()
                    .any(|skip| k.eq_ignore_ascii_case(skip))
            })
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Milliseconds elapsed since the response was stored
    #[must_use]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.stored_at)
    }
}

/// Partitioned store of request-key to response records
///
/// Mirrors the browser's named cache storage: stores are created on demand,
/// listed, and deleted as a whole; records inside a store are keyed by
/// request URL.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create `store` if it does not exist yet
    async fn open(&self, store: &str) -> Result<(), WorkerError>;

    /// Insert or replace a record
    async fn put(&self, store: &str, key: &str, response: StoredResponse) -> Result<(), WorkerError>;

    /// Record for `key` in one store
    async fn get(&self, store: &str, key: &str) -> Result<Option<StoredResponse>, WorkerError>;

    /// Remove one record, returning whether it existed
    async fn delete(&self, store: &str, key: &str) -> Result<bool, WorkerError>;

    /// Keys held in one store
    async fn keys(&self, store: &str) -> Result<Vec<String>, WorkerError>;

    /// Names of every existing store
    async fn store_names(&self) -> Result<Vec<String>, WorkerError>;

    /// Delete a store with all its records, returning whether it existed
    async fn delete_store(&self, store: &str) -> Result<bool, WorkerError>;

    /// First record for `key` across all stores, in store-name order
    async fn match_any(&self, key: &str) -> Result<Option<StoredResponse>, WorkerError> {
        let mut names = self.store_names().await?;
        names.sort();
        for name in names {
            if let Some(found) = self.get(&name, key).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}

/// In-memory [`CacheStorage`]; contents last as long as the process
#[derive(Default)]
pub struct MemoryCacheStorage {
    stores: DashMap<String, HashMap<String, StoredResponse>>,
}

impl MemoryCacheStorage {
    /// Create empty storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, store: &str) -> Result<(), WorkerError> {
        self.stores.entry(store.to_string()).or_default();
        Ok(())
    }

    async fn put(&self, store: &str, key: &str, response: StoredResponse) -> Result<(), WorkerError> {
        self.stores
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), response);
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<StoredResponse>, WorkerError> {
        Ok(self
            .stores
            .get(store)
            .and_then(|records| records.get(key).cloned()))
    }

    async fn delete(&self, store: &str, key: &str) -> Result<bool, WorkerError> {
        Ok(self
            .stores
            .get_mut(store)
            .is_some_and(|mut records| records.remove(key).is_some()))
    }

    async fn keys(&self, store: &str) -> Result<Vec<String>, WorkerError> {
        Ok(self
            .stores
            .get(store)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn store_names(&self) -> Result<Vec<String>, WorkerError> {
        Ok(self.stores.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn delete_store(&self, store: &str) -> Result<bool, WorkerError> {
        Ok(self.stores.remove(store).is_some())
    }
}
