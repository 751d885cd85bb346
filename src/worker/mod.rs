//! Offline cache controller
//!
//! Reproduces a browser service worker's caching behaviour outside the
//! browser: a lifecycle (install, activate), request interception with one
//! strategy per request class, and three versioned named stores.
//!
//! ```text
//!        install                   skip-waiting          activate
//! Parsed ───────► Installing ───► Installed ────────────► Activating ───► Activated
//!                      │  (timeout)                            │ (timeout)
//!                      └──────────► Redundant ◄────────────────┘
//! ```
//!
//! The browser's cache storage, network and page clients are traits
//! ([`CacheStorage`], [`Network`], [`ClientHost`]) so the controller runs
//! against in-memory storage and a plain HTTP client.

mod controller;
pub mod edge;
mod events;
mod network;
mod storage;

use std::time::Duration;

use thiserror::Error;

pub use controller::{
    ActivateReport, FetchOutcome, InstallReport, OfflineCacheController, ResponseSource, Strategy,
    WorkerState,
};
pub use events::{
    ClickOutcome, ClientHost, LoggingClientHost, MessageReply, Notification, SYNC_DATA_TAG,
    WorkerMessage,
};
pub use network::{Destination, FetchMode, HttpNetwork, Network, WorkerRequest};
pub use storage::{CacheStorage, MemoryCacheStorage, StoredResponse};

/// File extensions served cache-first as static assets
pub const STATIC_EXTENSIONS: &[&str] = &[
    "css", "js", "mjs", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2", "ttf",
    "otf", "eot", "json", "webmanifest",
];

/// Interval of the background age-based sweep
pub const AGE_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Logical partition of the named stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreClass {
    /// Install-time manifest and static assets
    Static,
    /// Documents and other same-origin responses
    Dynamic,
    /// Data API responses
    Api,
}

impl StoreClass {
    /// Every class, in sweep order
    pub const ALL: [Self; 3] = [Self::Static, Self::Dynamic, Self::Api];

    /// Store name for this class at `version`
    #[must_use]
    pub fn store_name(self, version: &str) -> String {
        let prefix = match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Api => "api",
        };
        format!("{prefix}-{version}")
    }

    /// Age after which a record of this class is swept
    #[must_use]
    pub fn max_age(self) -> Duration {
        match self {
            Self::Static => Duration::from_secs(7 * 24 * 60 * 60),
            Self::Dynamic => Duration::from_secs(24 * 60 * 60),
            Self::Api => Duration::from_secs(5 * 60),
        }
    }
}

/// Offline cache controller errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Lifecycle call made in the wrong state
    #[error("Cannot {action} while {state:?}")]
    Lifecycle {
        /// Attempted transition
        action: &'static str,
        /// State at the time of the call
        state: WorkerState,
    },

    /// A lifecycle phase exceeded its time budget
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    /// Store backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// No response obtained from the network
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid controller settings
    #[error("Configuration error: {0}")]
    Config(String),
}
