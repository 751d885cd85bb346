//! Control messages, push payloads and the page-side client host

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Tag of the background sync the controller answers
pub const SYNC_DATA_TAG: &str = "sync-data";

/// Control message posted by a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Activate a waiting worker without waiting for pages to close
    SkipWaiting,
    /// Delete every named store
    ClearCache,
    /// Ask for the worker's version tag
    GetVersion,
}

/// Reply to a [`WorkerMessage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageReply {
    /// Skip-waiting recorded
    SkipWaiting {
        /// Whether the worker was activated as a result
        activated: bool,
    },
    /// Stores deleted
    CacheCleared {
        /// Number of stores removed
        stores: usize,
    },
    /// Current version tag
    Version {
        /// Version embedded in store names
        version: String,
    },
}

/// Notification derived from a push payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Title line
    pub title: String,
    /// Body text
    pub body: String,
    /// Icon URL
    pub icon: String,
    /// Replacement tag; a new notification with the same tag replaces the old
    pub tag: String,
    /// Page opened when the notification is clicked
    pub url: String,
}

impl Default for Notification {
    fn default() -> Self {
        Self {
            title: "Sheet update".to_string(),
            body: "New data is available.".to_string(),
            icon: "/icons/icon-192.png".to_string(),
            tag: "sheet-update".to_string(),
            url: "/".to_string(),
        }
    }
}

impl Notification {
    /// Decode a push payload: a JSON object overriding any of the fields,
    /// otherwise plain text used as the body
    #[must_use]
    pub fn from_push(payload: Option<&[u8]>) -> Self {
        let mut notification = Self::default();
        let Some(bytes) = payload.filter(|b| !b.is_empty()) else {
            return notification;
        };

        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(fields)) => {
                let text = |key: &str| fields.get(key).and_then(Value::as_str).map(str::to_string);
                if let Some(title) = text("title") {
                    notification.title = title;
                }
                if let Some(body) = text("body") {
                    notification.body = body;
                }
                if let Some(icon) = text("icon") {
                    notification.icon = icon;
                }
                if let Some(tag) = text("tag") {
                    notification.tag = tag;
                }
                if let Some(url) = text("url") {
                    notification.url = url;
                }
            }
            Ok(Value::String(text)) => notification.body = text,
            _ => {
                notification.body = String::from_utf8_lossy(bytes).trim().to_string();
            }
        }
        notification
    }
}

/// What a notification click did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickOutcome {
    /// An open page showing the target was focused
    Focused,
    /// A new page was opened on the target
    Opened,
}

/// Pages controlled by the worker and the notification surface they share
#[async_trait]
pub trait ClientHost: Send + Sync {
    /// Take control of every open page, returning how many were claimed
    async fn claim(&self) -> usize;

    /// Display a notification
    async fn show_notification(&self, notification: &Notification);

    /// Close the notification with `tag`
    async fn close_notification(&self, tag: &str);

    /// Focus an open page at `url`, returning whether one existed
    async fn focus(&self, url: &str) -> bool;

    /// Open a new page at `url`
    async fn open_window(&self, url: &str);
}

/// [`ClientHost`] with no pages; records activity in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingClientHost;

#[async_trait]
impl ClientHost for LoggingClientHost {
    async fn claim(&self) -> usize {
        0
    }

    async fn show_notification(&self, notification: &Notification) {
        info!(title = %notification.title, tag = %notification.tag, "Notification shown");
    }

    async fn close_notification(&self, tag: &str) {
        info!(tag = %tag, "Notification closed");
    }

    async fn focus(&self, _url: &str) -> bool {
        false
    }

    async fn open_window(&self, url: &str) {
        info!(url = %url, "Open window requested");
    }
}
