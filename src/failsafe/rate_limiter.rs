//! Per-client sliding-window rate limiting

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::clock::{Clock, SystemClock};

/// Requests admitted per client within one window
pub const DEFAULT_MAX_REQUESTS: u32 = 30;
/// Length of the sliding window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Interval of the background sweep dropping idle clients
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Quota applied to every client identifier
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    /// Maximum admitted requests per window
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Outcome of a single [`RateLimiter::check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// Epoch millis at which the oldest counted request leaves the window
    pub reset_at: u64,
    /// Configured maximum, echoed for response headers
    pub limit: u32,
}

impl RateDecision {
    /// Whole seconds until `reset_at`, never less than one
    #[must_use]
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at.saturating_sub(now_ms).div_ceil(1000).max(1)
    }

    /// `reset_at` as epoch seconds, rounded up
    #[must_use]
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at.div_ceil(1000)
    }
}

/// Sliding-window rate limiter keyed by client identifier
///
/// Each identifier owns an ordered list of request timestamps. Timestamps
/// that have left the window are dropped lazily on every check and eagerly
/// by [`RateLimiter::sweep`].
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<u64>>,
    max_requests: u32,
    window_ms: u64,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter using the system clock
    #[must_use]
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    /// Create a limiter reading time from `clock`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_clock(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests: policy.max_requests.max(1),
            window_ms: policy.window.as_millis() as u64,
            clock,
        }
    }

    /// Configured maximum requests per window
    pub fn limit(&self) -> u32 {
        self.max_requests
    }

    /// Current time as seen by this limiter
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Count a request from `identifier` and decide whether to admit it
    pub fn check(&self, identifier: &str) -> RateDecision {
        let now = self.clock.now_ms();
        let window_ms = self.window_ms;

        // The entry guard serializes concurrent checks for one identifier
        let mut window = self.windows.entry(identifier.to_string()).or_default();
        prune(&mut window, now, window_ms);

        #[allow(clippy::cast_possible_truncation)]
        let count = window.len() as u32;
        if count >= self.max_requests {
            let oldest = window.front().copied().unwrap_or(now);
            debug!(client = %identifier, count, "Rate limit exceeded");
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_at: oldest + window_ms,
                limit: self.max_requests,
            };
        }

        window.push_back(now);
        let oldest = window.front().copied().unwrap_or(now);
        RateDecision {
            allowed: true,
            remaining: self.max_requests - (count + 1),
            reset_at: oldest + window_ms,
            limit: self.max_requests,
        }
    }

    /// Forget all recorded requests for one identifier
    pub fn reset(&self, identifier: &str) {
        self.windows.remove(identifier);
    }

    /// Prune every window and drop identifiers with no recent requests
    ///
    /// Returns the number of identifiers removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let window_ms = self.window_ms;
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            prune(window, now, window_ms);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of identifiers currently tracked
    pub fn active_clients(&self) -> usize {
        self.windows.len()
    }
}

fn prune(window: &mut VecDeque<u64>, now: u64, window_ms: u64) {
    while window
        .front()
        .is_some_and(|&ts| now.saturating_sub(ts) >= window_ms)
    {
        window.pop_front();
    }
}
