//! Outbound quota guard for upstream calls

use std::num::NonZeroU32;

use governor::{
    Quota, RateLimiter as GovernorLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use tracing::debug;

type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Delays upstream calls that would exceed the upstream's per-minute quota
///
/// Unlike the per-client limiter this never rejects; callers wait for a
/// permit instead.
pub struct UpstreamQuota {
    inner: Option<DirectLimiter>,
}

impl UpstreamQuota {
    /// Create a guard admitting `per_minute` calls; zero disables it
    #[must_use]
    pub fn per_minute(per_minute: u32) -> Self {
        let inner = NonZeroU32::new(per_minute)
            .map(|quota| GovernorLimiter::direct(Quota::per_minute(quota)));
        Self { inner }
    }

    /// Wait until an upstream call is permitted
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.inner {
            if limiter.check().is_err() {
                debug!("Upstream quota exhausted, waiting for a permit");
                limiter.until_ready().await;
            }
        }
    }
}
