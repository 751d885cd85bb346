//! Failsafe mechanisms: per-client rate limiting and the upstream quota guard

mod quota;
mod rate_limiter;

pub use quota::UpstreamQuota;
pub use rate_limiter::{
    DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW, RateDecision, RateLimitPolicy, RateLimiter,
    SWEEP_INTERVAL,
};
