use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter configuration
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Maximum broker requests per minute
    pub requests_per_minute: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 120,
        }
    }
}

/// Limiter shared by every call to one broker
pub type BrokerRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Create a new rate limiter; a zero quota is raised to one request per minute
pub fn create_rate_limiter(config: RateLimiterConfig) -> BrokerRateLimiter {
    let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or_else(|| {
        tracing::warn!("Rate limit of 0 requests/minute is invalid, using 1");
        NonZeroU32::MIN
    });
    Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)))
}
