//! Security features for the proxy

pub mod rate_limiter;

pub use rate_limiter::{RateLimiter, RateLimiterConfig};
