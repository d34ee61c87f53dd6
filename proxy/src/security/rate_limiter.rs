//! Connection admission per client address
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::num::NonZeroU32;

use crate::error::{ProxyError, Result};

/// Configuration for rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Whether rate limiting is enabled
    pub enabled: bool,

    /// New connections allowed per client address per minute
    pub rate_limit: u32,

    /// Addresses exempt from rate limiting
    pub allow_list: Vec<IpAddr>,

    /// Addresses that are always rejected
    pub block_list: Vec<IpAddr>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_limit: 600,
            allow_list: Vec::new(),
            block_list: Vec::new(),
        }
    }
}

/// Rate limiter for client connections
pub struct RateLimiter {
    /// Per-address limiter, `None` when rate limiting is disabled
    limiter: Option<DefaultKeyedRateLimiter<IpAddr>>,

    allow_list: Vec<IpAddr>,

    block_list: Vec<IpAddr>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(config: &RateLimiterConfig) -> Result<Self> {
        let limiter = if config.enabled {
            let rate = NonZeroU32::new(config.rate_limit)
                .ok_or_else(|| ProxyError::Config("Rate limit must be positive".to_string()))?;
            Some(GovernorRateLimiter::keyed(Quota::per_minute(rate)))
        } else {
            None
        };

        Ok(Self {
            limiter,
            allow_list: config.allow_list.clone(),
            block_list: config.block_list.clone(),
        })
    }

    /// Check if an address may open a connection
    pub fn check(&self, ip: IpAddr) -> bool {
        if self.block_list.contains(&ip) {
            warn!("IP {} is in block list, denying access", ip);
            return false;
        }
        if self.allow_list.contains(&ip) {
            return true;
        }

        match &self.limiter {
            Some(limiter) if limiter.check_key(&ip).is_err() => {
                debug!("Rate limit exceeded for IP {}", ip);
                false
            }
            _ => true,
        }
    }

    /// Admit a connection, reporting a rejection as a connection limit error
    pub fn admit(&self, ip: IpAddr) -> Result<()> {
        if self.check(ip) {
            Ok(())
        } else {
            Err(ProxyError::LimitExceeded(format!("too many connections from {}", ip)))
        }
    }

    /// Forget addresses whose quota has fully replenished
    pub fn cleanup(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }
}
