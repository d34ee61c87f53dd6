//! Distributed leases
//!
//! A lease is a time-bounded permit for a named resource. At most
//! `max_leases` unexpired leases exist for a `(kind, name)` pair at any time.
//! Holders release leases on a best-effort basis; expiry is what guarantees
//! that a crashed holder does not block the resource forever.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::clock::Clock;
use crate::error::{CoreError, Result};
use crate::retry::LinearRetry;

/// Request for a lease on a named resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRequest {
    /// Resource class, e.g. `provider-token`
    pub kind: String,

    /// Resource name within the class
    pub name: String,

    /// Maximum number of concurrent leases for the resource
    pub max_leases: u32,

    /// When the lease expires
    pub expires: DateTime<Utc>,
}

impl LeaseRequest {
    fn check(&self, now: DateTime<Utc>) -> Result<()> {
        if self.kind.is_empty() || self.name.is_empty() {
            return Err(CoreError::BadParameter("lease kind and name are required".into()));
        }
        if self.max_leases == 0 {
            return Err(CoreError::BadParameter("max_leases must be positive".into()));
        }
        if self.expires <= now {
            return Err(CoreError::BadParameter(format!(
                "lease expiry {} is not in the future",
                self.expires
            )));
        }
        Ok(())
    }
}

/// A granted lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Lease id
    pub id: Uuid,

    /// Resource class
    pub kind: String,

    /// Resource name
    pub name: String,

    /// When the lease expires
    pub expires: DateTime<Utc>,
}

/// Acquires and releases leases
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Acquire a lease, failing with `LimitExceeded` when the resource is
    /// fully leased
    async fn acquire_lease(&self, request: &LeaseRequest) -> Result<Lease>;

    /// Release a lease before its expiry
    async fn cancel_lease(&self, lease: &Lease) -> Result<()>;
}

/// Lease acquisition parameters
#[derive(Debug, Clone)]
pub struct AcquireLeaseConfig {
    /// The lease to acquire
    pub request: LeaseRequest,

    /// Backoff between attempts while the resource is fully leased
    pub retry: LinearRetry,
}

/// Acquire a lease, retrying while the resource is fully leased
///
/// Only `LimitExceeded` outcomes are retried; every other error is returned
/// immediately. The loop does not bound itself, so callers wrap it in
/// `tokio::time::timeout`.
pub async fn acquire_lease_with_retry(
    manager: &dyn LeaseManager,
    clock: &dyn Clock,
    config: AcquireLeaseConfig,
) -> Result<Lease> {
    config.request.check(clock.now())?;

    let mut attempt = 0u32;
    loop {
        match manager.acquire_lease(&config.request).await {
            Ok(lease) => {
                debug!(
                    "Acquired lease {} on {}/{} after {} retries",
                    lease.id, lease.kind, lease.name, attempt
                );
                return Ok(lease);
            }
            Err(err) if err.is_limit_exceeded() => {
                attempt = attempt.saturating_add(1);
                let wait = config.retry.duration(attempt);
                debug!(
                    "Lease on {}/{} is held, retrying in {:?}",
                    config.request.kind, config.request.name, wait
                );
                tokio::time::sleep(wait).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Single-node lease manager
///
/// Expired leases are pruned across every resource on each acquisition, so
/// abandoned resources do not accumulate.
#[derive(Debug)]
pub struct InMemoryLeaseManager {
    clock: Arc<dyn Clock>,
    leases: Mutex<HashMap<(String, String), Vec<Lease>>>,
}

impl InMemoryLeaseManager {
    /// Create an empty lease manager
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Number of unexpired leases held for a resource
    pub fn active_leases(&self, kind: &str, name: &str) -> usize {
        let now = self.clock.now();
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases
            .get(&(kind.to_string(), name.to_string()))
            .map_or(0, |held| held.iter().filter(|l| l.expires > now).count())
    }

    /// Number of resources with at least one tracked lease
    pub fn tracked_resources(&self) -> usize {
        self.leases.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LeaseManager for InMemoryLeaseManager {
    async fn acquire_lease(&self, request: &LeaseRequest) -> Result<Lease> {
        let now = self.clock.now();
        request.check(now)?;

        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.retain(|_, held| {
            held.retain(|lease| lease.expires > now);
            !held.is_empty()
        });
        let held = leases
            .entry((request.kind.clone(), request.name.clone()))
            .or_default();

        if held.len() >= request.max_leases as usize {
            return Err(CoreError::LimitExceeded(format!(
                "too many leases for {}/{}",
                request.kind, request.name
            )));
        }

        let lease = Lease {
            id: Uuid::new_v4(),
            kind: request.kind.clone(),
            name: request.name.clone(),
            expires: request.expires,
        };
        held.push(lease.clone());
        Ok(lease)
    }

    async fn cancel_lease(&self, lease: &Lease) -> Result<()> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let key = (lease.kind.clone(), lease.name.clone());
        let held = leases
            .get_mut(&key)
            .ok_or_else(|| CoreError::NotFound(format!("lease {}", lease.id)))?;

        let before = held.len();
        held.retain(|l| l.id != lease.id);
        if held.len() == before {
            return Err(CoreError::NotFound(format!("lease {}", lease.id)));
        }
        if held.is_empty() {
            leases.remove(&key);
        }
        Ok(())
    }
}

/// Error body returned by the lease service
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Client for a remote lease service shared by a fleet of proxies
///
/// `POST {base}/v1/leases` acquires, `DELETE {base}/v1/leases/{id}` releases.
/// The service answers `429` or `409` when the resource is fully leased.
#[derive(Debug, Clone)]
pub struct HttpLeaseManager {
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl HttpLeaseManager {
    /// Create a client for the lease service at `base_url`
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Set the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn error_message(response: reqwest::Response) -> String {
        let status = response.status();
        match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => format!("lease service returned {}", status),
        }
    }
}

#[async_trait]
impl LeaseManager for HttpLeaseManager {
    async fn acquire_lease(&self, request: &LeaseRequest) -> Result<Lease> {
        let url = format!("{}/v1/leases", self.base_url);
        debug!("Acquiring lease on {}/{} from {}", request.kind, request.name, url);

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<Lease>().await?),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::CONFLICT => {
                Err(CoreError::LimitExceeded(Self::error_message(response).await))
            }
            StatusCode::BAD_REQUEST => {
                Err(CoreError::BadParameter(Self::error_message(response).await))
            }
            _ => Err(CoreError::Lease(Self::error_message(response).await)),
        }
    }

    async fn cancel_lease(&self, lease: &Lease) -> Result<()> {
        let url = format!("{}/v1/leases/{}", self.base_url, lease.id);
        let response = self
            .client
            .delete(&url)
            .timeout(self.timeout)
            .query(&[("kind", lease.kind.as_str()), ("name", lease.name.as_str())])
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(CoreError::NotFound(format!("lease {}", lease.id))),
            status => {
                warn!("Lease service refused to cancel lease {}: {}", lease.id, status);
                Err(CoreError::Lease(Self::error_message(response).await))
            }
        }
    }
}
