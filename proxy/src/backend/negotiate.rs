//! Credential path selection
//!
//! Picks how to log in to a database based on its authentication model and
//! converges on a single authenticated connection.

use log::{debug, error};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use sqlgate_core::clock::Clock;
use sqlgate_core::defaults::{
    CLOUD_SQL_PROXY_PORT, MYSQL_PORT, PROVIDER_TOKEN_LEASE_KIND, PROVIDER_TOKEN_LEASE_TTL,
};
use sqlgate_core::lease::{acquire_lease_with_retry, AcquireLeaseConfig, Lease, LeaseManager, LeaseRequest};
use sqlgate_core::models::{join_host_port, split_host_port, BackendKind, Session, TlsMode};
use sqlgate_core::retry::LinearRetry;

use crate::backend::client::{connect_mysql, BackendConn, ConnectOptions};
use crate::backend::stream::BackendStream;
use crate::credentials::CredentialProvider;
use crate::error::{convert_backend_error, ProxyError, Result};

/// Connects sessions to their databases
#[derive(Clone)]
pub struct BackendConnector {
    credentials: Arc<dyn CredentialProvider>,
    leases: Arc<dyn LeaseManager>,
    clock: Arc<dyn Clock>,
    connect_timeout: Duration,
    lease_retry: LinearRetry,
}

impl BackendConnector {
    /// Create a connector
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        leases: Arc<dyn LeaseManager>,
        clock: Arc<dyn Clock>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            leases,
            clock,
            connect_timeout,
            lease_retry: LinearRetry::default(),
        }
    }

    /// Override the backoff used while waiting for a password rotation lease
    pub fn with_lease_retry(mut self, retry: LinearRetry) -> Self {
        self.lease_retry = retry;
        self
    }

    /// Log in to the session's database
    pub async fn connect(&self, session: &Session, client_capabilities: u32) -> Result<BackendConn> {
        let database = &session.database;
        let tls = self
            .credentials
            .get_tls_config(session)
            .await
            .map_err(|e| ProxyError::credential("TLS config", e))?;
        let server_name = database.tls_server_name()?;

        let mut user = session.database_user.clone();
        let mut stream = None;
        let mut lease = None;

        let password = match &database.kind {
            BackendKind::SelfHosted => self
                .credentials
                .get_static_password(session)
                .await
                .map_err(|e| ProxyError::credential("database password", e))?,
            BackendKind::Rds { .. } => self
                .credentials
                .get_rds_auth_token(session)
                .await
                .map_err(|e| ProxyError::credential("RDS auth token", e))?,
            BackendKind::CloudSql { .. } => {
                // The password is reset for every connection, so connections
                // as the same account must not interleave
                let held = self.acquire_rotation_lease(session).await?;
                let guard = lease.insert(LeaseGuard::new(self.leases.clone(), held));
                debug!("Holding lease {} for {}", guard.id(), session);

                let password = self
                    .credentials
                    .get_cloud_sql_password(session)
                    .await
                    .map_err(|e| ProxyError::credential("Cloud SQL password", e))?;

                // The server on 3306 does not trust the proxy's ephemeral CA
                // but the Cloud SQL proxy port does
                if let (Some(config), true) = (&tls, database.tls.mode != TlsMode::Insecure) {
                    let addr = cloud_sql_tls_addr(&database.uri)?;
                    debug!("Connecting to Cloud SQL over TLS at {}", addr);
                    let conn = timeout(
                        self.connect_timeout,
                        BackendStream::connect_tls(&addr, config.clone(), &server_name),
                    )
                    .await??;
                    stream = Some(conn);
                }
                password
            }
            BackendKind::Azure { server_name } => {
                let token = self
                    .credentials
                    .get_azure_access_token(session)
                    .await
                    .map_err(|e| ProxyError::credential("Azure access token", e))?;
                user = azure_login(&user, server_name);
                token
            }
        };

        let opts = ConnectOptions {
            addr: database.uri.clone(),
            user,
            password,
            database: session.database_name.clone(),
            tls: tls.map(|config| (config, server_name)),
            stream,
            client_capabilities,
        };
        let result = match timeout(self.connect_timeout, connect_mysql(opts)).await {
            Ok(result) => result,
            Err(elapsed) => Err(ProxyError::from(elapsed)),
        };

        if let Some(guard) = lease {
            guard.release().await;
        }

        result.map_err(|err| match convert_backend_error(err) {
            ProxyError::AccessDenied(message) if database.is_rds() => {
                ProxyError::BackendAccessDenied(rds_access_denied_message(session, &message))
            }
            other => other,
        })
    }

    async fn acquire_rotation_lease(&self, session: &Session) -> Result<Lease> {
        let ttl = chrono::Duration::from_std(PROVIDER_TOKEN_LEASE_TTL)
            .map_err(|e| ProxyError::Config(e.to_string()))?;
        let config = AcquireLeaseConfig {
            request: LeaseRequest {
                kind: PROVIDER_TOKEN_LEASE_KIND.to_string(),
                name: session.lease_name(),
                max_leases: 1,
                expires: self.clock.now() + ttl,
            },
            retry: self.lease_retry,
        };

        let acquire = acquire_lease_with_retry(self.leases.as_ref(), self.clock.as_ref(), config);
        match timeout(self.connect_timeout, acquire).await {
            Ok(Ok(lease)) => Ok(lease),
            Ok(Err(err)) => Err(ProxyError::credential("password rotation lease", err)),
            Err(_) => Err(ProxyError::credential(
                "password rotation lease",
                ProxyError::LimitExceeded(format!(
                    "timed out waiting for a lease on {}",
                    session.lease_name()
                )),
            )),
        }
    }
}

/// Releases a lease when dropped
///
/// `release` cancels in place; a guard dropped without it (early return or
/// panic) cancels from a background task.
struct LeaseGuard {
    leases: Arc<dyn LeaseManager>,
    lease: Option<Lease>,
}

impl LeaseGuard {
    fn new(leases: Arc<dyn LeaseManager>, lease: Lease) -> Self {
        Self { leases, lease: Some(lease) }
    }

    fn id(&self) -> String {
        self.lease.as_ref().map(|l| l.id.to_string()).unwrap_or_default()
    }

    async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            cancel_lease(self.leases.as_ref(), &lease).await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let leases = self.leases.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { cancel_lease(leases.as_ref(), &lease).await });
            }
        }
    }
}

async fn cancel_lease(leases: &dyn LeaseManager, lease: &Lease) {
    // Expiry frees the lease if this fails
    if let Err(err) = leases.cancel_lease(lease).await {
        error!("Failed to cancel lease {} on {}/{}: {}", lease.id, lease.kind, lease.name, err);
    }
}

/// Address of the Cloud SQL TLS endpoint for a database URI
pub fn cloud_sql_tls_addr(uri: &str) -> Result<String> {
    let (host, port) = split_host_port(uri)?;
    if port == MYSQL_PORT {
        debug!("Overriding Cloud SQL port {} with {}", MYSQL_PORT, CLOUD_SQL_PROXY_PORT);
        return Ok(join_host_port(&host, CLOUD_SQL_PROXY_PORT));
    }
    Ok(join_host_port(&host, port))
}

/// Login name Azure expects: `user@server`
pub fn azure_login(user: &str, server_name: &str) -> String {
    format!("{}@{}", user, server_name)
}

fn rds_access_denied_message(session: &Session, cause: &str) -> String {
    format!(
        "Could not connect to database:\n\n  {}\n\n\
         Make sure that IAM auth is enabled for MySQL user {:?} and the proxy's\n\
         IAM policy has \"rds-db:connect\" permissions (note that IAM changes may\n\
         take a few minutes to propagate):\n\n{}\n",
        cause,
        session.database_user,
        session.database.iam_policy()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("10.0.0.5:3306", "10.0.0.5:3307")]
    #[case("10.0.0.5:3310", "10.0.0.5:3310")]
    #[case("[fd00::1]:3306", "[fd00::1]:3307")]
    fn test_cloud_sql_tls_addr(#[case] uri: &str, #[case] expected: &str) {
        assert_eq!(cloud_sql_tls_addr(uri).unwrap(), expected);
    }

    #[test]
    fn test_azure_login() {
        assert_eq!(azure_login("alice", "my-server"), "alice@my-server");
    }
}
