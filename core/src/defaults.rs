//! Default values shared by the proxy components

use std::time::Duration;

/// Time budget for establishing a connection to a database, including
/// any lease acquisition that has to happen beforehand.
pub const DATABASE_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Lease kind used to serialize one-time password rotation for a
/// database account.
pub const PROVIDER_TOKEN_LEASE_KIND: &str = "provider-token";

/// How long a password rotation lease lives if its holder never releases it.
pub const PROVIDER_TOKEN_LEASE_TTL: Duration = Duration::from_secs(60);

/// Fixed backoff step between lease acquisition attempts.
pub const LEASE_RETRY_STEP: Duration = Duration::from_secs(1);

/// Upper bound for a single wait between lease acquisition attempts.
pub const LEASE_RETRY_MAX: Duration = Duration::from_secs(1);

/// Protocol name for MySQL databases.
pub const PROTOCOL_MYSQL: &str = "mysql";

/// Default MySQL port.
pub const MYSQL_PORT: u16 = 3306;

/// Cloud SQL serves its TLS endpoint with the instance CA on this port.
pub const CLOUD_SQL_PROXY_PORT: u16 = 3307;
