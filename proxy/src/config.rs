//! Configuration for the proxy server
//!
//! Settings are layered: built-in defaults, then an optional TOML/YAML/JSON
//! file, then `SQLGATE__*` environment variables (`SQLGATE__LISTEN_ADDR`,
//! `SQLGATE__DATABASE__URI`, ...). A `.env` file in the working directory is
//! loaded into the environment first.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use sqlgate_core::access::{AuthPreference, Role};
use sqlgate_core::defaults::DATABASE_CONNECT_TIMEOUT;
use sqlgate_core::models::{split_host_port, DatabaseSpec};

use crate::credentials::CredentialsConfig;
use crate::error::{ProxyError, Result};
use crate::frontend::Principal;
use crate::protocol::packet::MAX_PAYLOAD_LEN;
use crate::security::RateLimiterConfig;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "SQLGATE";

/// Where password rotation leases are kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeaseBackend {
    /// In this process only
    Memory,

    /// Remote lease service shared by all proxies
    Http {
        /// Service base URL
        url: String,

        /// Request timeout in milliseconds
        #[serde(default = "default_lease_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_lease_timeout_ms() -> u64 {
    5_000
}

impl Default for LeaseBackend {
    fn default() -> Self {
        LeaseBackend::Memory
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listening address for the proxy
    pub listen_addr: String,

    /// Database sessions are proxied to
    pub database: DatabaseSpec,

    /// Secrets used to log in to the database
    pub credentials: CredentialsConfig,

    /// Principals allowed to log in, by name
    pub principals: HashMap<String, Principal>,

    /// Roles referenced by principals
    pub roles: Vec<Role>,

    /// Cluster authentication preference
    pub auth_preference: AuthPreference,

    /// Lease storage
    pub leases: LeaseBackend,

    /// Connection admission
    pub rate_limiter: RateLimiterConfig,

    /// Budget for logging in to the database, lease waits included
    pub connect_timeout_secs: u64,

    /// Budget for the client connection phase
    pub handshake_timeout_secs: u64,

    /// Largest client packet payload relayed to the database
    pub max_packet_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3307".to_string(),
            database: DatabaseSpec::new("mysql", "127.0.0.1:3306"),
            credentials: CredentialsConfig::default(),
            principals: HashMap::new(),
            roles: Vec::new(),
            auth_preference: AuthPreference::default(),
            leases: LeaseBackend::default(),
            rate_limiter: RateLimiterConfig::default(),
            connect_timeout_secs: DATABASE_CONNECT_TIMEOUT.as_secs(),
            handshake_timeout_secs: 10,
            max_packet_size: MAX_PAYLOAD_LEN,
        }
    }
}

impl ProxyConfig {
    /// Create a new proxy configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            log::debug!("Loaded environment from {}", path.display());
        }

        let mut builder = ::config::Config::builder().add_source(
            ::config::Config::try_from(&ProxyConfig::default()).map_err(config_error)?,
        );
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: ProxyConfig = builder
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        self.listen_socket_addr()?;

        if self.database.name.is_empty() {
            return Err(ProxyError::Config("database.name must not be empty".into()));
        }
        split_host_port(&self.database.uri)
            .map_err(|e| ProxyError::Config(format!("database.uri: {}", e)))?;

        let roles: HashSet<&str> = self.roles.iter().map(|r| r.name.as_str()).collect();
        for (name, principal) in &self.principals {
            if name.is_empty() || name.contains(crate::frontend::LOGIN_SEPARATOR) {
                return Err(ProxyError::Config(format!("invalid principal name {:?}", name)));
            }
            if let Some(role) = principal.roles.iter().find(|r| !roles.contains(r.as_str())) {
                return Err(ProxyError::Config(format!(
                    "principal {:?} references unknown role {:?}",
                    name, role
                )));
            }
        }

        if let LeaseBackend::Http { url, .. } = &self.leases {
            if url.is_empty() {
                return Err(ProxyError::Config("leases.url must not be empty".into()));
            }
        }
        if self.connect_timeout_secs == 0 || self.handshake_timeout_secs == 0 {
            return Err(ProxyError::Config("timeouts must be positive".into()));
        }
        if self.max_packet_size == 0 {
            return Err(ProxyError::Config("max_packet_size must be positive".into()));
        }
        Ok(())
    }

    /// Parsed listening address
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        if self.listen_addr.is_empty() {
            return Err(ProxyError::Config("listen_addr must not be empty".into()));
        }
        Ok(self.listen_addr.parse()?)
    }

    /// Database login budget
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Client connection phase budget
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Roles granted to a principal
    pub fn roles_for(&self, names: &[String]) -> Vec<Role> {
        self.roles
            .iter()
            .filter(|role| names.contains(&role.name))
            .cloned()
            .collect()
    }
}

fn config_error(err: ::config::ConfigError) -> ProxyError {
    ProxyError::Config(err.to_string())
}
