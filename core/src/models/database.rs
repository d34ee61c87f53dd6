//! Target database descriptor

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CoreError, Result};

/// How the proxy verifies the TLS certificate presented by a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    /// Verify the certificate chain and the host name
    #[default]
    VerifyFull,

    /// Verify the certificate chain only
    VerifyCa,

    /// Accept any certificate
    Insecure,
}

/// TLS settings for the connection to a database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Connect over TLS
    #[serde(default = "default_tls_enabled")]
    pub enabled: bool,

    /// Verification mode
    #[serde(default)]
    pub mode: TlsMode,

    /// CA bundle used to verify the database certificate
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// Name to verify the certificate against, defaults to the URI host
    #[serde(default)]
    pub server_name: Option<String>,
}

fn default_tls_enabled() -> bool {
    true
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: TlsMode::default(),
            ca_file: None,
            server_name: None,
        }
    }
}

/// Authentication model of the database backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendKind {
    /// Self-hosted database using static credentials
    #[default]
    SelfHosted,

    /// AWS RDS / Aurora with IAM authentication
    Rds {
        /// AWS region
        region: String,
        /// AWS account id
        account_id: String,
        /// RDS resource id (`db-XXXX` / `cluster-XXXX`)
        resource_id: String,
    },

    /// GCP Cloud SQL, which has no IAM auth for MySQL and rotates a
    /// per-user password instead
    CloudSql {
        /// GCP project
        project_id: String,
        /// Cloud SQL instance id
        instance_id: String,
    },

    /// Azure Database for MySQL with AAD access tokens
    Azure {
        /// Azure server name, used to qualify login names
        server_name: String,
    },
}

/// Database the proxy connects sessions to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSpec {
    /// Database service name
    pub name: String,

    /// Wire protocol
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Network address, `host:port`
    pub uri: String,

    /// Authentication model
    #[serde(default)]
    pub kind: BackendKind,

    /// TLS settings
    #[serde(default)]
    pub tls: TlsSettings,
}

fn default_protocol() -> String {
    crate::defaults::PROTOCOL_MYSQL.to_string()
}

impl DatabaseSpec {
    /// Create a self-hosted MySQL database descriptor
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: default_protocol(),
            uri: uri.into(),
            kind: BackendKind::SelfHosted,
            tls: TlsSettings::default(),
        }
    }

    /// Set the backend kind
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the TLS settings
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    /// Whether this is an RDS database with IAM auth
    pub fn is_rds(&self) -> bool {
        matches!(self.kind, BackendKind::Rds { .. })
    }

    /// Split the URI into host and port
    pub fn host_port(&self) -> Result<(String, u16)> {
        split_host_port(&self.uri)
    }

    /// Name used for TLS verification and SNI
    pub fn tls_server_name(&self) -> Result<String> {
        match &self.tls.server_name {
            Some(name) if !name.is_empty() => Ok(name.clone()),
            _ => Ok(self.host_port()?.0),
        }
    }

    /// IAM policy document the proxy needs to connect to this database
    ///
    /// Empty for databases that do not use IAM authentication.
    pub fn iam_policy(&self) -> String {
        match &self.kind {
            BackendKind::Rds { region, account_id, resource_id } => {
                let policy = serde_json::json!({
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Action": "rds-db:connect",
                        "Resource": format!(
                            "arn:aws:rds-db:{}:{}:dbuser:{}/*",
                            region, account_id, resource_id
                        ),
                    }],
                });
                serde_json::to_string_pretty(&policy).unwrap_or_default()
            }
            _ => String::new(),
        }
    }
}

/// Split a `host:port` address, accepting bracketed IPv6 hosts
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| CoreError::BadParameter(format!("missing port in address {:?}", addr)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| CoreError::BadParameter(format!("invalid port in address {:?}", addr)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(CoreError::BadParameter(format!("missing host in address {:?}", addr)));
    }
    Ok((host.to_string(), port))
}

/// Join a host and port into an address, bracketing IPv6 hosts
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
