//! Credential provider
//!
//! Supplies the short-lived secrets the proxy needs to log in to databases:
//! TLS client configuration, static passwords, RDS IAM auth tokens, Cloud SQL
//! one-time passwords and Azure AD access tokens.

use async_trait::async_trait;
use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlgate_core::access::AuthPreference;
use sqlgate_core::models::{Session, TlsMode, TlsSettings};

use crate::error::{ProxyError, Result};

/// Source of secrets for database sessions
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Cluster-wide authentication preference
    async fn get_auth_preference(&self) -> Result<AuthPreference>;

    /// TLS client configuration for the session's database, `None` for a
    /// plain TCP connection
    async fn get_tls_config(&self, session: &Session) -> Result<Option<Arc<ClientConfig>>>;

    /// Password of a self-hosted database account
    async fn get_static_password(&self, session: &Session) -> Result<String>;

    /// RDS IAM auth token for the session's database account
    async fn get_rds_auth_token(&self, session: &Session) -> Result<String>;

    /// Fresh one-time password for a Cloud SQL account
    ///
    /// Resets the account password, so concurrent calls for the same account
    /// must be serialized by the caller.
    async fn get_cloud_sql_password(&self, session: &Session) -> Result<String>;

    /// Azure AD access token
    async fn get_azure_access_token(&self, session: &Session) -> Result<String>;
}

/// A configured secret, either inline or read from an environment variable
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Secret {
    /// Read from an environment variable at use time
    Env {
        /// Variable name
        env: String,
    },
    /// Inline value
    Value(String),
}

impl Secret {
    /// Resolve the secret value
    pub fn resolve(&self) -> Result<String> {
        match self {
            Secret::Value(value) => Ok(value.clone()),
            Secret::Env { env } => std::env::var(env)
                .map_err(|_| ProxyError::Config(format!("environment variable {} is not set", env))),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Env { env } => write!(f, "Secret(env:{})", env),
            Secret::Value(_) => write!(f, "Secret(<redacted>)"),
        }
    }
}

/// Configuration of the static credential provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Passwords by database account, used for self-hosted and Cloud SQL
    /// databases
    #[serde(default)]
    pub passwords: HashMap<String, Secret>,

    /// RDS IAM auth token
    #[serde(default)]
    pub rds_auth_token: Option<Secret>,

    /// Azure AD access token
    #[serde(default)]
    pub azure_access_token: Option<Secret>,

    /// Client certificate presented to databases
    #[serde(default)]
    pub client_cert_file: Option<PathBuf>,

    /// Key of the client certificate
    #[serde(default)]
    pub client_key_file: Option<PathBuf>,
}

/// Credential provider serving configured secrets
///
/// Cloud provider APIs are not called; tokens and one-time passwords are
/// taken from configuration or the environment.
#[derive(Debug)]
pub struct StaticCredentialProvider {
    config: CredentialsConfig,
    auth_preference: AuthPreference,
}

impl StaticCredentialProvider {
    /// Create a provider
    pub fn new(config: CredentialsConfig, auth_preference: AuthPreference) -> Self {
        Self { config, auth_preference }
    }

    fn password_for(&self, user: &str) -> Result<String> {
        self.config
            .passwords
            .get(user)
            .ok_or_else(|| ProxyError::Config(format!("no password configured for database user {:?}", user)))?
            .resolve()
    }

    fn client_identity(&self) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
        match (&self.config.client_cert_file, &self.config.client_key_file) {
            (Some(cert), Some(key)) => Ok(Some((load_certificates(cert)?, load_private_key(key)?))),
            (None, None) => Ok(None),
            _ => Err(ProxyError::Config(
                "client_cert_file and client_key_file must be set together".into(),
            )),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_auth_preference(&self) -> Result<AuthPreference> {
        Ok(self.auth_preference)
    }

    async fn get_tls_config(&self, session: &Session) -> Result<Option<Arc<ClientConfig>>> {
        let tls = &session.database.tls;
        if !tls.enabled {
            debug!("TLS disabled for database {}", session.database.name);
            return Ok(None);
        }
        let config = build_client_config(tls, self.client_identity()?)?;
        Ok(Some(config))
    }

    async fn get_static_password(&self, session: &Session) -> Result<String> {
        self.password_for(&session.database_user)
    }

    async fn get_rds_auth_token(&self, session: &Session) -> Result<String> {
        debug!("Generating RDS auth token for {}", session);
        self.config
            .rds_auth_token
            .as_ref()
            .ok_or_else(|| ProxyError::Config("no RDS auth token configured".into()))?
            .resolve()
    }

    async fn get_cloud_sql_password(&self, session: &Session) -> Result<String> {
        debug!("Generating Cloud SQL password for {}", session);
        self.password_for(&session.database_user)
    }

    async fn get_azure_access_token(&self, session: &Session) -> Result<String> {
        debug!("Generating Azure access token for {}", session);
        self.config
            .azure_access_token
            .as_ref()
            .ok_or_else(|| ProxyError::Config("no Azure access token configured".into()))?
            .resolve()
    }
}

/// Build a rustls client configuration for a TLS mode
pub fn build_client_config(
    tls: &TlsSettings,
    client_identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let builder = match tls.mode {
        TlsMode::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new(provider))),
        TlsMode::VerifyCa => {
            let roots = Arc::new(root_store(tls.ca_file.as_deref())?);
            let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|e| ProxyError::Tls(e.to_string()))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipHostnameVerification { inner }))
        }
        TlsMode::VerifyFull => builder.with_root_certificates(root_store(tls.ca_file.as_deref())?),
    };

    let config = match client_identity {
        Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in load_certificates(path)? {
                roots.add(cert)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

/// Load PEM certificates
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Tls(format!("failed to open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("failed to parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

/// Load a PEM private key
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Tls(format!("failed to open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ProxyError::Tls(format!("failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key in {}", path.display())))
}

/// Verifies the chain but accepts any host name
#[derive(Debug)]
struct SkipHostnameVerification {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for SkipHostnameVerification {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            // Newer rustls releases attach the names to this variant
            Err(rustls::Error::InvalidCertificate(err))
                if format!("{:?}", err).starts_with("NotValidForName") =>
            {
                Ok(ServerCertVerified::assertion())
            }
            Err(err) => Err(err),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any certificate
#[derive(Debug)]
struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl NoCertificateVerification {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlgate_core::access::RoleSet;
    use sqlgate_core::models::{DatabaseSpec, Identity};
    use std::io::Write;

    fn session(tls: TlsSettings) -> Session {
        Session::new(
            Identity::new("alice", vec![]),
            Arc::new(DatabaseSpec::new("orders", "db.internal:3306").with_tls(tls)),
            "app",
            "",
            Arc::new(RoleSet::default()),
        )
    }

    fn provider() -> StaticCredentialProvider {
        let mut config = CredentialsConfig::default();
        config.passwords.insert("app".into(), Secret::Value("pw".into()));
        config.rds_auth_token = Some(Secret::Env { env: "SQLGATE_TEST_UNSET_TOKEN".into() });
        StaticCredentialProvider::new(config, AuthPreference::default())
    }

    #[tokio::test]
    async fn test_passwords_by_user() {
        let provider = provider();
        let s = session(TlsSettings::default());
        assert_eq!(provider.get_static_password(&s).await.unwrap(), "pw");
        assert_eq!(provider.get_cloud_sql_password(&s).await.unwrap(), "pw");

        let mut other = s.clone();
        other.database_user = "root".into();
        assert!(matches!(provider.get_static_password(&other).await, Err(ProxyError::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_env_secret() {
        let s = session(TlsSettings::default());
        let err = provider().get_rds_auth_token(&s).await.unwrap_err();
        assert!(err.to_string().contains("SQLGATE_TEST_UNSET_TOKEN"));
        assert!(provider().get_azure_access_token(&s).await.is_err());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::Value("hunter2".into());
        assert!(!format!("{:?}", secret).contains("hunter2"));
    }

    #[test]
    fn test_secret_deserialize() {
        let inline: Secret = serde_json::from_str(r#""pw""#).unwrap();
        assert_eq!(inline, Secret::Value("pw".into()));
        let env: Secret = serde_json::from_str(r#"{"env":"DB_PASSWORD"}"#).unwrap();
        assert_eq!(env, Secret::Env { env: "DB_PASSWORD".into() });
    }

    #[tokio::test]
    async fn test_tls_disabled() {
        let tls = TlsSettings { enabled: false, ..Default::default() };
        assert!(provider().get_tls_config(&session(tls)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tls_modes_build() {
        for mode in [TlsMode::VerifyFull, TlsMode::VerifyCa, TlsMode::Insecure] {
            let tls = TlsSettings { mode, ..Default::default() };
            assert!(provider().get_tls_config(&session(tls)).await.unwrap().is_some());
        }
    }

    #[test]
    fn test_bad_ca_file() {
        let tls = TlsSettings {
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(matches!(build_client_config(&tls, None), Err(ProxyError::Tls(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let tls = TlsSettings {
            ca_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(build_client_config(&tls, None), Err(ProxyError::Tls(_))));
    }

    #[test]
    fn test_partial_client_identity() {
        let mut config = CredentialsConfig::default();
        config.client_cert_file = Some(PathBuf::from("/tmp/cert.pem"));
        let provider = StaticCredentialProvider::new(config, AuthPreference::default());
        assert!(matches!(provider.client_identity(), Err(ProxyError::Config(_))));
    }
}
