//! Error types for the MySQL proxy
//!
//! This module provides error types for the proxy server and the mapping of
//! those errors to MySQL ERR packets sent to clients.

use std::io;
use std::net::AddrParseError;
use thiserror::Error;

use sqlgate_core::error::CoreError;

use crate::protocol::ErrPacket;

/// Result type for the proxy
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Message returned to clients when a database or provider throttles us
pub const TRY_AGAIN_LATER: &str = "could not connect to the database, please try again later";

/// MySQL: access denied for user to database
pub const ER_DBACCESS_DENIED_ERROR: u16 = 1044;
/// MySQL: access denied for user
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
/// MySQL: access denied, no password
pub const ER_ACCESS_DENIED_NO_PASSWORD_ERROR: u16 = 1698;
/// MySQL: missing privilege
pub const ER_SPECIFIC_ACCESS_DENIED_ERROR: u16 = 1227;
/// MySQL: too many connections
pub const ER_CON_COUNT_ERROR: u16 = 1040;
/// MySQL: user has too many connections
pub const ER_TOO_MANY_USER_CONNECTIONS: u16 = 1203;
/// MySQL: user exceeded a resource limit
pub const ER_USER_LIMIT_REACHED: u16 = 1226;
/// MySQL: bad handshake
pub const ER_HANDSHAKE_ERROR: u16 = 1043;
/// MySQL: unknown error
pub const ER_UNKNOWN_ERROR: u16 = 1105;

/// Error type for the proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The principal may not use the requested database account
    #[error("{0}")]
    AccessDenied(String),

    /// A database or credential provider throttled the connection attempt
    #[error("{0}")]
    LimitExceeded(String),

    /// Fetching a token, password or lease failed
    #[error("failed to get {what}: {source}")]
    CredentialAcquisition {
        /// What was being fetched
        what: String,
        /// Underlying failure
        #[source]
        source: Box<ProxyError>,
    },

    /// The database rejected the proxy's credentials
    #[error("{0}")]
    BackendAccessDenied(String),

    /// Malformed or disallowed protocol traffic
    #[error("MySQL protocol error: {0}")]
    Protocol(String),

    /// The peer closed the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Error reported by the database
    #[error("ERROR {code} ({state}): {message}")]
    Backend {
        /// MySQL error code
        code: u16,
        /// SQL state
        state: String,
        /// Error message
        message: String,
    },

    /// Core component error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The session was cancelled by its owner
    #[error("session cancelled")]
    Cancelled,

    /// Operation did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Server lifecycle error
    #[error("Server error: {0}")]
    Server(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Address parsing error
    #[error("Address parsing error: {0}")]
    AddrParse(#[from] AddrParseError),
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout(err.to_string())
    }
}

impl ProxyError {
    /// Wrap a credential lookup failure
    pub fn credential(what: impl Into<String>, source: impl Into<ProxyError>) -> Self {
        ProxyError::CredentialAcquisition {
            what: what.into(),
            source: Box::new(source.into()),
        }
    }

    /// Whether the error, or the error it wraps, reports throttling
    pub fn is_limit_exceeded(&self) -> bool {
        match self {
            ProxyError::LimitExceeded(_) => true,
            ProxyError::Core(err) => err.is_limit_exceeded(),
            ProxyError::CredentialAcquisition { source, .. } => source.is_limit_exceeded(),
            _ => false,
        }
    }

    /// Whether the error is an expected end of a connection
    pub fn is_ok_network_error(&self) -> bool {
        match self {
            ProxyError::ConnectionClosed => true,
            ProxyError::Io(err) => is_ok_network_error(err),
            _ => false,
        }
    }
}

/// Whether an I/O error is an expected way for a connection to end
pub fn is_ok_network_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// Classify an error reported by a database during connect
pub fn convert_backend_error(err: ProxyError) -> ProxyError {
    match err {
        ProxyError::Backend { code, message, .. }
            if matches!(
                code,
                ER_DBACCESS_DENIED_ERROR
                    | ER_ACCESS_DENIED_ERROR
                    | ER_ACCESS_DENIED_NO_PASSWORD_ERROR
                    | ER_SPECIFIC_ACCESS_DENIED_ERROR
            ) =>
        {
            ProxyError::AccessDenied(message)
        }
        ProxyError::Backend { code, message, .. }
            if matches!(
                code,
                ER_CON_COUNT_ERROR | ER_TOO_MANY_USER_CONNECTIONS | ER_USER_LIMIT_REACHED
            ) =>
        {
            ProxyError::LimitExceeded(message)
        }
        other => other,
    }
}

/// Convert a ProxyError to the MySQL ERR packet sent to the client
pub fn to_err_packet(error: &ProxyError) -> ErrPacket {
    match error {
        ProxyError::AccessDenied(msg) | ProxyError::BackendAccessDenied(msg) => {
            ErrPacket::with_state(ER_ACCESS_DENIED_ERROR, "28000", msg.clone())
        }
        ProxyError::LimitExceeded(msg) => ErrPacket::with_state(ER_CON_COUNT_ERROR, "08004", msg.clone()),
        ProxyError::Backend { code, state, message } => ErrPacket::with_state(*code, state, message.clone()),
        ProxyError::Protocol(msg) => ErrPacket::with_state(ER_HANDSHAKE_ERROR, "08S01", msg.clone()),
        _ => ErrPacket::new(ER_UNKNOWN_ERROR, error.to_string()),
    }
}
