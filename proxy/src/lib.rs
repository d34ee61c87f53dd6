//! sqlgate MySQL proxy
//!
//! This crate provides an access proxy for MySQL. Clients log in to the proxy
//! as a principal, the proxy checks the principal's roles, logs in to the
//! database with short-lived credentials and relays the session.

// Error types and result
pub mod error;
pub use error::{ProxyError, Result};

// Configuration
pub mod config;
pub use config::ProxyConfig;

// Protocol-related modules
pub mod protocol;
pub use protocol::{ErrPacket, OkPacket, Packet, PacketCodec};

// Session audit
pub mod audit;
pub use audit::{Audit, AuditEvent, LogAudit};

// Database credentials
pub mod credentials;
pub use credentials::{CredentialProvider, StaticCredentialProvider};

// Outgoing database connections
pub mod backend;
pub use backend::{BackendConnector, BackendStream};

// Client connection phase
pub mod frontend;
pub use frontend::{ClientLogin, Principal};

// Per-connection proxying
pub mod engine;
pub use engine::{Engine, EngineConfig, EngineDeps};

// Security features
pub mod security;
pub use security::{RateLimiter, RateLimiterConfig};

// Server implementation
pub mod server;
pub use server::ProxyServer;
