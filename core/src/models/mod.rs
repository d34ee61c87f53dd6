//! Data models for proxied database sessions
//!
//! This module provides data structures describing who is connecting,
//! which database they are connecting to and the per-connection session
//! descriptor that ties the two together.

mod database;
mod identity;
mod session;

pub use database::{join_host_port, split_host_port, BackendKind, DatabaseSpec, TlsMode, TlsSettings};
pub use identity::Identity;
pub use session::Session;
