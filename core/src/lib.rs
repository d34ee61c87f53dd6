//! # sqlgate core
//!
//! Session model, access checks and distributed leases for the sqlgate
//! database access proxy. Nothing in this crate touches the wire protocol.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod access;
pub mod clock;
pub mod defaults;
pub mod error;
pub mod lease;
pub mod models;
pub mod retry;

/// Re-export common types for ease of use
pub use access::{AccessChecker, AccessDenied, AccessMfaParams, AuthPreference, RoleMatcher, RoleSet};
pub use clock::{Clock, SystemClock};
pub use error::{CoreError, Result};
pub use lease::{AcquireLeaseConfig, Lease, LeaseManager, LeaseRequest};
pub use models::{BackendKind, DatabaseSpec, Identity, Session, TlsMode, TlsSettings};
pub use retry::LinearRetry;

/// Version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
