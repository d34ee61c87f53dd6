//! Per-connection session descriptor

use chrono::{DateTime, Utc};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use super::{DatabaseSpec, Identity};
use crate::access::AccessChecker;

/// Immutable descriptor of one proxied client connection
///
/// Built once when a client is accepted and read-only afterwards.
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique session id
    pub id: Uuid,

    /// Authenticated principal
    pub identity: Identity,

    /// Target database
    pub database: Arc<DatabaseSpec>,

    /// Database account requested by the client
    pub database_user: String,

    /// Database (schema) requested by the client, may be empty
    pub database_name: String,

    /// Authorization decision function for this principal
    pub checker: Arc<dyn AccessChecker>,

    /// When the client connected
    pub start_time: DateTime<Utc>,

    /// Client address, if known
    pub client_addr: Option<SocketAddr>,
}

impl Session {
    /// Create a session with a fresh id
    pub fn new(
        identity: Identity,
        database: Arc<DatabaseSpec>,
        database_user: impl Into<String>,
        database_name: impl Into<String>,
        checker: Arc<dyn AccessChecker>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            database,
            database_user: database_user.into(),
            database_name: database_name.into(),
            checker,
            start_time: Utc::now(),
            client_addr: None,
        }
    }

    /// Record the client address
    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// Lease name serializing password rotation for this database account
    pub fn lease_name(&self) -> String {
        format!("{}+{}", self.database.name, self.database_user)
    }
}

impl Display for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "session {} ({} as {}@{}",
            self.id, self.identity, self.database_user, self.database.name
        )?;
        if !self.database_name.is_empty() {
            write!(f, "/{}", self.database_name)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::RoleSet;

    fn session() -> Session {
        Session::new(
            Identity::new("alice", vec![]),
            Arc::new(DatabaseSpec::new("orders", "localhost:3306")),
            "app",
            "",
            Arc::new(RoleSet::default()),
        )
    }

    #[test]
    fn test_lease_name() {
        assert_eq!(session().lease_name(), "orders+app");
    }

    #[test]
    fn test_display() {
        let mut s = session();
        let text = s.to_string();
        assert!(text.ends_with("(alice as app@orders)"));

        s.database_name = "sales".into();
        assert!(s.to_string().ends_with("(alice as app@orders/sales)"));
    }

    #[test]
    fn test_unique_ids() {
        assert_ne!(session().id, session().id);
    }
}
