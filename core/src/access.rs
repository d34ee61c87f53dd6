//! Session authorization
//!
//! An [`AccessChecker`] decides whether a principal may use a database
//! account on a database service. The proxy asks it once per connection,
//! before any backend connection is attempted.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

use crate::defaults::PROTOCOL_MYSQL;
use crate::models::DatabaseSpec;

/// Wildcard matching every value in a role condition
pub const WILDCARD: &str = "*";

/// Access was denied by policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct AccessDenied {
    /// Human-readable denial reason
    pub reason: String,
}

impl AccessDenied {
    /// Create a denial with the given reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// MFA state relevant to an access decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessMfaParams {
    /// The principal verified MFA for this session
    pub verified: bool,

    /// Cluster-wide policy requires MFA for every session
    pub always_required: bool,
}

/// Cluster-wide authentication preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthPreference {
    /// Require MFA verification for every database session
    #[serde(default)]
    pub require_session_mfa: bool,
}

/// A requested account attribute that roles must allow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleMatcher {
    /// Database account the session logs in as
    DatabaseUser(String),

    /// Database (schema) the session selects
    DatabaseName(String),
}

impl RoleMatcher {
    fn matches(&self, conditions: &RoleConditions) -> bool {
        match self {
            RoleMatcher::DatabaseUser(user) => matches_any(&conditions.db_users, user),
            RoleMatcher::DatabaseName(name) => matches_any(&conditions.db_names, name),
        }
    }
}

/// Build the role matchers for a database connection attempt
///
/// MySQL databases are schemas that a connected account can switch between
/// freely, so only the database account is matched for MySQL.
pub fn database_role_matchers(protocol: &str, user: &str, database: &str) -> Vec<RoleMatcher> {
    let mut matchers = vec![RoleMatcher::DatabaseUser(user.to_string())];
    if protocol != PROTOCOL_MYSQL {
        matchers.push(RoleMatcher::DatabaseName(database.to_string()));
    }
    matchers
}

/// Authorization decision function bound to a session
pub trait AccessChecker: Debug + Send + Sync {
    /// Check whether the principal may access the database with the
    /// requested account attributes
    fn check_access(
        &self,
        database: &DatabaseSpec,
        mfa: &AccessMfaParams,
        matchers: &[RoleMatcher],
    ) -> Result<(), AccessDenied>;
}

/// Allow or deny conditions of a role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConditions {
    /// Database services, by name
    #[serde(default)]
    pub db_services: Vec<String>,

    /// Database accounts
    #[serde(default)]
    pub db_users: Vec<String>,

    /// Database names
    #[serde(default)]
    pub db_names: Vec<String>,
}

/// A named set of database permissions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role name
    pub name: String,

    /// Conditions granting access
    #[serde(default)]
    pub allow: RoleConditions,

    /// Conditions revoking access, evaluated before `allow`
    #[serde(default)]
    pub deny: RoleConditions,

    /// Require MFA verification for sessions using this role
    #[serde(default)]
    pub require_session_mfa: bool,
}

/// The roles held by a principal
#[derive(Debug, Clone, Default)]
pub struct RoleSet {
    roles: Vec<Role>,
}

impl RoleSet {
    /// Create a role set
    pub fn new(roles: Vec<Role>) -> Self {
        Self { roles }
    }

    /// Roles in this set
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }
}

impl AccessChecker for RoleSet {
    fn check_access(
        &self,
        database: &DatabaseSpec,
        mfa: &AccessMfaParams,
        matchers: &[RoleMatcher],
    ) -> Result<(), AccessDenied> {
        let mfa_required = mfa.always_required || self.roles.iter().any(|r| r.require_session_mfa);
        if mfa_required && !mfa.verified {
            return Err(AccessDenied::new(
                "access to database denied: MFA verification is required for this session",
            ));
        }

        for role in &self.roles {
            if matches_any(&role.deny.db_services, &database.name)
                && matchers.iter().any(|m| m.matches(&role.deny))
            {
                log::debug!("Access to database {:?} denied by role {:?}", database.name, role.name);
                return Err(AccessDenied::new(format!(
                    "access to database {:?} denied by role {:?}",
                    database.name, role.name
                )));
            }
        }

        let allowed = self.roles.iter().any(|role| {
            matches_any(&role.allow.db_services, &database.name)
                && matchers.iter().all(|m| m.matches(&role.allow))
        });
        if !allowed {
            return Err(AccessDenied::new(
                "access to database denied: user does not have permissions, confirm database user and name",
            ));
        }
        Ok(())
    }
}

fn matches_any(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| p == WILDCARD || p == value)
}
