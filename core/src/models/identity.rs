//! Authenticated principal

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Identity of the authenticated principal behind a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Principal name
    pub username: String,

    /// Roles assigned to the principal
    #[serde(default)]
    pub roles: Vec<String>,

    /// Marker of the MFA device used to verify this identity, if any
    #[serde(default)]
    pub mfa_verified: Option<String>,
}

impl Identity {
    /// Create an identity without MFA verification
    pub fn new(username: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            username: username.into(),
            roles,
            mfa_verified: None,
        }
    }

    /// Mark the identity as MFA-verified by the given device
    pub fn with_mfa_verified(mut self, device: impl Into<String>) -> Self {
        self.mfa_verified = Some(device.into());
        self
    }

    /// Whether the identity passed an MFA check
    pub fn is_mfa_verified(&self) -> bool {
        self.mfa_verified.as_deref().map_or(false, |d| !d.is_empty())
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.username)
    }
}
