//! Caller identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// The composite key a request is rate limited against.
///
/// Identities are resolved by the hosting framework; this crate never
/// authenticates anyone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Client address
    pub ip: IpAddr,
    /// Authenticated user, if any
    #[serde(default)]
    pub user_id: Option<String>,
    /// Role of the authenticated user, if any
    #[serde(default)]
    pub role: Option<String>,
}

impl Identity {
    /// An unauthenticated caller.
    pub fn anonymous(ip: IpAddr) -> Self {
        Self {
            ip,
            user_id: None,
            role: None,
        }
    }

    /// Attach an authenticated user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Key for the caller's address: `ip:<addr>`.
    pub fn ip_key(&self) -> String {
        format!("ip:{}", self.ip)
    }

    /// Key for the authenticated user: `user:<id>`.
    pub fn user_key(&self) -> Option<String> {
        self.user_id.as_ref().map(|id| format!("user:{}", id))
    }

    /// Who is held accountable for the request: the user when
    /// authenticated, otherwise the address.
    pub fn principal(&self) -> String {
        self.user_key().unwrap_or_else(|| self.ip_key())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ip)?;
        if let Some(user) = &self.user_id {
            write!(f, "/user={}", user)?;
        }
        if let Some(role) = &self.role {
            write!(f, "/role={}", role)?;
        }
        Ok(())
    }
}
