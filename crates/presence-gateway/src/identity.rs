//! Connection identity.
//!
//! Identity is asserted by the upstream auth collaborator and accepted as a
//! trusted claim at handshake time. The gateway never verifies credentials.

use crate::errors::GatewayError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A user role as carried in the identity claim.
///
/// Unknown roles are kept verbatim so they still get a `role:<role>` topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Patient,
    Provider,
    Admin,
    Superadmin,
    Other(String),
}

impl Role {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "patient" => Role::Patient,
            "provider" => Role::Provider,
            "admin" => Role::Admin,
            "superadmin" => Role::Superadmin,
            other => Role::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Role::Patient => "patient",
            Role::Provider => "provider",
            Role::Admin => "admin",
            Role::Superadmin => "superadmin",
            Role::Other(other) => other,
        }
    }

    /// Roles allowed to watch any patient stream and the global alert feed.
    #[must_use]
    pub fn is_care_team(&self) -> bool {
        matches!(self, Role::Provider | Role::Admin | Role::Superadmin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Role::parse(&value))
    }
}

/// Resolved identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Option<Role>,
    pub organization_id: Option<String>,
}

impl Identity {
    /// Build an identity, rejecting a missing or blank user id.
    pub fn new(
        user_id: impl Into<String>,
        role: Option<Role>,
        organization_id: Option<String>,
    ) -> Result<Self, GatewayError> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(GatewayError::IdentityMissing);
        }

        Ok(Self {
            user_id,
            role,
            organization_id: organization_id.filter(|org| !org.trim().is_empty()),
        })
    }

    #[must_use]
    pub fn is_care_team(&self) -> bool {
        self.role.as_ref().is_some_and(Role::is_care_team)
    }
}

/// Identity claim as forwarded by the auth collaborator on the handshake.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityClaim {
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub organization_id: Option<String>,
}

impl IdentityClaim {
    /// Resolve the claim into an [`Identity`].
    ///
    /// # Errors
    ///
    /// Returns `IdentityMissing` when the claim has no usable user id.
    pub fn into_identity(self) -> Result<Identity, GatewayError> {
        let user_id = self.user_id.ok_or(GatewayError::IdentityMissing)?;
        let role = self
            .role
            .filter(|role| !role.trim().is_empty())
            .map(|role| Role::parse(&role));
        Identity::new(user_id, role, self.organization_id)
    }
}
