//! Topic names.
//!
//! Topics are the unit of fanout. Every topic a connection can be in has one
//! of six shapes; anything else is rejected with `UnknownTopic`.

use crate::errors::GatewayError;
use crate::identity::Role;
use common::types::CallId;
use std::fmt;
use std::str::FromStr;

/// Name of the global alert feed topic.
pub const ALERTS_ALL: &str = "alerts:all";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `user:<id>`, every connection of one user.
    User(String),
    /// `role:<role>`
    Role(String),
    /// `org:<id>`
    Org(String),
    /// `patient:<id>`, watchers of one patient's streams.
    Patient(String),
    /// `alerts:all`
    AlertsAll,
    /// `call:<id>`, exactly the two participants of a connected call.
    Call(CallId),
}

impl Topic {
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Topic::User(user_id.into())
    }

    #[must_use]
    pub fn role(role: &Role) -> Self {
        Topic::Role(role.as_str().to_string())
    }

    #[must_use]
    pub fn org(organization_id: impl Into<String>) -> Self {
        Topic::Org(organization_id.into())
    }

    #[must_use]
    pub fn patient(patient_id: impl Into<String>) -> Self {
        Topic::Patient(patient_id.into())
    }

    /// Short label for metrics and logs. Never includes the id.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Topic::User(_) => "user",
            Topic::Role(_) => "role",
            Topic::Org(_) => "org",
            Topic::Patient(_) => "patient",
            Topic::AlertsAll => "alerts",
            Topic::Call(_) => "call",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::User(id) => write!(f, "user:{id}"),
            Topic::Role(role) => write!(f, "role:{role}"),
            Topic::Org(id) => write!(f, "org:{id}"),
            Topic::Patient(id) => write!(f, "patient:{id}"),
            Topic::AlertsAll => f.write_str(ALERTS_ALL),
            Topic::Call(id) => write!(f, "call:{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == ALERTS_ALL {
            return Ok(Topic::AlertsAll);
        }

        let unknown = || GatewayError::UnknownTopic(s.to_string());
        let (prefix, rest) = s.split_once(':').ok_or_else(unknown)?;
        if rest.is_empty() {
            return Err(unknown());
        }

        match prefix {
            "user" => Ok(Topic::User(rest.to_string())),
            "role" => Ok(Topic::Role(rest.to_string())),
            "org" => Ok(Topic::Org(rest.to_string())),
            "patient" => Ok(Topic::Patient(rest.to_string())),
            "call" => rest.parse().map(Topic::Call).map_err(|_| unknown()),
            _ => Err(unknown()),
        }
    }
}
