//! Participant identity
//!
//! Every component receives the local [`ParticipantIdentity`] explicitly at
//! construction time. The identity's id doubles as the participant's personal
//! room on the relay, so events addressed to it are routed to this endpoint.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Opaque participant identifier (also the personal room name on the relay)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Create a new participant id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (never routable)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A participant as supplied by the embedding application
///
/// Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantIdentity {
    /// Routable id
    pub id: ParticipantId,
    /// Human-readable name shown to the remote side
    pub display_name: String,
}

impl ParticipantIdentity {
    /// Create a new identity
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Identity known only by id; the id is reused as display name
    pub fn anonymous(id: impl Into<ParticipantId>) -> Self {
        let id = id.into();
        let display_name = id.0.clone();
        Self { id, display_name }
    }
}

impl Display for ParticipantIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}
