//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Get the underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a managed node
    NodeId
);
uuid_id!(
    /// Unique identifier for a compose
    ComposeId
);
uuid_id!(
    /// Unique identifier for an immutable compose version
    ComposeVersionId
);
uuid_id!(
    /// Unique identifier for a deployment (compose bound to node)
    DeploymentId
);
uuid_id!(
    /// Unique identifier for a tenant
    TenantId
);

/// Lifecycle state of a remote session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No transport is open
    Disconnected,
    /// Transport and authentication in progress
    Connecting,
    /// Authenticated and ready for commands
    Connected,
}

impl SessionState {
    /// Encode for atomic storage
    pub fn as_u8(self) -> u8 {
        match self {
            SessionState::Disconnected => 0,
            SessionState::Connecting => 1,
            SessionState::Connected => 2,
        }
    }

    /// Decode from atomic storage
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            _ => SessionState::Disconnected,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_parse_and_display() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_node_id_parse_trims_whitespace() {
        let id = NodeId::new();
        let parsed: NodeId = format!(" {}\n", id).parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_node_id_rejects_garbage() {
        assert!("not-a-node".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = DeploymentId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_session_state_atomic_encoding() {
        for state in [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Connected,
        ] {
            assert_eq!(SessionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(format!("{}", SessionState::Connected), "connected");
    }
}
