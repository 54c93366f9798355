//! Typed identifiers used across the protocol.
//!
//! All ids are opaque serde-transparent strings. The protocol never parses
//! them; uniqueness and stability are the issuer's concern.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new random id (UUID v4).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Identifier of a running module instance (`ModuleIdentity.id`).
    ModuleId
);
typed_id!(
    /// Identifier of the plugin software a module runs.
    PluginId
);
typed_id!(
    /// Capability id, unique within its owning module only.
    CapabilityId
);
typed_id!(
    /// Identifier of a logical configuration document.
    ConfigId
);
typed_id!(
    /// Identifier of a single event delivery attempt.
    EventId
);
typed_id!(
    /// Identifier of a logical context thread.
    ContextId
);

impl Default for EventId {
    fn default() -> Self {
        Self::new_uuid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_default_is_unique() {
        let a = EventId::default();
        let b = EventId::default();
        assert_ne!(a, b);
    }

    #[test]
    fn module_id_from_str_trait() {
        let id: ModuleId = "telegram-bot".into();
        assert_eq!(id.as_str(), "telegram-bot");
        assert_eq!(id.to_string(), "telegram-bot");
    }

    #[test]
    fn typed_id_serializes_as_plain_string() {
        let id = CapabilityId::from_string("llm:orchestrator");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"llm:orchestrator\"");
        let back: CapabilityId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn typed_id_hash_equality() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(ContextId::from_string("thread-1"));
        assert!(set.contains(&ContextId::from_string("thread-1")));
    }
}
