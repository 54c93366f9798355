//! Spark channel payloads: notify / command / emit.

use crate::ids::EventId;
use crate::route::RouteDestination;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SparkUrgency {
    Immediate,
    #[default]
    Soon,
    Later,
}

/// Fire-and-forget episodic signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SparkNotify {
    pub id: EventId,
    pub event_id: EventId,
    pub kind: String,
    #[serde(default)]
    pub urgency: SparkUrgency,
    pub headline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destinations: Option<Vec<RouteDestination>>,
    #[serde(default)]
    pub requires_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Milliseconds since UNIX epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,
}

/// How a command interacts with whatever the receiver is doing.
///
/// Encoded on the wire as `"force"`, `"soft"` or `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SparkInterrupt {
    /// Suspend the current action before processing the intent.
    Force,
    /// Queue behind the current action.
    Soft,
    /// Advisory only.
    #[default]
    Advisory,
}

impl Serialize for SparkInterrupt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Force => serializer.serialize_str("force"),
            Self::Soft => serializer.serialize_str("soft"),
            Self::Advisory => serializer.serialize_bool(false),
        }
    }
}

impl<'de> Deserialize<'de> for SparkInterrupt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct InterruptVisitor;

        impl Visitor<'_> for InterruptVisitor {
            type Value = SparkInterrupt;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"force\", \"soft\" or false")
            }

            fn visit_bool<E: de::Error>(self, value: bool) -> Result<Self::Value, E> {
                if value {
                    Err(E::invalid_value(de::Unexpected::Bool(true), &self))
                } else {
                    Ok(SparkInterrupt::Advisory)
                }
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                match value {
                    "force" => Ok(SparkInterrupt::Force),
                    "soft" => Ok(SparkInterrupt::Soft),
                    other => Err(E::unknown_variant(other, &["force", "soft"])),
                }
            }
        }

        deserializer.deserialize_any(InterruptVisitor)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SparkPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A directive for a receiving agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SparkCommand {
    pub id: EventId,
    /// The notify this command answers, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    pub intent: String,
    #[serde(default)]
    pub interrupt: SparkInterrupt,
    #[serde(default)]
    pub priority: SparkPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destinations: Option<Vec<RouteDestination>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

/// Progress of a notify/command as reported by its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SparkEmitState {
    Queued,
    Working,
    Done,
    Dropped,
    Blocked,
    Expired,
}

impl SparkEmitState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Dropped | Self::Blocked | Self::Expired
        )
    }

    /// One-way progression `queued → working → terminal`.
    pub fn can_advance_to(self, next: Self) -> bool {
        match self {
            Self::Queued => next != Self::Queued,
            Self::Working => next.is_terminal(),
            _ => false,
        }
    }
}

/// Ack/progress/terminal report correlated by `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SparkEmit {
    pub id: EventId,
    pub event_id: EventId,
    pub state: SparkEmitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}
