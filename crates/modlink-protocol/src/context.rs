//! Context updates: incremental contributions to a shared context thread.

use crate::ids::{ContextId, EventId};
use crate::route::RouteDestination;
use serde::{Deserialize, Serialize};

/// How an update folds into the recipient's existing context state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextUpdateStrategy {
    /// Discard the sender's prior content in scope, then insert.
    ReplaceSelf,
    /// Accumulate.
    #[default]
    AppendSelf,
}

/// `id` identifies a delivery attempt; `context_id` the logical thread.
/// Retries reuse `context_id` and may mint new ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUpdate {
    pub id: EventId,
    pub context_id: ContextId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    pub strategy: ContextUpdateStrategy,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destinations: Option<Vec<RouteDestination>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ContextUpdate {
    pub fn new(
        context_id: impl Into<ContextId>,
        strategy: ContextUpdateStrategy,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::default(),
            context_id: context_id.into(),
            lane: None,
            strategy,
            text: text.into(),
            content: None,
            destinations: None,
            metadata: None,
        }
    }

    pub fn in_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_wire_names() {
        let update = ContextUpdate::new("ctx", ContextUpdateStrategy::ReplaceSelf, "hello")
            .in_lane("weather");
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["strategy"], "replace-self");
        assert_eq!(json["contextId"], "ctx");
        assert_eq!(json["lane"], "weather");
    }
}
