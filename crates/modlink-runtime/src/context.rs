//! Folding of `context:update` events into per-thread state.

use indexmap::IndexMap;
use modlink_protocol::{ContextId, ContextUpdate, ContextUpdateStrategy, EventId, ModuleId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::dedupe::RecentSet;

/// What `replace-self` discards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplaceScope {
    /// The sender's prior entries in the same lane.
    #[default]
    Lane,
    /// All of the sender's prior entries in the context thread.
    Context,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub id: EventId,
    pub source: Option<ModuleId>,
    pub lane: Option<String>,
    pub text: String,
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextApply {
    Applied { replaced: usize },
    Duplicate,
}

/// Context threads, at most `capacity` of them with at most `capacity`
/// entries each. The least recently updated thread and the oldest entry
/// give way first.
#[derive(Debug)]
pub struct ContextStore {
    scope: ReplaceScope,
    capacity: usize,
    seen: RecentSet<EventId>,
    threads: IndexMap<ContextId, Vec<ContextEntry>>,
}

impl ContextStore {
    pub fn new(scope: ReplaceScope, capacity: usize) -> Self {
        Self {
            scope,
            capacity: capacity.max(1),
            seen: RecentSet::new(capacity),
            threads: IndexMap::new(),
        }
    }

    /// Fold `update` from `source` into its thread. A repeated `id` is a
    /// retried delivery and changes nothing.
    pub fn apply(&mut self, source: Option<&ModuleId>, update: &ContextUpdate) -> ContextApply {
        if !self.seen.insert(update.id.clone()) {
            debug!(id = %update.id, context_id = %update.context_id, "duplicate context update");
            return ContextApply::Duplicate;
        }

        let mut entries = self
            .threads
            .shift_remove(&update.context_id)
            .unwrap_or_default();
        if self.threads.len() >= self.capacity
            && let Some((evicted, _)) = self.threads.shift_remove_index(0)
        {
            debug!(context_id = %evicted, "context thread evicted");
        }
        let mut replaced = 0;
        if update.strategy == ContextUpdateStrategy::ReplaceSelf {
            let before = entries.len();
            let scope = self.scope;
            entries.retain(|entry| {
                let same_source = entry.source.as_ref() == source;
                let in_scope = match scope {
                    ReplaceScope::Lane => entry.lane == update.lane,
                    ReplaceScope::Context => true,
                };
                !(same_source && in_scope)
            });
            replaced = before - entries.len();
        }

        entries.push(ContextEntry {
            id: update.id.clone(),
            source: source.cloned(),
            lane: update.lane.clone(),
            text: update.text.clone(),
            content: update.content.clone(),
        });
        if entries.len() > self.capacity {
            let overflow = entries.len() - self.capacity;
            entries.drain(..overflow);
        }
        self.threads.insert(update.context_id.clone(), entries);
        ContextApply::Applied { replaced }
    }

    /// Remove every entry contributed by `module`. Threads left empty are
    /// dropped.
    pub fn forget_source(&mut self, module: &ModuleId) -> usize {
        let mut removed = 0;
        self.threads.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.source.as_ref() != Some(module));
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn entries(&self, context_id: &ContextId) -> &[ContextEntry] {
        self.threads
            .get(context_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Entry texts of a thread joined by newlines.
    pub fn text(&self, context_id: &ContextId) -> String {
        self.entries(context_id)
            .iter()
            .map(|entry| entry.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(strategy: ContextUpdateStrategy, lane: &str, text: &str) -> ContextUpdate {
        ContextUpdate::new("weather", strategy, text).in_lane(lane)
    }

    #[test]
    fn append_accumulates_and_duplicates_are_ignored() {
        let mut store = ContextStore::new(ReplaceScope::Lane, 16);
        let sender = ModuleId::from("weather-bot");
        let first = update(ContextUpdateStrategy::AppendSelf, "today", "sunny");

        assert_eq!(store.apply(Some(&sender), &first), ContextApply::Applied { replaced: 0 });
        assert_eq!(store.apply(Some(&sender), &first), ContextApply::Duplicate);
        store.apply(
            Some(&sender),
            &update(ContextUpdateStrategy::AppendSelf, "today", "windy"),
        );
        assert_eq!(store.text(&ContextId::from("weather")), "sunny\nwindy");
    }

    #[test]
    fn replace_is_scoped_to_sender_and_lane() {
        let mut store = ContextStore::new(ReplaceScope::Lane, 16);
        let bot = ModuleId::from("bot");
        let other = ModuleId::from("other");
        store.apply(Some(&bot), &update(ContextUpdateStrategy::AppendSelf, "today", "a"));
        store.apply(Some(&bot), &update(ContextUpdateStrategy::AppendSelf, "tomorrow", "b"));
        store.apply(Some(&other), &update(ContextUpdateStrategy::AppendSelf, "today", "c"));

        let outcome = store.apply(
            Some(&bot),
            &update(ContextUpdateStrategy::ReplaceSelf, "today", "d"),
        );
        assert_eq!(outcome, ContextApply::Applied { replaced: 1 });
        assert_eq!(store.text(&ContextId::from("weather")), "b\nc\nd");
    }

    #[test]
    fn threads_and_entries_are_bounded() {
        let mut store = ContextStore::new(ReplaceScope::Lane, 2);
        let bot = ModuleId::from("bot");
        for text in ["a", "b", "c"] {
            store.apply(Some(&bot), &update(ContextUpdateStrategy::AppendSelf, "today", text));
        }
        assert_eq!(store.text(&ContextId::from("weather")), "b\nc");

        for thread in ["news", "calendar"] {
            let update = ContextUpdate::new(thread, ContextUpdateStrategy::AppendSelf, thread);
            store.apply(Some(&bot), &update);
        }
        assert_eq!(store.thread_count(), 2);
        assert!(store.entries(&ContextId::from("weather")).is_empty());
    }

    #[test]
    fn departed_sources_leave_no_entries() {
        let mut store = ContextStore::new(ReplaceScope::Lane, 16);
        let bot = ModuleId::from("bot");
        let other = ModuleId::from("other");
        store.apply(Some(&bot), &update(ContextUpdateStrategy::AppendSelf, "today", "a"));
        store.apply(Some(&other), &update(ContextUpdateStrategy::AppendSelf, "today", "b"));
        let solo = ContextUpdate::new("news", ContextUpdateStrategy::AppendSelf, "c");
        store.apply(Some(&bot), &solo);

        assert_eq!(store.forget_source(&bot), 2);
        assert_eq!(store.text(&ContextId::from("weather")), "b");
        assert_eq!(store.thread_count(), 1);
    }

    #[test]
    fn context_scope_replaces_every_lane_of_the_sender() {
        let mut store = ContextStore::new(ReplaceScope::Context, 16);
        let bot = ModuleId::from("bot");
        store.apply(Some(&bot), &update(ContextUpdateStrategy::AppendSelf, "today", "a"));
        store.apply(Some(&bot), &update(ContextUpdateStrategy::AppendSelf, "tomorrow", "b"));

        let outcome = store.apply(
            Some(&bot),
            &update(ContextUpdateStrategy::ReplaceSelf, "today", "c"),
        );
        assert_eq!(outcome, ContextApply::Applied { replaced: 2 });
        assert_eq!(store.text(&ContextId::from("weather")), "c");
    }
}
