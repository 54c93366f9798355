//! Route target expression evaluation.
//!
//! Expressions are evaluated against a [`RegistrySnapshot`], an ordered view
//! of every routable module at the moment an event is routed. Results are
//! `IndexSet`s so recipients come out in registry (join) order.

use indexmap::{IndexMap, IndexSet};
use modlink_protocol::{
    EventEnvelope, Labels, ModuleId, ModuleIdentity, ModuleRegistryEntry, ProtocolError,
    ProtocolResult, RouteDestination, RouteTargetExpression,
};
use serde::{Deserialize, Serialize};

/// One routable module as seen by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCandidate {
    pub identity: ModuleIdentity,
    pub name: String,
    pub index: Option<u32>,
    /// Source tag of the session the module connected through.
    pub source: Option<String>,
    labels: Labels,
}

impl RouteCandidate {
    pub fn new(entry: ModuleRegistryEntry) -> Self {
        let labels = entry.identity.effective_labels();
        Self {
            identity: entry.identity,
            name: entry.name,
            index: entry.index,
            source: None,
            labels,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn id(&self) -> &ModuleId {
        &self.identity.id
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn instance_key(&self) -> String {
        match self.index {
            Some(index) => format!("{}#{index}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn to_entry(&self) -> ModuleRegistryEntry {
        ModuleRegistryEntry {
            name: self.name.clone(),
            index: self.index,
            identity: self.identity.clone(),
        }
    }
}

/// Ordered set of routable modules keyed by module id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    candidates: IndexMap<ModuleId, RouteCandidate>,
}

impl RegistrySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a candidate, keeping its original position on
    /// replacement.
    pub fn insert(&mut self, candidate: RouteCandidate) {
        self.candidates.insert(candidate.id().clone(), candidate);
    }

    pub fn remove(&mut self, id: &ModuleId) -> Option<RouteCandidate> {
        self.candidates.shift_remove(id)
    }

    pub fn get(&self, id: &ModuleId) -> Option<&RouteCandidate> {
        self.candidates.get(id)
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.candidates.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteCandidate> {
        self.candidates.values()
    }

    pub fn ids(&self) -> IndexSet<ModuleId> {
        self.candidates.keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<ModuleRegistryEntry> {
        self.iter().map(RouteCandidate::to_entry).collect()
    }
}

impl FromIterator<RouteCandidate> for RegistrySnapshot {
    fn from_iter<T: IntoIterator<Item = RouteCandidate>>(iter: T) -> Self {
        let mut snapshot = Self::new();
        for candidate in iter {
            snapshot.insert(candidate);
        }
        snapshot
    }
}

/// What an event with absent or empty destinations resolves to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyDestinations {
    /// Every routable module.
    #[default]
    Broadcast,
    /// Nobody.
    Drop,
}

// ─── Label selectors ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum LabelSelector<'a> {
    Equals(&'a str, &'a str),
    NotEquals(&'a str, &'a str),
    Exists(&'a str),
    Absent(&'a str),
}

impl<'a> LabelSelector<'a> {
    fn parse(raw: &'a str) -> ProtocolResult<Self> {
        let raw = raw.trim();
        let selector = if let Some(key) = raw.strip_prefix('!') {
            Self::Absent(key.trim())
        } else if let Some((key, value)) = raw.split_once("!=") {
            Self::NotEquals(key.trim(), value.trim())
        } else if let Some((key, value)) = raw.split_once('=') {
            Self::Equals(key.trim(), value.trim())
        } else {
            Self::Exists(raw)
        };

        let key = match selector {
            Self::Equals(key, _)
            | Self::NotEquals(key, _)
            | Self::Exists(key)
            | Self::Absent(key) => key,
        };
        if key.is_empty() {
            return Err(ProtocolError::InvalidRoute(format!(
                "label selector `{raw}` has no key"
            )));
        }
        Ok(selector)
    }

    /// `k!=v` holds when the label is absent too.
    fn matches(&self, labels: &Labels) -> bool {
        match *self {
            Self::Equals(key, value) => labels.get(key).is_some_and(|v| v == value),
            Self::NotEquals(key, value) => labels.get(key).is_none_or(|v| v != value),
            Self::Exists(key) => labels.contains_key(key),
            Self::Absent(key) => !labels.contains_key(key),
        }
    }
}

// ─── Evaluation ────────────────────────────────────────────────────

/// Resolve an expression to the set of matching module ids.
///
/// `and` intersects (an empty `all` matches the whole registry), `or`
/// unions (an empty `any` matches nothing), and an inverted leaf is the
/// complement of the leaf against the snapshot.
pub fn evaluate(
    expression: &RouteTargetExpression,
    snapshot: &RegistrySnapshot,
) -> ProtocolResult<IndexSet<ModuleId>> {
    use RouteTargetExpression as E;

    match expression {
        E::And { all } => {
            let mut matched = snapshot.ids();
            for child in all {
                let child = evaluate(child, snapshot)?;
                matched.retain(|id| child.contains(id));
            }
            Ok(matched)
        }
        E::Or { any } => {
            let mut matched = IndexSet::new();
            for child in any {
                matched.extend(evaluate(child, snapshot)?);
            }
            // Keep registry order regardless of child order.
            Ok(snapshot
                .ids()
                .into_iter()
                .filter(|id| matched.contains(id))
                .collect())
        }
        E::Glob { glob, inverted } => {
            let pattern = glob::Pattern::new(glob)
                .map_err(|e| ProtocolError::InvalidRoute(format!("glob `{glob}`: {e}")))?;
            Ok(select(snapshot, *inverted, |c| pattern.matches(c.id().as_str())))
        }
        E::Ids { ids, inverted } => Ok(select(snapshot, *inverted, |c| {
            ids.iter().any(|id| id == c.id().as_str())
        })),
        E::Plugin { plugins, inverted } => Ok(select(snapshot, *inverted, |c| {
            plugins
                .iter()
                .any(|plugin| plugin == c.identity.plugin.id.as_str())
        })),
        E::Instance {
            instances,
            inverted,
        } => Ok(select(snapshot, *inverted, |c| {
            let key = c.instance_key();
            instances.iter().any(|instance| *instance == key)
        })),
        E::Label {
            selectors,
            inverted,
        } => {
            let parsed = selectors
                .iter()
                .map(|raw| LabelSelector::parse(raw))
                .collect::<ProtocolResult<Vec<_>>>()?;
            Ok(select(snapshot, *inverted, |c| {
                parsed.iter().all(|selector| selector.matches(c.labels()))
            }))
        }
        E::Module { modules, inverted } => Ok(select(snapshot, *inverted, |c| {
            modules.iter().any(|module| *module == c.name)
        })),
        E::Source { sources, inverted } => Ok(select(snapshot, *inverted, |c| {
            c.source
                .as_deref()
                .is_some_and(|source| sources.iter().any(|s| s == source))
        })),
    }
}

fn select(
    snapshot: &RegistrySnapshot,
    inverted: bool,
    predicate: impl Fn(&RouteCandidate) -> bool,
) -> IndexSet<ModuleId> {
    snapshot
        .iter()
        .filter(|candidate| predicate(candidate) != inverted)
        .map(|candidate| candidate.id().clone())
        .collect()
}

/// Union of every destination's resolution.
pub fn evaluate_destinations(
    destinations: &[RouteDestination],
    snapshot: &RegistrySnapshot,
) -> ProtocolResult<IndexSet<ModuleId>> {
    let union = RouteTargetExpression::Or {
        any: destinations
            .iter()
            .map(RouteDestination::to_expression)
            .collect(),
    };
    evaluate(&union, snapshot)
}

/// Recipients of an envelope before sender exclusion.
///
/// `bypass` delivers to the event's inherent target (when it is routable)
/// without evaluating destinations. Absent or empty destinations fall back
/// to `policy`.
pub fn resolve(
    envelope: &EventEnvelope,
    snapshot: &RegistrySnapshot,
    policy: EmptyDestinations,
) -> ProtocolResult<IndexSet<ModuleId>> {
    if envelope.bypasses_routing() {
        return Ok(envelope
            .event
            .inherent_target()
            .filter(|target| snapshot.contains(target))
            .cloned()
            .into_iter()
            .collect());
    }

    match envelope.destinations() {
        Some(destinations) if !destinations.is_empty() => {
            evaluate_destinations(destinations, snapshot)
        }
        _ => Ok(match policy {
            EmptyDestinations::Broadcast => snapshot.ids(),
            EmptyDestinations::Drop => IndexSet::new(),
        }),
    }
}
