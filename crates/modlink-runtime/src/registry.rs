//! Connected sessions and the modules announced over them.

use indexmap::IndexMap;
use modlink_protocol::{
    ModuleConfigSchema, ModuleId, ModuleIdentity, ModulePhase, ModuleRegistryEntry,
};
use modlink_protocol::event::{CompatibilityResult, ModuleAnnounce};
use modlink_routing::{RegistrySnapshot, RouteCandidate};
use serde::Serialize;

use crate::capability::CapabilitySet;
use crate::lifecycle::{ModuleLifecycle, RoleIndex};

/// Label naming extra roles a module provides (`role=stt,tts`).
pub const ROLE_LABEL: &str = "role";

#[derive(Debug, Clone)]
pub struct AnnouncedModule {
    pub name: String,
    pub index: Option<u32>,
    pub identity: ModuleIdentity,
    pub possible_events: Vec<String>,
    pub config_schema: Option<ModuleConfigSchema>,
    pub lifecycle: ModuleLifecycle,
    pub capabilities: CapabilitySet,
}

impl AnnouncedModule {
    pub fn from_announce(announce: &ModuleAnnounce) -> Self {
        Self {
            name: announce.name.clone(),
            index: announce.index,
            identity: announce.identity.clone(),
            possible_events: announce.possible_events.clone(),
            config_schema: announce.config_schema.clone(),
            lifecycle: ModuleLifecycle::new(announce.dependencies.clone()),
            capabilities: CapabilitySet::new(),
        }
    }

    pub fn phase(&self) -> ModulePhase {
        self.lifecycle.phase()
    }

    pub fn entry(&self) -> ModuleRegistryEntry {
        ModuleRegistryEntry {
            name: self.name.clone(),
            index: self.index,
            identity: self.identity.clone(),
        }
    }

    /// Announced and not failed.
    pub fn is_live(&self) -> bool {
        !self.phase().is_terminal()
    }
}

#[derive(Debug, Clone)]
pub struct ModuleSession {
    pub module_id: ModuleId,
    pub source: Option<String>,
    pub authenticated: bool,
    pub compatibility: Option<CompatibilityResult>,
    /// Set once the host has decided to close the session.
    pub closed: Option<String>,
    pub announced: Option<AnnouncedModule>,
}

impl ModuleSession {
    fn new(module_id: ModuleId, source: Option<String>) -> Self {
        Self {
            module_id,
            source,
            authenticated: false,
            compatibility: None,
            closed: None,
            announced: None,
        }
    }
}

/// Published whenever the set of live modules or their phases change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MembershipChange {
    Joined { module: ModuleId, name: String },
    Left { module: ModuleId },
    PhaseChanged { module: ModuleId, phase: ModulePhase },
}

/// Sessions in connection order.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    sessions: IndexMap<ModuleId, ModuleSession>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session. A previous session for the same module is replaced
    /// and returned.
    pub fn open(&mut self, module: ModuleId, source: Option<String>) -> Option<ModuleSession> {
        let previous = self.sessions.shift_remove(&module);
        self.sessions
            .insert(module.clone(), ModuleSession::new(module, source));
        previous
    }

    pub fn close(&mut self, module: &ModuleId) -> Option<ModuleSession> {
        self.sessions.shift_remove(module)
    }

    pub fn get(&self, module: &ModuleId) -> Option<&ModuleSession> {
        self.sessions.get(module)
    }

    pub fn get_mut(&mut self, module: &ModuleId) -> Option<&mut ModuleSession> {
        self.sessions.get_mut(module)
    }

    pub fn announced(&self, module: &ModuleId) -> Option<&AnnouncedModule> {
        self.get(module).and_then(|session| session.announced.as_ref())
    }

    pub fn announced_mut(&mut self, module: &ModuleId) -> Option<&mut AnnouncedModule> {
        self.get_mut(module)
            .and_then(|session| session.announced.as_mut())
    }

    pub fn phase_of(&self, module: &ModuleId) -> Option<ModulePhase> {
        self.announced(module).map(AnnouncedModule::phase)
    }

    /// Live announced modules in join order.
    pub fn live(&self) -> impl Iterator<Item = (&ModuleSession, &AnnouncedModule)> {
        self.sessions.values().filter_map(|session| match &session.announced {
            Some(module) if module.is_live() && session.closed.is_none() => Some((session, module)),
            _ => None,
        })
    }

    pub fn live_ids(&self) -> Vec<ModuleId> {
        self.live()
            .map(|(session, _)| session.module_id.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<ModuleRegistryEntry> {
        self.live().map(|(_, module)| module.entry()).collect()
    }

    /// Routable view of the live modules.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.live()
            .map(|(session, module)| {
                let candidate = RouteCandidate::new(module.entry());
                match &session.source {
                    Some(source) => candidate.with_source(source.clone()),
                    None => candidate,
                }
            })
            .collect()
    }

    pub fn role_index(&self) -> RoleIndex {
        let mut roles = RoleIndex::new();
        for (session, module) in self.live() {
            let version = module.identity.plugin.version.clone();
            for capability in module.capabilities.active_ids() {
                roles.provide(capability.as_str(), session.module_id.clone(), version.clone());
            }
            if let Some(declared) = module.identity.effective_labels().get(ROLE_LABEL) {
                for role in declared.split(',').map(str::trim).filter(|r| !r.is_empty()) {
                    roles.provide(role, session.module_id.clone(), version.clone());
                }
            }
        }
        roles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modlink_protocol::{ModuleDependency, PluginIdentity};

    fn announce(id: &str, labels: &[(&str, &str)]) -> ModuleAnnounce {
        let mut identity = ModuleIdentity::new(
            id,
            PluginIdentity::new(format!("{id}-plugin")).with_version("1.2.0"),
        );
        for (key, value) in labels {
            identity = identity.with_label(*key, *value);
        }
        ModuleAnnounce {
            name: id.to_owned(),
            index: None,
            identity,
            possible_events: Vec::new(),
            config_schema: None,
            dependencies: Vec::new(),
        }
    }

    fn join(registry: &mut ModuleRegistry, id: &str, labels: &[(&str, &str)]) {
        registry.open(id.into(), Some("ws".into()));
        let session = registry.get_mut(&id.into()).unwrap();
        session.announced = Some(AnnouncedModule::from_announce(&announce(id, labels)));
    }

    #[test]
    fn snapshot_contains_only_live_announced_modules() {
        let mut registry = ModuleRegistry::new();
        join(&mut registry, "brain", &[]);
        join(&mut registry, "bot", &[]);
        registry.open("lurker".into(), None);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.get(&"bot".into()).and_then(|c| c.source.as_deref()),
            Some("ws")
        );

        let bot = registry.announced_mut(&"bot".into()).unwrap();
        bot.lifecycle
            .transition(ModulePhase::Failed, Some("crashed".into()))
            .unwrap();
        assert_eq!(registry.live_ids(), vec![ModuleId::from("brain")]);
    }

    #[test]
    fn roles_come_from_labels_and_active_capabilities() {
        let mut registry = ModuleRegistry::new();
        join(&mut registry, "brain", &[("role", "llm:orchestrator, memory")]);
        let roles = registry.role_index();
        let requester = ModuleId::from("bot");
        assert!(roles.satisfies(&ModuleDependency::required("llm:orchestrator"), &requester));
        assert!(roles.satisfies(&ModuleDependency::required("memory"), &requester));
        assert!(!roles.satisfies(&ModuleDependency::required("tts"), &requester));

        let mut bounded = ModuleDependency::required("memory");
        bounded.min = Some("2.0".into());
        assert!(!roles.satisfies(&bounded, &requester));
    }

    #[test]
    fn reopening_replaces_the_previous_session() {
        let mut registry = ModuleRegistry::new();
        join(&mut registry, "bot", &[]);
        let previous = registry.open("bot".into(), None).unwrap();
        assert!(previous.announced.is_some());
        assert!(registry.announced(&"bot".into()).is_none());
    }
}
