//! Host-owned module lifecycle: phase transitions, dependency satisfaction
//! and the readiness gate.

use std::collections::HashMap;

use modlink_protocol::{
    CapabilityId, ModuleDependency, ModuleId, ModulePhase, ProtocolError, ProtocolResult,
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseChange {
    pub from: ModulePhase,
    pub to: ModulePhase,
    pub reason: Option<String>,
}

/// Which live modules provide which roles, and at what plugin version.
///
/// A module provides a role when it has an active capability with that id
/// or carries a `role` label naming it (comma-separated for several).
#[derive(Debug, Clone, Default)]
pub struct RoleIndex {
    providers: HashMap<String, Vec<(ModuleId, Option<String>)>>,
}

impl RoleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provide(&mut self, role: impl Into<String>, module: ModuleId, version: Option<String>) {
        let providers = self.providers.entry(role.into()).or_default();
        if !providers.iter().any(|(existing, _)| *existing == module) {
            providers.push((module, version));
        }
    }

    /// Whether some module other than `requester` satisfies `dependency`.
    pub fn satisfies(&self, dependency: &ModuleDependency, requester: &ModuleId) -> bool {
        self.providers.get(&dependency.role).is_some_and(|providers| {
            providers.iter().any(|(module, version)| {
                module != requester && dependency.accepts_version(version.as_deref())
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependencyReport {
    pub missing_required: Vec<ModuleDependency>,
    pub missing_optional: Vec<ModuleDependency>,
    /// The missing set differs from the previous evaluation (always true on
    /// the first one).
    pub changed: bool,
}

impl DependencyReport {
    pub fn all_missing(&self) -> Vec<ModuleDependency> {
        self.missing_required
            .iter()
            .chain(&self.missing_optional)
            .cloned()
            .collect()
    }
}

/// Why the readiness gate is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessBlocker {
    MissingDependencies(Vec<String>),
    ConfigurationUnsettled,
    CapabilitiesAwaitingConfiguration(Vec<CapabilityId>),
}

impl std::fmt::Display for ReadinessBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingDependencies(roles) => {
                write!(f, "missing required dependencies: {}", roles.join(", "))
            }
            Self::ConfigurationUnsettled => f.write_str("module configuration is not settled"),
            Self::CapabilitiesAwaitingConfiguration(ids) => {
                let ids = ids.iter().map(CapabilityId::as_str).collect::<Vec<_>>();
                write!(f, "capabilities awaiting configuration: {}", ids.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleLifecycle {
    phase: ModulePhase,
    dependencies: Vec<ModuleDependency>,
    missing: Option<Vec<ModuleDependency>>,
    failure: Option<String>,
}

impl ModuleLifecycle {
    pub fn new(dependencies: Vec<ModuleDependency>) -> Self {
        Self {
            phase: ModulePhase::Announced,
            dependencies,
            missing: None,
            failure: None,
        }
    }

    pub fn phase(&self) -> ModulePhase {
        self.phase
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn dependencies(&self) -> &[ModuleDependency] {
        &self.dependencies
    }

    /// A host-driven transition.
    pub fn transition(
        &mut self,
        to: ModulePhase,
        reason: Option<String>,
    ) -> ProtocolResult<PhaseChange> {
        let from = self.phase;
        if !from.can_advance_to(to) {
            return Err(ProtocolError::IllegalTransition { from, to });
        }
        self.apply(to, reason)
    }

    /// A transition requested by the module through `module:status:change`.
    pub fn request(
        &mut self,
        to: ModulePhase,
        reason: Option<String>,
    ) -> ProtocolResult<PhaseChange> {
        let from = self.phase;
        if !from.can_request(to) {
            return Err(ProtocolError::IllegalTransition { from, to });
        }
        self.apply(to, reason)
    }

    fn apply(&mut self, to: ModulePhase, reason: Option<String>) -> ProtocolResult<PhaseChange> {
        if to == ModulePhase::Failed {
            let reason = reason
                .filter(|reason| !reason.trim().is_empty())
                .ok_or(ProtocolError::MissingFailureReason)?;
            self.failure = Some(reason.clone());
            return Ok(self.commit(to, Some(reason)));
        }
        if to == ModulePhase::Preparing {
            self.missing = None;
        }
        Ok(self.commit(to, reason))
    }

    fn commit(&mut self, to: ModulePhase, reason: Option<String>) -> PhaseChange {
        let change = PhaseChange {
            from: self.phase,
            to,
            reason,
        };
        debug!(from = %change.from, to = %change.to, "module phase changed");
        self.phase = to;
        change
    }

    /// Re-run dependency resolution against the live registry.
    pub fn evaluate_dependencies(
        &mut self,
        roles: &RoleIndex,
        module: &ModuleId,
    ) -> DependencyReport {
        let (missing_optional, missing_required): (Vec<_>, Vec<_>) = self
            .dependencies
            .iter()
            .filter(|dependency| !roles.satisfies(dependency, module))
            .cloned()
            .partition(|dependency| dependency.optional);

        let all: Vec<_> = missing_required
            .iter()
            .chain(&missing_optional)
            .cloned()
            .collect();
        let changed = self.missing.as_ref() != Some(&all);
        self.missing = Some(all);

        DependencyReport {
            missing_required,
            missing_optional,
            changed,
        }
    }

    pub fn missing_required(&self) -> Vec<&ModuleDependency> {
        self.missing
            .iter()
            .flatten()
            .filter(|dependency| !dependency.optional)
            .collect()
    }

    /// Ready only when every required dependency is present, the module's
    /// own config is settled and no offered capability awaits configuration.
    pub fn readiness(
        &self,
        config_settled: bool,
        awaiting_configuration: Vec<CapabilityId>,
    ) -> Result<(), ReadinessBlocker> {
        let missing = self.missing_required();
        if self.missing.is_none() || !missing.is_empty() {
            return Err(ReadinessBlocker::MissingDependencies(
                missing.iter().map(|dependency| dependency.role.clone()).collect(),
            ));
        }
        if !config_settled {
            return Err(ReadinessBlocker::ConfigurationUnsettled);
        }
        if !awaiting_configuration.is_empty() {
            return Err(ReadinessBlocker::CapabilitiesAwaitingConfiguration(
                awaiting_configuration,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> ModuleDependency {
        ModuleDependency::required("llm:orchestrator")
    }

    #[test]
    fn missing_required_dependency_blocks_readiness() {
        let module = ModuleId::from("bot");
        let mut lifecycle = ModuleLifecycle::new(vec![
            orchestrator(),
            ModuleDependency::optional("tts"),
        ]);
        let report = lifecycle.evaluate_dependencies(&RoleIndex::new(), &module);
        assert_eq!(report.missing_required.len(), 1);
        assert_eq!(report.missing_optional.len(), 1);
        assert!(report.changed);
        assert!(matches!(
            lifecycle.readiness(true, Vec::new()),
            Err(ReadinessBlocker::MissingDependencies(_))
        ));

        let mut roles = RoleIndex::new();
        roles.provide("llm:orchestrator", ModuleId::from("brain"), None);
        let report = lifecycle.evaluate_dependencies(&roles, &module);
        assert!(report.missing_required.is_empty());
        assert!(report.changed);
        assert!(lifecycle.readiness(true, Vec::new()).is_ok());
        assert!(!lifecycle.evaluate_dependencies(&roles, &module).changed);
    }

    #[test]
    fn module_cannot_satisfy_its_own_dependency() {
        let module = ModuleId::from("brain");
        let mut roles = RoleIndex::new();
        roles.provide("llm:orchestrator", module.clone(), None);
        assert!(!roles.satisfies(&orchestrator(), &module));
    }

    #[test]
    fn readiness_requires_config_and_capabilities() {
        let mut lifecycle = ModuleLifecycle::new(Vec::new());
        lifecycle.evaluate_dependencies(&RoleIndex::new(), &ModuleId::from("m"));
        assert_eq!(
            lifecycle.readiness(false, Vec::new()),
            Err(ReadinessBlocker::ConfigurationUnsettled)
        );
        assert!(matches!(
            lifecycle.readiness(true, vec!["tts".into()]),
            Err(ReadinessBlocker::CapabilitiesAwaitingConfiguration(_))
        ));
    }

    #[test]
    fn failed_requires_reason_and_is_terminal() {
        let mut lifecycle = ModuleLifecycle::new(Vec::new());
        lifecycle.transition(ModulePhase::Preparing, None).unwrap();
        assert!(matches!(
            lifecycle.transition(ModulePhase::Failed, None),
            Err(ProtocolError::MissingFailureReason)
        ));
        let change = lifecycle
            .transition(ModulePhase::Failed, Some("crashed".into()))
            .unwrap();
        assert_eq!(change.to, ModulePhase::Failed);
        assert_eq!(lifecycle.failure(), Some("crashed"));
        assert!(lifecycle.request(ModulePhase::Preparing, None).is_err());
    }

    #[test]
    fn host_cannot_skip_configuration() {
        let mut lifecycle = ModuleLifecycle::new(Vec::new());
        lifecycle.transition(ModulePhase::Preparing, None).unwrap();
        lifecycle
            .transition(ModulePhase::ConfigurationNeeded, None)
            .unwrap();
        assert!(matches!(
            lifecycle.transition(ModulePhase::Ready, None),
            Err(ProtocolError::IllegalTransition { .. })
        ));
    }
}
