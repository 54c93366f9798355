//! The validate → plan → commit sub-protocol, shared by module-level and
//! capability-level targets.

use std::collections::HashMap;

use modlink_protocol::event::{
    ConfigCommitResponse, ConfigConfigured, ConfigPlanResponse, ConfigStepStatus,
    ConfigValidateResponse, ConfigurationNeeded,
};
use modlink_protocol::{
    CapabilityId, ConfigPayload, ConfigTarget, ModuleConfigEnvelope, ModuleConfigPlan,
    ModuleConfigValidation, ModuleId, ModuleIdentity, NegotiationStep, ProgressState,
    ProtocolError, ProtocolEvent, ProtocolResult, apply_merge_patch,
};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::schema::CompiledSchema;

/// Why a commit was refused.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRejection {
    pub reason: String,
    pub validation: Option<ModuleConfigValidation>,
    /// The stored revision the requester should re-validate against.
    pub current_revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusObservation {
    Accepted,
    Discarded { reason: &'static str },
}

#[derive(Debug, Clone, Copy)]
struct StepProgress {
    state: ProgressState,
    sequence: Option<u64>,
}

#[derive(Debug)]
struct TargetState {
    schema: CompiledSchema,
    stored: Option<ModuleConfigEnvelope>,
}

impl TargetState {
    fn revision(&self) -> u64 {
        self.stored.as_ref().map_or(0, |stored| stored.revision)
    }

    /// Revisions only order envelopes of one `configId`; a target keeps the
    /// id it was first committed under.
    fn check_config_id(&self, envelope: &ModuleConfigEnvelope) -> ProtocolResult<()> {
        match &self.stored {
            Some(stored) if stored.config_id != envelope.config_id => {
                Err(ProtocolError::ConfigIdMismatch {
                    stored: stored.config_id.to_string(),
                    actual: envelope.config_id.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn stored_config(&self) -> Option<&Value> {
        self.stored.as_ref().and_then(|stored| stored.full.as_ref())
    }

    /// The config a request refers to: its own payload (a patch applied onto
    /// the stored config) or, without one, the stored config.
    fn candidate(
        &self,
        current: Option<&ModuleConfigEnvelope>,
    ) -> ProtocolResult<(Option<Value>, Option<u32>)> {
        let Some(envelope) = current else {
            return Ok((
                self.stored_config().cloned(),
                self.stored.as_ref().map(|stored| stored.schema_version),
            ));
        };
        let config = match envelope.payload()? {
            ConfigPayload::Full { config, .. } => config.clone(),
            ConfigPayload::Patch { patch, .. } => {
                let mut merged = self.stored_config().cloned().unwrap_or_else(|| json!({}));
                apply_merge_patch(&mut merged, patch);
                merged
            }
        };
        Ok((Some(config), Some(envelope.schema_version)))
    }
}

/// Negotiation state for every registered target.
#[derive(Debug, Default)]
pub struct NegotiationTable {
    targets: HashMap<ConfigTarget, TargetState>,
    progress: HashMap<(ConfigTarget, NegotiationStep), StepProgress>,
    host_sequences: HashMap<(ConfigTarget, NegotiationStep), u64>,
}

impl NegotiationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target. A previously persisted envelope is adopted as the
    /// stored config when it is a full payload.
    pub fn register(
        &mut self,
        target: ConfigTarget,
        schema: CompiledSchema,
        stored: Option<ModuleConfigEnvelope>,
    ) {
        let stored = stored.filter(|envelope| {
            let usable = envelope.full.is_some() && envelope.patch.is_none();
            if !usable {
                warn!(config_target = %target, "ignoring persisted config without a full payload");
            }
            usable
        });
        debug!(
            config_target = %target,
            revision = stored.as_ref().map(|s| s.revision),
            "config target registered"
        );
        self.progress.retain(|(key, _), _| *key != target);
        self.targets.insert(target, TargetState { schema, stored });
    }

    pub fn unregister(&mut self, target: &ConfigTarget) {
        self.targets.remove(target);
        self.progress.retain(|(key, _), _| key != target);
        self.host_sequences.retain(|(key, _), _| key != target);
    }

    /// Targets, progress rounds and host sequences currently held.
    pub fn footprint(&self) -> (usize, usize, usize) {
        (
            self.targets.len(),
            self.progress.len(),
            self.host_sequences.len(),
        )
    }

    /// Forget every target owned by `module`.
    pub fn unregister_module(&mut self, module: &ModuleId) {
        self.targets.retain(|target, _| target.module != *module);
        self.progress.retain(|(target, _), _| target.module != *module);
        self.host_sequences
            .retain(|(target, _), _| target.module != *module);
    }

    pub fn contains(&self, target: &ConfigTarget) -> bool {
        self.targets.contains_key(target)
    }

    pub fn schema(&self, target: &ConfigTarget) -> Option<&CompiledSchema> {
        self.targets.get(target).map(|state| &state.schema)
    }

    pub fn stored(&self, target: &ConfigTarget) -> Option<&ModuleConfigEnvelope> {
        self.targets
            .get(target)
            .and_then(|state| state.stored.as_ref())
    }

    pub fn revision(&self, target: &ConfigTarget) -> u64 {
        self.targets.get(target).map_or(0, TargetState::revision)
    }

    /// Unregistered targets need nothing; registered ones are settled once
    /// their stored config validates.
    pub fn is_settled(&self, target: &ConfigTarget) -> bool {
        let Some(state) = self.targets.get(target) else {
            return true;
        };
        let version = state.stored.as_ref().map(|stored| stored.schema_version);
        state
            .schema
            .validate(state.stored_config(), version)
            .is_valid()
    }

    fn target(&self, target: &ConfigTarget) -> ProtocolResult<&TargetState> {
        self.targets.get(target).ok_or_else(|| unregistered(target))
    }

    /// Validate `current` (or the stored config). A plan is attached to
    /// every result that is not `valid`.
    pub fn validate(
        &self,
        target: &ConfigTarget,
        current: Option<&ModuleConfigEnvelope>,
    ) -> ProtocolResult<(ModuleConfigValidation, Option<ModuleConfigPlan>)> {
        let state = self.target(target)?;
        let (config, version) = state.candidate(current)?;
        let validation = state.schema.validate(config.as_ref(), version);
        let plan = (!validation.is_valid()).then(|| state.schema.plan(config.as_ref(), version));
        Ok((validation, plan))
    }

    pub fn plan(
        &self,
        target: &ConfigTarget,
        current: Option<&ModuleConfigEnvelope>,
    ) -> ProtocolResult<ModuleConfigPlan> {
        let state = self.target(target)?;
        let (config, version) = state.candidate(current)?;
        Ok(state.schema.plan(config.as_ref(), version))
    }

    /// Apply a commit. On success the stored revision advances by one and
    /// the committed config is returned as a full envelope.
    pub fn commit(
        &mut self,
        target: &ConfigTarget,
        envelope: &ModuleConfigEnvelope,
    ) -> Result<ModuleConfigEnvelope, CommitRejection> {
        let Some(state) = self.targets.get_mut(target) else {
            return Err(CommitRejection {
                reason: format!("no config schema registered for {target}"),
                validation: None,
                current_revision: 0,
            });
        };
        let current_revision = state.revision();
        let reject = |reason: String, validation: Option<ModuleConfigValidation>| CommitRejection {
            reason,
            validation,
            current_revision,
        };

        let payload = envelope
            .payload()
            .map_err(|error| reject(error.to_string(), None))?;
        if let Err(mismatch) = state.check_config_id(envelope) {
            warn!(
                config_target = %target,
                config_id = %envelope.config_id,
                "commit rejected on foreign config id"
            );
            return Err(reject(mismatch.to_string(), None));
        }
        let (config, base_revision) = match payload {
            ConfigPayload::Full {
                config,
                base_revision,
            } => (config.clone(), base_revision),
            ConfigPayload::Patch {
                patch,
                base_revision,
            } => {
                let mut merged = state.stored_config().cloned().unwrap_or_else(|| json!({}));
                apply_merge_patch(&mut merged, patch);
                (merged, Some(base_revision))
            }
        };

        if let Some(actual) = base_revision
            && actual != current_revision
        {
            let conflict = ProtocolError::RevisionConflict {
                expected: current_revision,
                actual,
            };
            warn!(
                config_target = %target,
                expected = current_revision,
                actual,
                "commit rejected on stale revision"
            );
            return Err(reject(conflict.to_string(), None));
        }

        let validation = state
            .schema
            .validate(Some(&config), Some(envelope.schema_version));
        if !validation.is_valid() {
            warn!(
                config_target = %target,
                status = ?validation.status,
                "commit rejected by validation"
            );
            return Err(reject(
                format!("config is {}", status_name(&validation)),
                Some(validation),
            ));
        }

        let committed = ModuleConfigEnvelope {
            source: envelope.source.clone(),
            ..ModuleConfigEnvelope::full(
                envelope.config_id.clone(),
                current_revision + 1,
                envelope.schema_version,
                config,
            )
        };
        debug!(config_target = %target, revision = committed.revision, "config committed");
        state.stored = Some(committed.clone());
        Ok(committed)
    }

    /// Accept a `configured` report from the module that owns the target.
    /// It must be a full, valid config at a newer revision.
    pub fn adopt(
        &mut self,
        target: &ConfigTarget,
        envelope: &ModuleConfigEnvelope,
    ) -> ProtocolResult<ModuleConfigEnvelope> {
        let state = self
            .targets
            .get_mut(target)
            .ok_or_else(|| unregistered(target))?;
        let ConfigPayload::Full { config, .. } = envelope.payload()? else {
            return Err(ProtocolError::MalformedEnvelope(format!(
                "configured report for {target} must carry a full config"
            )));
        };
        state.check_config_id(envelope)?;
        let current = state.revision();
        if envelope.revision <= current {
            return Err(ProtocolError::RevisionConflict {
                expected: current + 1,
                actual: envelope.revision,
            });
        }
        let validation = state
            .schema
            .validate(Some(config), Some(envelope.schema_version));
        if !validation.is_valid() {
            return Err(ProtocolError::Schema(format!(
                "configured report for {target} is {}",
                status_name(&validation)
            )));
        }
        let adopted = ModuleConfigEnvelope {
            patch: None,
            base_revision: None,
            ..envelope.clone()
        };
        state.stored = Some(adopted.clone());
        Ok(adopted)
    }

    /// Start a new progress round; earlier statuses of the step no longer
    /// constrain ordering.
    pub fn begin_round(&mut self, target: &ConfigTarget, step: NegotiationStep) {
        self.progress.remove(&(target.clone(), step));
    }

    /// Check one inbound status against the current round.
    pub fn observe_status(
        &mut self,
        target: &ConfigTarget,
        step: NegotiationStep,
        state: ProgressState,
        sequence: Option<u64>,
    ) -> StatusObservation {
        let key = (target.clone(), step);
        if let Some(previous) = self.progress.get(&key) {
            match (sequence, previous.sequence) {
                (Some(next), Some(last)) if next <= last => {
                    return StatusObservation::Discarded {
                        reason: "status sequence did not increase",
                    };
                }
                (Some(_), _) => {}
                (None, _) if state.rank() < previous.state.rank() => {
                    return StatusObservation::Discarded {
                        reason: "status progress cannot move backwards",
                    };
                }
                (None, _) => {}
            }
        }
        self.progress.insert(key, StepProgress { state, sequence });
        StatusObservation::Accepted
    }

    /// Sequence number for the next host-emitted status of a step.
    pub fn next_host_sequence(&mut self, target: &ConfigTarget, step: NegotiationStep) -> u64 {
        let sequence = self.host_sequences.entry((target.clone(), step)).or_default();
        *sequence += 1;
        *sequence
    }
}

fn unregistered(target: &ConfigTarget) -> ProtocolError {
    ProtocolError::Schema(format!("no config schema registered for {target}"))
}

fn status_name(validation: &ModuleConfigValidation) -> &'static str {
    match validation.status {
        modlink_protocol::ValidationStatus::Valid => "valid",
        modlink_protocol::ValidationStatus::Partial => "partial",
        modlink_protocol::ValidationStatus::Invalid => "invalid",
    }
}

// ─── Level-correct event builders ──────────────────────────────────

pub fn needed_event(
    identity: ModuleIdentity,
    capability_id: Option<CapabilityId>,
    schema: Option<modlink_protocol::ModuleConfigSchema>,
    current: Option<ModuleConfigEnvelope>,
    reason: Option<String>,
) -> ProtocolEvent {
    let capability = capability_id.is_some();
    let payload = ConfigurationNeeded {
        identity,
        capability_id,
        schema,
        current,
        reason,
    };
    if capability {
        ProtocolEvent::CapabilityConfigurationNeeded(payload)
    } else {
        ProtocolEvent::ConfigurationNeeded(payload)
    }
}

pub fn status_event(step: NegotiationStep, status: ConfigStepStatus) -> ProtocolEvent {
    let capability = status.capability_id.is_some();
    match (step, capability) {
        (NegotiationStep::Validate, false) => ProtocolEvent::ConfigValidateStatus(status),
        (NegotiationStep::Validate, true) => ProtocolEvent::CapabilityConfigValidateStatus(status),
        (NegotiationStep::Plan, false) => ProtocolEvent::ConfigPlanStatus(status),
        (NegotiationStep::Plan, true) => ProtocolEvent::CapabilityConfigPlanStatus(status),
        (NegotiationStep::Commit, false) => ProtocolEvent::ConfigCommitStatus(status),
        (NegotiationStep::Commit, true) => ProtocolEvent::CapabilityConfigCommitStatus(status),
    }
}

pub fn validate_response_event(response: ConfigValidateResponse) -> ProtocolEvent {
    if response.capability_id.is_some() {
        ProtocolEvent::CapabilityConfigValidateResponse(response)
    } else {
        ProtocolEvent::ConfigValidateResponse(response)
    }
}

pub fn plan_response_event(response: ConfigPlanResponse) -> ProtocolEvent {
    if response.capability_id.is_some() {
        ProtocolEvent::CapabilityConfigPlanResponse(response)
    } else {
        ProtocolEvent::ConfigPlanResponse(response)
    }
}

pub fn commit_response_event(response: ConfigCommitResponse) -> ProtocolEvent {
    if response.capability_id.is_some() {
        ProtocolEvent::CapabilityConfigCommitResponse(response)
    } else {
        ProtocolEvent::ConfigCommitResponse(response)
    }
}

pub fn configured_event(configured: ConfigConfigured) -> ProtocolEvent {
    if configured.capability_id.is_some() {
        ProtocolEvent::CapabilityConfigConfigured(configured)
    } else {
        ProtocolEvent::ConfigConfigured(configured)
    }
}
