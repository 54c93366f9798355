use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use modlink_events::{Delivery, EventJournal, EventStreamHub};
use modlink_protocol::event::{
    Authenticated, CapabilityActivated, CapabilityOffer, CompatibilityMode, CompatibilityRequest,
    ConfigCommitRequest, ConfigCommitResponse, ConfigConfigured, ConfigPlanResponse,
    ConfigStepStatus, ConfigValidateResponse, ErrorRaised, HeartbeatKind, ModuleAnnounce,
    ModulePrepared, ModuleStatus, Negotiation, NegotiationMessage, RegistrySync,
};
use modlink_protocol::{
    AllowAllTokens, ConfigStorePort, ConfigTarget, ContextId, ContextUpdate, EventEnvelope,
    ModuleConfigEnvelope, ModuleConfigValidation, ModuleDependency, ModuleId, ModuleIdentity,
    ModulePhase, NegotiationStep, ProgressState, ProtocolError, ProtocolEvent, TokenVerifier,
};
use modlink_routing::{RegistrySnapshot, resolve};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::capability::CapabilityRecord;
use crate::compat;
use crate::config::HostConfig;
use crate::context::{ContextApply, ContextEntry, ContextStore};
use crate::lifecycle::{PhaseChange, RoleIndex};
use crate::negotiation::{
    NegotiationTable, StatusObservation, commit_response_event, configured_event, needed_event,
    plan_response_event, status_event, validate_response_event,
};
use crate::registry::{AnnouncedModule, MembershipChange, ModuleRegistry};
use crate::schema::{CompiledSchema, EventSchemaTable};
use crate::spark::SparkRelay;

/// What the host did with one inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Consumed by the host.
    Handled,
    /// Forwarded to peers.
    Routed { recipients: Vec<ModuleId> },
    /// Dropped; the sender may have been told why.
    Ignored { reason: String },
    /// The session is closed and no longer processes events.
    Closed { reason: String },
}

/// Everything computed under the state lock and carried out after it is
/// released.
#[derive(Default)]
struct Effects {
    outbound: Vec<(ModuleId, EventEnvelope)>,
    persist: Vec<(ConfigTarget, ModuleConfigEnvelope)>,
    membership: Vec<MembershipChange>,
}

impl Effects {
    fn send(&mut self, recipient: &ModuleId, envelope: EventEnvelope) {
        self.outbound.push((recipient.clone(), envelope));
    }
}

/// Results of the async port calls an envelope needs, gathered before the
/// lock is taken.
#[derive(Default)]
struct Prefetched {
    token: Option<TokenCheck>,
    stored: Option<ModuleConfigEnvelope>,
}

enum TokenCheck {
    Verified(bool),
    Failed(String),
}

struct HostState {
    registry: ModuleRegistry,
    negotiation: NegotiationTable,
    spark: SparkRelay,
    context: ContextStore,
}

#[derive(Clone)]
pub struct HostRuntime {
    config: Arc<HostConfig>,
    journal: EventJournal,
    verifier: Arc<dyn TokenVerifier>,
    config_store: Option<Arc<dyn ConfigStorePort>>,
    membership: EventStreamHub<MembershipChange>,
    schemas: Arc<EventSchemaTable>,
    state: Arc<Mutex<HostState>>,
    /// Held from taking the state lock until the resulting effects are
    /// flushed, so deliveries and saves leave in state order.
    effect_order: Arc<tokio::sync::Mutex<()>>,
}

impl HostRuntime {
    pub fn new(config: HostConfig, journal: EventJournal) -> Self {
        let state = HostState {
            registry: ModuleRegistry::new(),
            negotiation: NegotiationTable::new(),
            spark: SparkRelay::new(config.dedupe_capacity),
            context: ContextStore::new(config.context_replace_scope, config.dedupe_capacity),
        };
        Self {
            membership: EventStreamHub::new(config.stream_buffer),
            config: Arc::new(config),
            journal,
            verifier: Arc::new(AllowAllTokens),
            config_store: None,
            schemas: Arc::new(EventSchemaTable::new()),
            state: Arc::new(Mutex::new(state)),
            effect_order: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn with_token_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_config_store(mut self, store: Arc<dyn ConfigStorePort>) -> Self {
        self.config_store = Some(store);
        self
    }

    pub fn with_event_schemas(mut self, schemas: EventSchemaTable) -> Self {
        self.schemas = Arc::new(schemas);
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Open a session for `module`. Reconnecting replaces the previous
    /// session, which counts as the old one leaving.
    #[instrument(skip(self, source), fields(module_id = %module))]
    pub async fn open_session(&self, module: ModuleId, source: Option<String>) -> Result<()> {
        let _order = self.effect_order.lock().await;
        let mut effects = Effects::default();
        {
            let mut state = self.state.lock();
            let previous = state.registry.open(module.clone(), source);
            if previous.is_some_and(|session| session.announced.is_some()) {
                self.depart(&mut state, &module, &mut effects);
            }
        }
        info!("session opened");
        self.flush(effects).await;
        Ok(())
    }

    /// Close a session. Returns false when none was open.
    #[instrument(skip(self, reason), fields(module_id = %module))]
    pub async fn close_session(&self, module: &ModuleId, reason: &str) -> Result<bool> {
        let _order = self.effect_order.lock().await;
        let mut effects = Effects::default();
        let closed = {
            let mut state = self.state.lock();
            match state.registry.close(module) {
                Some(session) => {
                    if session.announced.is_some() {
                        self.depart(&mut state, module, &mut effects);
                    }
                    true
                }
                None => false,
            }
        };
        if closed {
            info!(reason, "session closed");
        }
        self.flush(effects).await;
        Ok(closed)
    }

    /// Fold one inbound envelope from `module`'s session into host state and
    /// deliver whatever it produces.
    #[instrument(
        skip(self, envelope),
        fields(module_id = %module, event_type = envelope.event_type())
    )]
    pub async fn handle(
        &self,
        module: &ModuleId,
        envelope: EventEnvelope,
    ) -> Result<HandleOutcome> {
        let prefetched = self.prefetch(module, &envelope).await;
        let _order = self.effect_order.lock().await;
        let mut effects = Effects::default();
        let outcome = {
            let mut state = self.state.lock();
            self.apply(&mut state, module, envelope, prefetched, &mut effects)
        };
        debug!(outcome = ?outcome, outbound = effects.outbound.len(), "envelope handled");
        self.flush(effects).await;
        Ok(outcome)
    }

    pub fn phase_of(&self, module: &ModuleId) -> Option<ModulePhase> {
        self.state.lock().registry.phase_of(module)
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        self.state.lock().registry.snapshot()
    }

    pub fn capability(&self, module: &ModuleId, capability: &str) -> Option<CapabilityRecord> {
        self.state
            .lock()
            .registry
            .announced(module)
            .and_then(|announced| announced.capabilities.get(&capability.into()).cloned())
    }

    pub fn stored_config(&self, target: &ConfigTarget) -> Option<ModuleConfigEnvelope> {
        self.state.lock().negotiation.stored(target).cloned()
    }

    pub fn context_entries(&self, context_id: &ContextId) -> Vec<ContextEntry> {
        self.state.lock().context.entries(context_id).to_vec()
    }

    pub fn context_text(&self, context_id: &ContextId) -> String {
        self.state.lock().context.text(context_id)
    }

    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<Delivery> {
        self.journal.subscribe()
    }

    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipChange> {
        self.membership.subscribe()
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    // ─── Around the lock ───────────────────────────────────────────

    async fn prefetch(&self, module: &ModuleId, envelope: &EventEnvelope) -> Prefetched {
        let mut prefetched = Prefetched::default();
        match &envelope.event {
            ProtocolEvent::Authenticate(authenticate) => {
                let check = match self.verifier.verify(module, &authenticate.token).await {
                    Ok(valid) => TokenCheck::Verified(valid),
                    Err(error) => {
                        warn!(%error, "token verifier failed");
                        TokenCheck::Failed(format!("token verification failed: {error}"))
                    }
                };
                prefetched.token = Some(check);
            }
            ProtocolEvent::Announce(announce) if announce.config_schema.is_some() => {
                let target = ConfigTarget::module(announce.identity.id.clone());
                prefetched.stored = self.load_stored(&target).await;
            }
            ProtocolEvent::CapabilityOffer(offer) if offer.capability.config_schema.is_some() => {
                let target = ConfigTarget::capability(
                    offer.identity.id.clone(),
                    offer.capability.id.clone(),
                );
                prefetched.stored = self.load_stored(&target).await;
            }
            _ => {}
        }
        prefetched
    }

    async fn load_stored(&self, target: &ConfigTarget) -> Option<ModuleConfigEnvelope> {
        let store = self.config_store.as_ref()?;
        match store.load(target).await {
            Ok(stored) => stored,
            Err(error) => {
                warn!(config_target = %target, %error, "failed loading persisted config");
                None
            }
        }
    }

    async fn flush(&self, effects: Effects) {
        for (recipient, envelope) in effects.outbound {
            if let Err(error) = self.journal.deliver_and_publish(&recipient, envelope).await {
                warn!(recipient = %recipient, error = %error, "outbound delivery failed");
            }
        }
        if let Some(store) = &self.config_store {
            for (target, envelope) in &effects.persist {
                if let Err(error) = store.save(target, envelope).await {
                    warn!(config_target = %target, %error, "failed persisting committed config");
                }
            }
        }
        for change in effects.membership {
            self.membership.publish(change);
        }
    }

    // ─── Dispatch (under the lock) ─────────────────────────────────

    fn apply(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        envelope: EventEnvelope,
        prefetched: Prefetched,
        fx: &mut Effects,
    ) -> HandleOutcome {
        let Some(session) = state.registry.get(module) else {
            return HandleOutcome::Closed {
                reason: format!("no open session for {module}"),
            };
        };
        if let Some(reason) = &session.closed {
            return HandleOutcome::Closed {
                reason: reason.clone(),
            };
        }
        let authenticated = session.authenticated;
        let announced = session.announced.is_some();

        match &envelope.event {
            ProtocolEvent::CompatibilityRequest(request) => {
                return self.on_compatibility(state, module, &envelope, request, fx);
            }
            ProtocolEvent::Authenticate(_) => {
                let check = prefetched
                    .token
                    .unwrap_or_else(|| TokenCheck::Failed("token was not checked".to_owned()));
                return Self::on_authenticate(state, module, &envelope, check, fx);
            }
            ProtocolEvent::Heartbeat(heartbeat) => {
                if heartbeat.kind == HeartbeatKind::Ping {
                    fx.send(module, envelope.reply(ProtocolEvent::Heartbeat(heartbeat.pong())));
                }
                return HandleOutcome::Handled;
            }
            _ => {}
        }

        if self.config.require_authentication && !authenticated {
            let error = ProtocolError::Unauthenticated(module.to_string());
            return reject(fx, module, &envelope, error.to_string());
        }

        if let ProtocolEvent::Announce(announce) = &envelope.event {
            return self.on_announce(state, module, &envelope, announce, prefetched.stored, fx);
        }
        if !announced {
            let message = format!("announce before sending {}", envelope.event_type());
            return reject(fx, module, &envelope, message);
        }

        if let Some(negotiation) = envelope.event.negotiation() {
            return self.on_negotiation(state, module, &envelope, negotiation, fx);
        }

        let outcome = match &envelope.event {
            ProtocolEvent::StatusChange(status) => {
                Some(self.on_status_change(state, module, &envelope, status, fx))
            }
            ProtocolEvent::CapabilityOffer(offer) => Some(self.on_offer(
                state,
                module,
                &envelope,
                offer,
                prefetched.stored,
                fx,
            )),
            ProtocolEvent::CapabilityActivated(activated) => {
                Some(self.on_activated(state, module, &envelope, activated, fx))
            }
            ProtocolEvent::Prepared(_) => {
                debug!("module reported its preparation");
                Some(HandleOutcome::Handled)
            }
            ProtocolEvent::Status(_)
            | ProtocolEvent::Authenticated(_)
            | ProtocolEvent::CompatibilityResult(_)
            | ProtocolEvent::RegistrySync(_)
            | ProtocolEvent::ConfigurationNeeded(_)
            | ProtocolEvent::CapabilityConfigurationNeeded(_) => Some(HandleOutcome::Ignored {
                reason: format!("{} is only sent by the host", envelope.event_type()),
            }),
            ProtocolEvent::Custom { event_type, data } => self
                .schemas
                .check(event_type, data, self.config.strict_custom_events)
                .err()
                .map(|error| reject(fx, module, &envelope, error.to_string())),
            _ => self.admit_peer_event(state, module, &envelope.event),
        };
        if let Some(outcome) = outcome {
            return outcome;
        }
        self.route(state, module, envelope, fx)
    }

    /// Stateful gates for forwarded traffic. `Some` means the event stops
    /// here.
    fn admit_peer_event(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        event: &ProtocolEvent,
    ) -> Option<HandleOutcome> {
        let admission = match event {
            ProtocolEvent::SparkNotify(notify) => {
                state.spark.admit_notify(notify, Utc::now().timestamp_millis())
            }
            ProtocolEvent::SparkCommand(command) => state.spark.admit_command(command),
            ProtocolEvent::SparkEmit(emit) => state.spark.admit_emit(module, emit),
            ProtocolEvent::ContextUpdate(update) => {
                if state.context.apply(Some(module), update) == ContextApply::Duplicate {
                    return Some(HandleOutcome::Ignored {
                        reason: "duplicate context update".to_owned(),
                    });
                }
                return None;
            }
            ProtocolEvent::InputText(input) => {
                fold_context(&mut state.context, module, &input.context_updates);
                return None;
            }
            ProtocolEvent::InputTextVoice(input) => {
                fold_context(&mut state.context, module, &input.context_updates);
                return None;
            }
            ProtocolEvent::InputVoice(input) => {
                fold_context(&mut state.context, module, &input.context_updates);
                return None;
            }
            _ => return None,
        };
        admission.reason().map(|reason| {
            warn!(reason, "spark event not forwarded");
            HandleOutcome::Ignored {
                reason: reason.to_owned(),
            }
        })
    }

    fn route(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        mut envelope: EventEnvelope,
        fx: &mut Effects,
    ) -> HandleOutcome {
        if envelope.metadata.source.is_none() {
            envelope.metadata.source = state
                .registry
                .announced(module)
                .map(|announced| announced.identity.clone());
        }
        let snapshot = state.registry.snapshot();
        let recipients = match resolve(&envelope, &snapshot, self.config.empty_destinations) {
            Ok(recipients) => recipients,
            Err(error) => return reject(fx, module, &envelope, error.to_string()),
        };
        let recipients: Vec<ModuleId> = recipients
            .into_iter()
            .filter(|recipient| recipient != module)
            .collect();
        for recipient in &recipients {
            fx.send(recipient, envelope.clone());
        }
        debug!(recipients = recipients.len(), "event routed");
        HandleOutcome::Routed { recipients }
    }

    // ─── Handshake ─────────────────────────────────────────────────

    fn on_compatibility(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        envelope: &EventEnvelope,
        request: &CompatibilityRequest,
        fx: &mut Effects,
    ) -> HandleOutcome {
        let result = compat::negotiate(&self.config, request);
        fx.send(
            module,
            envelope.reply(ProtocolEvent::CompatibilityResult(result.clone())),
        );
        let was_announced = match state.registry.get_mut(module) {
            Some(session) => {
                session.compatibility = Some(result.clone());
                session.announced.is_some()
            }
            None => false,
        };

        if result.mode != CompatibilityMode::Rejected {
            info!(
                mode = ?result.mode,
                protocol_version = %result.protocol_version,
                api_version = %result.api_version,
                "compatibility negotiated"
            );
            return HandleOutcome::Handled;
        }

        let reason = result
            .reason
            .unwrap_or_else(|| "incompatible protocol version".to_owned());
        warn!(%reason, "compatibility rejected, closing session");
        if let Some(session) = state.registry.get_mut(module) {
            session.closed = Some(reason.clone());
        }
        if was_announced {
            self.depart(state, module, fx);
        }
        HandleOutcome::Closed { reason }
    }

    fn on_authenticate(
        state: &mut HostState,
        module: &ModuleId,
        envelope: &EventEnvelope,
        check: TokenCheck,
        fx: &mut Effects,
    ) -> HandleOutcome {
        let (valid, failure) = match check {
            TokenCheck::Verified(valid) => (valid, None),
            TokenCheck::Failed(message) => (false, Some(message)),
        };
        if let Some(session) = state.registry.get_mut(module) {
            session.authenticated = valid;
        }
        fx.send(
            module,
            envelope.reply(ProtocolEvent::Authenticated(Authenticated {
                authenticated: valid,
            })),
        );
        if valid {
            info!("module authenticated");
            let modules = state.registry.entries();
            fx.send(
                module,
                envelope.reply(ProtocolEvent::RegistrySync(RegistrySync { modules })),
            );
        } else {
            warn!("authentication rejected");
        }
        if let Some(message) = failure {
            fx.send(
                module,
                envelope.reply(ProtocolEvent::Error(ErrorRaised { message })),
            );
        }
        HandleOutcome::Handled
    }

    fn on_announce(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        envelope: &EventEnvelope,
        announce: &ModuleAnnounce,
        stored: Option<ModuleConfigEnvelope>,
        fx: &mut Effects,
    ) -> HandleOutcome {
        if announce.identity.id != *module {
            let error = ProtocolError::IdentityMismatch {
                session: module.to_string(),
                announced: announce.identity.id.to_string(),
            };
            return reject(fx, module, envelope, error.to_string());
        }
        let schema = match announce.config_schema.clone().map(CompiledSchema::compile) {
            Some(Ok(schema)) => Some(schema),
            Some(Err(error)) => return reject(fx, module, envelope, error.to_string()),
            None => None,
        };

        let reannounced = state.registry.announced(module).is_some();
        if reannounced {
            if let Some(session) = state.registry.get_mut(module) {
                session.announced = None;
            }
            self.depart(state, module, fx);
        }
        if let Some(schema) = schema {
            state
                .negotiation
                .register(ConfigTarget::module(module.clone()), schema, stored);
        }

        let mut announced = AnnouncedModule::from_announce(announce);
        let change = match announced.lifecycle.transition(ModulePhase::Preparing, None) {
            Ok(change) => change,
            Err(error) => return reject(fx, module, envelope, error.to_string()),
        };
        let identity = announced.identity.clone();
        if let Some(session) = state.registry.get_mut(module) {
            session.announced = Some(announced);
        }
        info!(
            name = %announce.name,
            dependencies = announce.dependencies.len(),
            reannounced,
            "module announced"
        );

        emit_status(fx, &identity, &change);
        fx.membership.push(MembershipChange::Joined {
            module: module.clone(),
            name: announce.name.clone(),
        });
        self.churn(state, fx);
        HandleOutcome::Handled
    }

    // ─── Lifecycle ─────────────────────────────────────────────────

    /// `module` is no longer live: drop its config targets and let every
    /// other module re-run dependency resolution.
    fn depart(&self, state: &mut HostState, module: &ModuleId, fx: &mut Effects) {
        state.negotiation.unregister_module(module);
        state.spark.forget(module);
        let dropped = state.context.forget_source(module);
        debug!(module_id = %module, context_entries = dropped, "module state released");
        fx.membership.push(MembershipChange::Left {
            module: module.clone(),
        });
        self.churn(state, fx);
    }

    /// React to a membership change: re-evaluate every live module and
    /// resync the registry view.
    fn churn(&self, state: &mut HostState, fx: &mut Effects) {
        let roles = state.registry.role_index();
        for module in state.registry.live_ids() {
            self.reevaluate(state, &module, &roles, fx);
        }
        let modules = state.registry.entries();
        for module in state.registry.live_ids() {
            fx.send(
                &module,
                EventEnvelope::new(ProtocolEvent::RegistrySync(RegistrySync {
                    modules: modules.clone(),
                })),
            );
        }
    }

    fn reevaluate(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        roles: &RoleIndex,
        fx: &mut Effects,
    ) {
        let target = ConfigTarget::module(module.clone());
        let needs_configuration =
            state.negotiation.contains(&target) && !state.negotiation.is_settled(&target);
        let Some(announced) = state.registry.announced_mut(module) else {
            return;
        };
        let report = announced.lifecycle.evaluate_dependencies(roles, module);
        let identity = announced.identity.clone();

        if announced.phase() != ModulePhase::Preparing {
            if report.changed {
                debug!(
                    module_id = %module,
                    missing = report.missing_required.len(),
                    "dependencies changed"
                );
                send_prepared(fx, &identity, report.all_missing());
            }
            self.try_promote(state, module, fx);
            return;
        }

        if !report.missing_required.is_empty() {
            if report.changed {
                info!(
                    module_id = %module,
                    missing = report.missing_required.len(),
                    "required dependencies missing"
                );
                send_prepared(fx, &identity, report.all_missing());
            }
            return;
        }

        send_prepared(fx, &identity, report.missing_optional);
        let next = if needs_configuration {
            ModulePhase::ConfigurationNeeded
        } else {
            ModulePhase::Prepared
        };
        match announced.lifecycle.transition(next, None) {
            Ok(change) => emit_status(fx, &identity, &change),
            Err(error) => {
                warn!(module_id = %module, %error, "dependency resolution could not advance");
                return;
            }
        }
        if needs_configuration {
            self.announce_needed(state, &target, Some("no valid stored configuration".into()), fx);
        }
        self.try_promote(state, module, fx);
    }

    /// Send `configuration:needed` for a target to its module.
    fn announce_needed(
        &self,
        state: &HostState,
        target: &ConfigTarget,
        reason: Option<String>,
        fx: &mut Effects,
    ) {
        let Some(announced) = state.registry.announced(&target.module) else {
            return;
        };
        let schema = state
            .negotiation
            .schema(target)
            .map(|schema| schema.descriptor().clone());
        let current = state.negotiation.stored(target).cloned();
        fx.send(
            &target.module,
            EventEnvelope::new(needed_event(
                announced.identity.clone(),
                target.capability.clone(),
                schema,
                current,
                reason,
            )),
        );
    }

    fn try_promote(&self, state: &mut HostState, module: &ModuleId, fx: &mut Effects) {
        if !self.config.auto_ready {
            return;
        }
        if let Err(blocker) = self.promote(state, module, None, fx) {
            debug!(module_id = %module, %blocker, "not ready yet");
        }
    }

    /// Move to `ready` when the gate passes.
    fn promote(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        reason: Option<String>,
        fx: &mut Effects,
    ) -> Result<(), String> {
        let settled = state
            .negotiation
            .is_settled(&ConfigTarget::module(module.clone()));
        let announced = state
            .registry
            .announced_mut(module)
            .ok_or_else(|| ProtocolError::ModuleNotFound(module.to_string()).to_string())?;
        let phase = announced.phase();
        if phase == ModulePhase::Ready {
            return Ok(());
        }
        if !matches!(phase, ModulePhase::Prepared | ModulePhase::Configured) {
            return Err(format!("cannot become ready while {phase}"));
        }
        announced
            .lifecycle
            .readiness(settled, announced.capabilities.awaiting_configuration())
            .map_err(|blocker| blocker.to_string())?;
        let change = announced
            .lifecycle
            .transition(ModulePhase::Ready, reason)
            .map_err(|error| error.to_string())?;
        info!(module_id = %module, "module ready");
        emit_status(fx, &announced.identity.clone(), &change);
        Ok(())
    }

    fn on_status_change(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        envelope: &EventEnvelope,
        status: &ModuleStatus,
        fx: &mut Effects,
    ) -> HandleOutcome {
        if status.identity.id != *module {
            let error = ProtocolError::IdentityMismatch {
                session: module.to_string(),
                announced: status.identity.id.to_string(),
            };
            return reject(fx, module, envelope, error.to_string());
        }
        let Some(current) = state.registry.phase_of(module) else {
            return not_found(fx, module, envelope);
        };

        let requested = status.phase;
        let result = if requested == ModulePhase::Ready {
            self.promote(state, module, status.reason.clone(), fx)
        } else if current.can_advance_to(requested) && requested != ModulePhase::Failed {
            Err(format!("{requested} is entered by the host, not on request"))
        } else {
            self.request_phase(state, module, requested, status.reason.clone(), fx)
        };

        match result {
            Ok(()) => HandleOutcome::Handled,
            Err(reason) => {
                warn!(from = %current, to = %requested, %reason, "status change refused");
                fx.send(
                    module,
                    envelope.reply(ProtocolEvent::Status(ModuleStatus {
                        identity: status.identity.clone(),
                        phase: current,
                        reason: Some(reason.clone()),
                        details: None,
                    })),
                );
                HandleOutcome::Ignored { reason }
            }
        }
    }

    /// Apply a module-requested failure or re-entry.
    fn request_phase(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        requested: ModulePhase,
        reason: Option<String>,
        fx: &mut Effects,
    ) -> Result<(), String> {
        let announced = state
            .registry
            .announced_mut(module)
            .ok_or_else(|| ProtocolError::ModuleNotFound(module.to_string()).to_string())?;
        let change = announced
            .lifecycle
            .request(requested, reason)
            .map_err(|error| error.to_string())?;
        let identity = announced.identity.clone();
        info!(module_id = %module, from = %change.from, to = %change.to, "module requested phase");
        emit_status(fx, &identity, &change);

        match requested {
            ModulePhase::Failed => {
                state.negotiation.unregister_module(module);
                self.churn(state, fx);
            }
            ModulePhase::ConfigurationNeeded => {
                let target = ConfigTarget::module(module.clone());
                self.announce_needed(state, &target, change.reason.clone(), fx);
            }
            ModulePhase::Preparing => {
                let roles = state.registry.role_index();
                self.reevaluate(state, module, &roles, fx);
            }
            _ => {}
        }
        Ok(())
    }

    // ─── Capabilities ──────────────────────────────────────────────

    fn on_offer(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        envelope: &EventEnvelope,
        offer: &CapabilityOffer,
        stored: Option<ModuleConfigEnvelope>,
        fx: &mut Effects,
    ) -> HandleOutcome {
        if offer.identity.id != *module {
            let error = ProtocolError::IdentityMismatch {
                session: module.to_string(),
                announced: offer.identity.id.to_string(),
            };
            return reject(fx, module, envelope, error.to_string());
        }
        let capability = offer.capability.clone();
        let target = ConfigTarget::capability(module.clone(), capability.id.clone());
        let schema = match capability.config_schema.clone().map(CompiledSchema::compile) {
            Some(Ok(schema)) => Some(schema),
            Some(Err(error)) => return reject(fx, module, envelope, error.to_string()),
            None => None,
        };
        let settled = schema.as_ref().is_none_or(|schema| {
            let stored = stored.as_ref().filter(|envelope| envelope.full.is_some());
            schema
                .validate(
                    stored.and_then(|envelope| envelope.full.as_ref()),
                    stored.map(|envelope| envelope.schema_version),
                )
                .is_valid()
        });

        let Some(announced) = state.registry.announced_mut(module) else {
            return not_found(fx, module, envelope);
        };
        let phase = announced.phase();
        let outcome = match announced.capabilities.offer(phase, capability.clone(), settled) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(capability = %capability.id, %error, "capability offer rejected");
                let reason = error.to_string();
                fx.send(
                    module,
                    envelope.reply(ProtocolEvent::CapabilityActivated(CapabilityActivated {
                        identity: offer.identity.clone(),
                        capability_id: capability.id.clone(),
                        active: false,
                        reason: Some(reason.clone()),
                    })),
                );
                return HandleOutcome::Ignored { reason };
            }
        };

        match schema {
            Some(schema) => state.negotiation.register(target.clone(), schema, stored),
            None => state.negotiation.unregister(&target),
        }
        info!(
            capability = %capability.id,
            needs_configuration = outcome.needs_configuration,
            replaced = outcome.replaced,
            "capability offered"
        );
        if outcome.needs_configuration {
            let reason = Some("capability requires configuration".to_owned());
            self.announce_needed(state, &target, reason, fx);
        }
        HandleOutcome::Handled
    }

    fn on_activated(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        envelope: &EventEnvelope,
        activated: &CapabilityActivated,
        fx: &mut Effects,
    ) -> HandleOutcome {
        if activated.identity.id != *module {
            let error = ProtocolError::IdentityMismatch {
                session: module.to_string(),
                announced: activated.identity.id.to_string(),
            };
            return reject(fx, module, envelope, error.to_string());
        }
        let Some(announced) = state.registry.announced_mut(module) else {
            return not_found(fx, module, envelope);
        };
        if let Err(error) = announced.capabilities.activate(
            &activated.capability_id,
            activated.active,
            activated.reason.clone(),
        ) {
            return reject(fx, module, envelope, error.to_string());
        }
        if activated.active {
            info!(capability = %activated.capability_id, "capability activated");
        } else {
            warn!(
                capability = %activated.capability_id,
                reason = activated.reason.as_deref().unwrap_or("unspecified"),
                "capability deactivated"
            );
        }
        self.churn(state, fx);
        HandleOutcome::Handled
    }

    // ─── Configuration negotiation ─────────────────────────────────

    fn on_negotiation(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        envelope: &EventEnvelope,
        negotiation: Negotiation<'_>,
        fx: &mut Effects,
    ) -> HandleOutcome {
        let Some(target) = negotiation.target() else {
            let message = format!(
                "{} must {}carry a capabilityId",
                envelope.event_type(),
                if negotiation.capability_id().is_some() { "not " } else { "" }
            );
            return reject(fx, module, envelope, message);
        };
        let identity = negotiation.identity().clone();
        let step = negotiation.step;

        match negotiation.message {
            NegotiationMessage::ValidateRequest(request) => {
                let current = request.current.as_ref();
                if let Some(Err(error)) = current.map(ModuleConfigEnvelope::payload) {
                    return reject(fx, module, envelope, error.to_string());
                }
                self.begin_step(state, module, envelope, &target, &identity, step, fx);
                match state.negotiation.validate(&target, current) {
                    Ok((validation, plan)) => {
                        fx.send(
                            module,
                            envelope.reply(validate_response_event(ConfigValidateResponse {
                                identity: identity.clone(),
                                capability_id: target.capability.clone(),
                                validation,
                                plan,
                            })),
                        );
                        self.progress(
                            state,
                            module,
                            envelope,
                            &target,
                            &identity,
                            step,
                            ProgressState::Done,
                            fx,
                        );
                        HandleOutcome::Handled
                    }
                    Err(error) => {
                        self.progress(
                            state,
                            module,
                            envelope,
                            &target,
                            &identity,
                            step,
                            ProgressState::Failed,
                            fx,
                        );
                        reject(fx, module, envelope, error.to_string())
                    }
                }
            }
            NegotiationMessage::PlanRequest(request) => {
                let current = request.current.as_ref();
                if let Some(Err(error)) = current.map(ModuleConfigEnvelope::payload) {
                    return reject(fx, module, envelope, error.to_string());
                }
                self.begin_step(state, module, envelope, &target, &identity, step, fx);
                match state.negotiation.plan(&target, current) {
                    Ok(plan) => {
                        fx.send(
                            module,
                            envelope.reply(plan_response_event(ConfigPlanResponse {
                                identity: identity.clone(),
                                capability_id: target.capability.clone(),
                                plan,
                            })),
                        );
                        self.progress(
                            state,
                            module,
                            envelope,
                            &target,
                            &identity,
                            step,
                            ProgressState::Done,
                            fx,
                        );
                        HandleOutcome::Handled
                    }
                    Err(error) => {
                        self.progress(
                            state,
                            module,
                            envelope,
                            &target,
                            &identity,
                            step,
                            ProgressState::Failed,
                            fx,
                        );
                        reject(fx, module, envelope, error.to_string())
                    }
                }
            }
            NegotiationMessage::CommitRequest(request) => {
                self.on_commit(state, module, envelope, &target, identity, request, fx)
            }
            NegotiationMessage::Status(status) => {
                match state
                    .negotiation
                    .observe_status(&target, step, status.state, status.sequence)
                {
                    StatusObservation::Accepted => {
                        self.route_if_addressed(state, module, envelope, fx)
                    }
                    StatusObservation::Discarded { reason } => {
                        warn!(config_target = %target, %step, reason, "status discarded");
                        HandleOutcome::Ignored {
                            reason: reason.to_owned(),
                        }
                    }
                }
            }
            NegotiationMessage::ValidateResponse(_)
            | NegotiationMessage::PlanResponse(_)
            | NegotiationMessage::CommitResponse(_) => {
                self.route_if_addressed(state, module, envelope, fx)
            }
            NegotiationMessage::Configured(configured) => {
                if target.module != *module {
                    return reject(
                        fx,
                        module,
                        envelope,
                        format!("{module} cannot report configuration for {target}"),
                    );
                }
                match state.negotiation.adopt(&target, &configured.config) {
                    Ok(adopted) => {
                        info!(
                            config_target = %target,
                            revision = adopted.revision,
                            "module reported configuration"
                        );
                        fx.persist.push((target.clone(), adopted));
                        self.settle(state, &target, fx);
                        HandleOutcome::Handled
                    }
                    Err(error) => reject(fx, module, envelope, error.to_string()),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_commit(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        envelope: &EventEnvelope,
        target: &ConfigTarget,
        identity: ModuleIdentity,
        request: &ConfigCommitRequest,
        fx: &mut Effects,
    ) -> HandleOutcome {
        if let Err(error) = request.config.payload() {
            return reject(fx, module, envelope, error.to_string());
        }
        let step = NegotiationStep::Commit;
        self.begin_step(state, module, envelope, target, &identity, step, fx);

        let committed = match state.negotiation.commit(target, &request.config) {
            Ok(committed) => committed,
            Err(rejection) => {
                fx.send(
                    module,
                    envelope.reply(commit_response_event(ConfigCommitResponse {
                        identity: identity.clone(),
                        capability_id: target.capability.clone(),
                        accepted: false,
                        revision: Some(rejection.current_revision),
                        reason: Some(rejection.reason),
                        validation: rejection.validation,
                    })),
                );
                self.progress(
                    state, module, envelope, target, &identity, step, ProgressState::Failed, fx,
                );
                return HandleOutcome::Handled;
            }
        };

        info!(config_target = %target, revision = committed.revision, "config committed");
        fx.send(
            module,
            envelope.reply(commit_response_event(ConfigCommitResponse {
                identity: identity.clone(),
                capability_id: target.capability.clone(),
                accepted: true,
                revision: Some(committed.revision),
                reason: None,
                validation: Some(ModuleConfigValidation::valid()),
            })),
        );
        self.progress(state, module, envelope, target, &identity, step, ProgressState::Done, fx);

        let configured = envelope.reply(configured_event(
            ConfigConfigured {
                identity,
                capability_id: target.capability.clone(),
                config: committed.clone(),
            },
        ));
        if target.module != *module {
            fx.send(module, configured.clone());
        }
        fx.send(&target.module, configured);
        fx.persist.push((target.clone(), committed));
        self.settle(state, target, fx);
        HandleOutcome::Handled
    }

    /// A target now holds a valid config: advance the module or mark the
    /// capability configured, then re-check readiness.
    fn settle(&self, state: &mut HostState, target: &ConfigTarget, fx: &mut Effects) {
        let Some(announced) = state.registry.announced_mut(&target.module) else {
            return;
        };
        match &target.capability {
            None if announced.phase() == ModulePhase::ConfigurationNeeded => {
                match announced.lifecycle.transition(ModulePhase::Configured, None) {
                    Ok(change) => emit_status(fx, &announced.identity.clone(), &change),
                    Err(error) => {
                        warn!(
                            config_target = %target,
                            %error,
                            "configured module could not advance"
                        );
                    }
                }
            }
            None => {}
            Some(capability) => {
                if let Err(error) = announced.capabilities.mark_configured(capability) {
                    debug!(config_target = %target, %error, "configured capability is not offered");
                }
            }
        }
        self.try_promote(state, &target.module, fx);
    }

    #[allow(clippy::too_many_arguments)]
    fn begin_step(
        &self,
        state: &mut HostState,
        requester: &ModuleId,
        envelope: &EventEnvelope,
        target: &ConfigTarget,
        identity: &ModuleIdentity,
        step: NegotiationStep,
        fx: &mut Effects,
    ) {
        state.negotiation.begin_round(target, step);
        self.progress(
            state, requester, envelope, target, identity, step, ProgressState::Working, fx,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn progress(
        &self,
        state: &mut HostState,
        requester: &ModuleId,
        envelope: &EventEnvelope,
        target: &ConfigTarget,
        identity: &ModuleIdentity,
        step: NegotiationStep,
        progress: ProgressState,
        fx: &mut Effects,
    ) {
        if !self.config.emit_progress {
            return;
        }
        let sequence = state.negotiation.next_host_sequence(target, step);
        fx.send(
            requester,
            envelope.reply(status_event(
                step,
                ConfigStepStatus {
                    identity: identity.clone(),
                    capability_id: target.capability.clone(),
                    state: progress,
                    sequence: Some(sequence),
                    note: None,
                },
            )),
        );
    }

    /// Responses and statuses produced by modules are forwarded only when
    /// they name their recipients.
    fn route_if_addressed(
        &self,
        state: &mut HostState,
        module: &ModuleId,
        envelope: &EventEnvelope,
        fx: &mut Effects,
    ) -> HandleOutcome {
        if envelope
            .destinations()
            .is_some_and(|destinations| !destinations.is_empty())
        {
            return self.route(state, module, envelope.clone(), fx);
        }
        HandleOutcome::Ignored {
            reason: format!("{} carries no destinations", envelope.event_type()),
        }
    }
}

fn fold_context(context: &mut ContextStore, module: &ModuleId, updates: &[ContextUpdate]) {
    for update in updates {
        context.apply(Some(module), update);
    }
}

fn emit_status(fx: &mut Effects, identity: &ModuleIdentity, change: &PhaseChange) {
    fx.send(
        &identity.id,
        EventEnvelope::new(ProtocolEvent::Status(ModuleStatus {
            identity: identity.clone(),
            phase: change.to,
            reason: change.reason.clone(),
            details: None,
        })),
    );
    fx.membership.push(MembershipChange::PhaseChanged {
        module: identity.id.clone(),
        phase: change.to,
    });
}

fn send_prepared(
    fx: &mut Effects,
    identity: &ModuleIdentity,
    missing_dependencies: Vec<ModuleDependency>,
) {
    fx.send(
        &identity.id,
        EventEnvelope::new(ProtocolEvent::Prepared(ModulePrepared {
            identity: identity.clone(),
            missing_dependencies,
        })),
    );
}

fn not_found(fx: &mut Effects, module: &ModuleId, envelope: &EventEnvelope) -> HandleOutcome {
    let error = ProtocolError::ModuleNotFound(module.to_string());
    reject(fx, module, envelope, error.to_string())
}

/// Answer with `error{message}` and drop the event.
fn reject(
    fx: &mut Effects,
    module: &ModuleId,
    envelope: &EventEnvelope,
    message: String,
) -> HandleOutcome {
    warn!(module_id = %module, event_type = envelope.event_type(), %message, "event rejected");
    fx.send(
        module,
        envelope.reply(ProtocolEvent::Error(ErrorRaised {
            message: message.clone(),
        })),
    );
    HandleOutcome::Ignored { reason: message }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use modlink_events::MemoryEventSink;
    use modlink_protocol::event::{Authenticate, Heartbeat};
    use modlink_protocol::{
        ContextUpdateStrategy, EventId, EventSink, ModuleCapability, ModuleConfigSchema,
        PluginIdentity, ProtocolResult, SparkEmit, SparkEmitState, SparkNotify,
    };
    use serde_json::{Value, json};
    use tokio::sync::Notify;

    use super::*;
    use crate::registry::ROLE_LABEL;

    #[derive(Default)]
    struct MemoryConfigStore {
        saved: Mutex<HashMap<ConfigTarget, ModuleConfigEnvelope>>,
    }

    #[async_trait]
    impl ConfigStorePort for MemoryConfigStore {
        async fn load(
            &self,
            target: &ConfigTarget,
        ) -> ProtocolResult<Option<ModuleConfigEnvelope>> {
            Ok(self.saved.lock().get(target).cloned())
        }

        async fn save(
            &self,
            target: &ConfigTarget,
            envelope: &ModuleConfigEnvelope,
        ) -> ProtocolResult<()> {
            self.saved.lock().insert(target.clone(), envelope.clone());
            Ok(())
        }
    }

    /// Holds the first `module:status` delivered to `held` once armed, until
    /// released.
    struct HoldingSink {
        inner: MemoryEventSink,
        held: ModuleId,
        armed: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    impl HoldingSink {
        fn new(held: ModuleId) -> Self {
            Self {
                inner: MemoryEventSink::new(),
                held,
                armed: AtomicBool::new(false),
                reached: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl EventSink for HoldingSink {
        async fn deliver(
            &self,
            recipient: &ModuleId,
            envelope: EventEnvelope,
        ) -> ProtocolResult<()> {
            let status = matches!(envelope.event, ProtocolEvent::Status(_));
            if status && *recipient == self.held && self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.deliver(recipient, envelope).await
        }
    }

    struct UnreachableVerifier;

    #[async_trait]
    impl TokenVerifier for UnreachableVerifier {
        async fn verify(&self, _module: &ModuleId, _token: &str) -> ProtocolResult<bool> {
            Err(ProtocolError::Storage("token directory unreachable".to_owned()))
        }
    }

    fn statuses(sink: &MemoryEventSink, module: &ModuleId) -> Vec<ModulePhase> {
        sink.delivered(module)
            .into_iter()
            .filter_map(|envelope| match envelope.event {
                ProtocolEvent::Status(status) => Some(status.phase),
                _ => None,
            })
            .collect()
    }

    fn host(config: HostConfig) -> (HostRuntime, Arc<MemoryEventSink>) {
        let sink = Arc::new(MemoryEventSink::new());
        let journal = EventJournal::new(sink.clone(), EventStreamHub::new(64));
        (HostRuntime::new(config, journal), sink)
    }

    fn identity(id: &str, labels: &[(&str, &str)]) -> ModuleIdentity {
        let mut identity = ModuleIdentity::new(
            id,
            PluginIdentity::new(format!("{id}-plugin")).with_version("1.0.0"),
        );
        for (key, value) in labels {
            identity = identity.with_label(*key, *value);
        }
        identity
    }

    fn token_schema(id: &str) -> ModuleConfigSchema {
        ModuleConfigSchema::new(
            id,
            1,
            Some(json!({
                "type": "object",
                "required": ["token"],
                "properties": {"token": {"type": "string"}}
            })),
        )
    }

    fn announce(
        identity: &ModuleIdentity,
        dependencies: Vec<ModuleDependency>,
        config_schema: Option<ModuleConfigSchema>,
    ) -> EventEnvelope {
        EventEnvelope::new(ProtocolEvent::Announce(ModuleAnnounce {
            name: identity.id.to_string(),
            index: None,
            identity: identity.clone(),
            possible_events: Vec::new(),
            config_schema,
            dependencies,
        }))
    }

    fn request_ready(identity: &ModuleIdentity) -> EventEnvelope {
        EventEnvelope::new(ProtocolEvent::StatusChange(ModuleStatus {
            identity: identity.clone(),
            phase: ModulePhase::Ready,
            reason: None,
            details: None,
        }))
    }

    fn commit(
        identity: &ModuleIdentity,
        capability: Option<&str>,
        config: ModuleConfigEnvelope,
    ) -> EventEnvelope {
        let request = ConfigCommitRequest {
            identity: identity.clone(),
            capability_id: capability.map(Into::into),
            config,
        };
        EventEnvelope::new(match capability {
            Some(_) => ProtocolEvent::CapabilityConfigCommitRequest(request),
            None => ProtocolEvent::ConfigCommitRequest(request),
        })
    }

    fn last_missing(sink: &MemoryEventSink, module: &ModuleId) -> Option<usize> {
        sink.delivered(module)
            .into_iter()
            .filter_map(|envelope| match envelope.event {
                ProtocolEvent::Prepared(prepared) => Some(prepared.missing_dependencies.len()),
                _ => None,
            })
            .last()
    }

    fn commit_responses(sink: &MemoryEventSink, module: &ModuleId) -> Vec<ConfigCommitResponse> {
        sink.delivered(module)
            .into_iter()
            .filter_map(|envelope| match envelope.event {
                ProtocolEvent::ConfigCommitResponse(response)
                | ProtocolEvent::CapabilityConfigCommitResponse(response) => Some(response),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn required_dependency_holds_module_in_preparing() -> Result<()> {
        let (runtime, sink) = host(HostConfig::default());
        let bot = identity("telegram-bot", &[]);
        runtime.open_session(bot.id.clone(), None).await?;
        runtime
            .handle(
                &bot.id,
                announce(&bot, vec![ModuleDependency::required("llm:orchestrator")], None),
            )
            .await?;
        assert_eq!(runtime.phase_of(&bot.id), Some(ModulePhase::Preparing));
        assert_eq!(last_missing(&sink, &bot.id), Some(1));

        let refused = runtime.handle(&bot.id, request_ready(&bot)).await?;
        assert!(matches!(refused, HandleOutcome::Ignored { .. }));

        let brain = identity("brain", &[(ROLE_LABEL, "llm:orchestrator")]);
        runtime.open_session(brain.id.clone(), None).await?;
        runtime.handle(&brain.id, announce(&brain, Vec::new(), None)).await?;
        assert_eq!(runtime.phase_of(&bot.id), Some(ModulePhase::Prepared));
        assert_eq!(last_missing(&sink, &bot.id), Some(0));

        assert_eq!(
            runtime.handle(&bot.id, request_ready(&bot)).await?,
            HandleOutcome::Handled
        );
        assert_eq!(runtime.phase_of(&bot.id), Some(ModulePhase::Ready));

        // Losing the provider is reported but never demotes.
        assert!(runtime.close_session(&brain.id, "shutdown").await?);
        assert_eq!(runtime.phase_of(&bot.id), Some(ModulePhase::Ready));
        assert_eq!(last_missing(&sink, &bot.id), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn commit_advances_persisted_revision_and_rejects_stale_base() -> Result<()> {
        let bot = identity("telegram-bot", &[]);
        let target = ConfigTarget::module(bot.id.clone());
        let store = Arc::new(MemoryConfigStore::default());
        store.saved.lock().insert(
            target.clone(),
            ModuleConfigEnvelope::full("telegram", 5, 1, json!({"token": "old"})),
        );
        let (runtime, sink) = host(HostConfig::default());
        let runtime = runtime.with_config_store(store.clone());

        runtime.open_session(bot.id.clone(), None).await?;
        runtime
            .handle(&bot.id, announce(&bot, Vec::new(), Some(token_schema("telegram"))))
            .await?;
        assert_eq!(runtime.phase_of(&bot.id), Some(ModulePhase::Prepared));

        let mut update = ModuleConfigEnvelope::full("telegram", 5, 1, json!({"token": "new"}));
        update.base_revision = Some(5);
        runtime.handle(&bot.id, commit(&bot, None, update.clone())).await?;

        assert_eq!(runtime.stored_config(&target).map(|s| s.revision), Some(6));
        assert_eq!(store.saved.lock().get(&target).map(|s| s.revision), Some(6));
        let configured: Vec<_> = sink
            .delivered(&bot.id)
            .into_iter()
            .filter_map(|envelope| match envelope.event {
                ProtocolEvent::ConfigConfigured(configured) => Some(configured.config.revision),
                _ => None,
            })
            .collect();
        assert_eq!(configured, vec![6]);

        runtime.handle(&bot.id, commit(&bot, None, update)).await?;
        let responses = commit_responses(&sink, &bot.id);
        assert_eq!(responses.len(), 2);
        assert!(responses[0].accepted);
        assert!(!responses[1].accepted);
        assert_eq!(responses[1].revision, Some(6));
        assert_eq!(runtime.stored_config(&target).map(|s| s.revision), Some(6));

        let progress: Vec<_> = sink
            .delivered(&bot.id)
            .into_iter()
            .filter_map(|envelope| match envelope.event {
                ProtocolEvent::ConfigCommitStatus(status) => Some((status.state, status.sequence)),
                _ => None,
            })
            .collect();
        assert_eq!(
            progress,
            vec![
                (ProgressState::Working, Some(1)),
                (ProgressState::Done, Some(2)),
                (ProgressState::Working, Some(3)),
                (ProgressState::Failed, Some(4)),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn commit_under_a_foreign_config_id_is_refused() -> Result<()> {
        let (runtime, sink) = host(HostConfig::default());
        let bot = identity("telegram-bot", &[]);
        let target = ConfigTarget::module(bot.id.clone());
        runtime.open_session(bot.id.clone(), None).await?;
        runtime
            .handle(&bot.id, announce(&bot, Vec::new(), Some(token_schema("telegram"))))
            .await?;

        let first = ModuleConfigEnvelope::full("telegram", 0, 1, json!({"token": "a"}));
        runtime.handle(&bot.id, commit(&bot, None, first)).await?;
        let foreign = ModuleConfigEnvelope::patch("discord", 1, 1, json!({"token": "b"}));
        runtime.handle(&bot.id, commit(&bot, None, foreign)).await?;

        let accepted: Vec<_> = commit_responses(&sink, &bot.id)
            .into_iter()
            .map(|response| response.accepted)
            .collect();
        assert_eq!(accepted, vec![true, false]);
        let stored = runtime.stored_config(&target);
        assert_eq!(
            stored.map(|s| (s.config_id.to_string(), s.revision)),
            Some(("telegram".to_owned(), 1))
        );
        Ok(())
    }

    #[tokio::test]
    async fn auto_ready_promotes_once_configuration_is_committed() -> Result<()> {
        let config = HostConfig {
            auto_ready: true,
            ..HostConfig::default()
        };
        let (runtime, sink) = host(config);
        let bot = identity("telegram-bot", &[]);
        runtime.open_session(bot.id.clone(), None).await?;
        runtime
            .handle(&bot.id, announce(&bot, Vec::new(), Some(token_schema("telegram"))))
            .await?;
        assert_eq!(runtime.phase_of(&bot.id), Some(ModulePhase::ConfigurationNeeded));
        assert!(
            sink.event_types(&bot.id)
                .contains(&"module:configuration:needed".to_owned())
        );

        let invalid = ModuleConfigEnvelope::full("telegram", 0, 1, json!({"token": 42}));
        runtime.handle(&bot.id, commit(&bot, None, invalid)).await?;
        assert_eq!(runtime.phase_of(&bot.id), Some(ModulePhase::ConfigurationNeeded));

        let valid = ModuleConfigEnvelope::full("telegram", 0, 1, json!({"token": "abc"}));
        runtime.handle(&bot.id, commit(&bot, None, valid)).await?;
        assert_eq!(runtime.phase_of(&bot.id), Some(ModulePhase::Ready));

        let phases: Vec<_> = sink
            .delivered(&bot.id)
            .into_iter()
            .filter_map(|envelope| match envelope.event {
                ProtocolEvent::Status(status) => Some(status.phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                ModulePhase::Preparing,
                ModulePhase::ConfigurationNeeded,
                ModulePhase::Configured,
                ModulePhase::Ready,
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn capability_awaiting_configuration_blocks_ready() -> Result<()> {
        let (runtime, sink) = host(HostConfig::default());
        let speaker = identity("speaker", &[]);
        runtime.open_session(speaker.id.clone(), None).await?;
        runtime.handle(&speaker.id, announce(&speaker, Vec::new(), None)).await?;

        let offer = EventEnvelope::new(ProtocolEvent::CapabilityOffer(CapabilityOffer {
            identity: speaker.clone(),
            capability: ModuleCapability::new("tts").with_config_schema(token_schema("tts")),
        }));
        assert_eq!(runtime.handle(&speaker.id, offer).await?, HandleOutcome::Handled);
        assert!(
            sink.event_types(&speaker.id)
                .contains(&"module:contribute:capability:configuration:needed".to_owned())
        );
        assert!(matches!(
            runtime.handle(&speaker.id, request_ready(&speaker)).await?,
            HandleOutcome::Ignored { .. }
        ));

        let config = ModuleConfigEnvelope::full("tts", 0, 1, json!({"token": "voice"}));
        runtime.handle(&speaker.id, commit(&speaker, Some("tts"), config)).await?;
        let record = runtime.capability(&speaker.id, "tts");
        assert_eq!(record.map(|r| r.awaiting_configuration), Some(false));

        runtime.handle(&speaker.id, request_ready(&speaker)).await?;
        assert_eq!(runtime.phase_of(&speaker.id), Some(ModulePhase::Ready));

        // A fresh offer that needs configuration is refused once ready.
        let late = EventEnvelope::new(ProtocolEvent::CapabilityOffer(CapabilityOffer {
            identity: speaker.clone(),
            capability: ModuleCapability::new("stt").with_config_schema(token_schema("stt")),
        }));
        assert!(matches!(
            runtime.handle(&speaker.id, late).await?,
            HandleOutcome::Ignored { .. }
        ));
        let refusal = sink.delivered(&speaker.id).into_iter().rev().find_map(|envelope| {
            match envelope.event {
                ProtocolEvent::CapabilityActivated(activated) => Some(activated),
                _ => None,
            }
        });
        assert_eq!(refusal.map(|a| (a.capability_id, a.active)), Some(("stt".into(), false)));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_spark_notify_is_forwarded_once() -> Result<()> {
        let (runtime, sink) = host(HostConfig::default());
        let brain = identity("brain", &[]);
        let bot = identity("telegram-bot", &[]);
        for module in [&brain, &bot] {
            runtime.open_session(module.id.clone(), None).await?;
            runtime.handle(&module.id, announce(module, Vec::new(), None)).await?;
        }

        let notify = SparkNotify {
            id: EventId::from("notify-1"),
            event_id: EventId::from("evt-1"),
            kind: "reminder".to_owned(),
            urgency: Default::default(),
            headline: "stand up".to_owned(),
            note: None,
            payload: None,
            destinations: None,
            requires_ack: false,
            ttl_ms: None,
            issued_at: None,
        };
        let envelope = EventEnvelope::new(ProtocolEvent::SparkNotify(notify));
        assert_eq!(
            runtime.handle(&brain.id, envelope.clone()).await?,
            HandleOutcome::Routed {
                recipients: vec![bot.id.clone()]
            }
        );
        assert!(matches!(
            runtime.handle(&brain.id, envelope).await?,
            HandleOutcome::Ignored { .. }
        ));
        let forwarded = sink
            .event_types(&bot.id)
            .into_iter()
            .filter(|event_type| event_type == "spark:notify")
            .count();
        assert_eq!(forwarded, 1);
        Ok(())
    }

    #[tokio::test]
    async fn every_recipient_of_a_broadcast_acks_independently() -> Result<()> {
        let (runtime, sink) = host(HostConfig::default());
        let brain = identity("brain", &[]);
        let bot_a = identity("bot-a", &[]);
        let bot_b = identity("bot-b", &[]);
        for module in [&brain, &bot_a, &bot_b] {
            runtime.open_session(module.id.clone(), None).await?;
            runtime.handle(&module.id, announce(module, Vec::new(), None)).await?;
        }

        let ack = |id: &str, state: SparkEmitState| {
            EventEnvelope::new(ProtocolEvent::SparkEmit(SparkEmit {
                id: EventId::from(id),
                event_id: EventId::from("evt-broadcast"),
                state,
                note: None,
                payload: None,
            }))
        };
        for (module, id) in [(&bot_a, "emit-a"), (&bot_b, "emit-b")] {
            let outcome = runtime.handle(&module.id, ack(id, SparkEmitState::Queued)).await?;
            assert!(matches!(outcome, HandleOutcome::Routed { .. }), "{outcome:?}");
        }
        let done = runtime.handle(&bot_a.id, ack("emit-a-done", SparkEmitState::Done)).await?;
        assert!(matches!(done, HandleOutcome::Routed { .. }));

        // A recipient still cannot walk its own state backwards.
        let regress = runtime.handle(&bot_a.id, ack("emit-a-late", SparkEmitState::Working)).await?;
        assert!(matches!(regress, HandleOutcome::Ignored { .. }));

        let acks = sink
            .event_types(&brain.id)
            .into_iter()
            .filter(|event_type| event_type == "spark:emit")
            .count();
        assert_eq!(acks, 3);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_handles_deliver_status_in_state_order() -> Result<()> {
        let bot = identity("telegram-bot", &[]);
        let brain = identity("brain", &[(ROLE_LABEL, "llm:orchestrator")]);
        let sink = Arc::new(HoldingSink::new(bot.id.clone()));
        let journal = EventJournal::new(sink.clone(), EventStreamHub::new(64));
        let runtime = HostRuntime::new(HostConfig::default(), journal);

        runtime.open_session(bot.id.clone(), None).await?;
        runtime
            .handle(
                &bot.id,
                announce(&bot, vec![ModuleDependency::required("llm:orchestrator")], None),
            )
            .await?;
        runtime.open_session(brain.id.clone(), None).await?;

        // The refused ready request answers with `preparing`; hold that reply.
        sink.armed.store(true, Ordering::SeqCst);
        let refused = tokio::spawn({
            let runtime = runtime.clone();
            let bot = bot.clone();
            async move { runtime.handle(&bot.id, request_ready(&bot)).await }
        });
        sink.reached.notified().await;

        let joined = tokio::spawn({
            let runtime = runtime.clone();
            let brain = brain.clone();
            async move { runtime.handle(&brain.id, announce(&brain, Vec::new(), None)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.phase_of(&bot.id), Some(ModulePhase::Preparing));

        sink.release.notify_one();
        assert!(matches!(refused.await??, HandleOutcome::Ignored { .. }));
        assert_eq!(joined.await??, HandleOutcome::Handled);

        assert_eq!(
            statuses(&sink.inner, &bot.id),
            vec![
                ModulePhase::Preparing,
                ModulePhase::Preparing,
                ModulePhase::Prepared,
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn verifier_failure_is_reported_to_the_module() -> Result<()> {
        let config = HostConfig {
            require_authentication: true,
            ..HostConfig::default()
        };
        let (runtime, sink) = host(config);
        let runtime = runtime.with_token_verifier(Arc::new(UnreachableVerifier));
        let bot = identity("telegram-bot", &[]);
        runtime.open_session(bot.id.clone(), None).await?;

        let authenticate = EventEnvelope::new(ProtocolEvent::Authenticate(Authenticate {
            token: "secret".to_owned(),
        }));
        assert_eq!(runtime.handle(&bot.id, authenticate).await?, HandleOutcome::Handled);

        let replies = sink.delivered(&bot.id);
        assert!(replies.iter().any(|envelope| matches!(
            &envelope.event,
            ProtocolEvent::Authenticated(reply) if !reply.authenticated
        )));
        assert!(replies.iter().any(|envelope| matches!(
            &envelope.event,
            ProtocolEvent::Error(error) if error.message.contains("token directory unreachable")
        )));
        assert!(matches!(
            runtime.handle(&bot.id, announce(&bot, Vec::new(), None)).await?,
            HandleOutcome::Ignored { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn departed_module_context_is_released() -> Result<()> {
        let (runtime, _sink) = host(HostConfig::default());
        let brain = identity("brain", &[]);
        let bot = identity("telegram-bot", &[]);
        for module in [&brain, &bot] {
            runtime.open_session(module.id.clone(), None).await?;
            runtime.handle(&module.id, announce(module, Vec::new(), None)).await?;
        }
        for (module, text) in [(&brain, "thinking"), (&bot, "typing")] {
            let update = ContextUpdate::new("chat-1", ContextUpdateStrategy::AppendSelf, text);
            runtime
                .handle(&module.id, EventEnvelope::new(ProtocolEvent::ContextUpdate(update)))
                .await?;
        }
        let thread = ContextId::from("chat-1");
        assert_eq!(runtime.context_text(&thread), "thinking\ntyping");

        runtime.close_session(&bot.id, "gone").await?;
        assert_eq!(runtime.context_text(&thread), "thinking");
        Ok(())
    }

    #[tokio::test]
    async fn rejected_compatibility_closes_the_session() -> Result<()> {
        let (runtime, sink) = host(HostConfig::default());
        let mut membership = runtime.subscribe_membership();
        let bot = identity("telegram-bot", &[]);
        runtime.open_session(bot.id.clone(), None).await?;
        runtime.handle(&bot.id, announce(&bot, Vec::new(), None)).await?;

        let request = EventEnvelope::new(ProtocolEvent::CompatibilityRequest(CompatibilityRequest {
            protocol_version: "9.0".to_owned(),
            api_version: "9.0".to_owned(),
            supported_protocol_versions: Vec::new(),
            supported_api_versions: Vec::new(),
        }));
        assert!(matches!(
            runtime.handle(&bot.id, request).await?,
            HandleOutcome::Closed { .. }
        ));
        assert!(
            sink.event_types(&bot.id)
                .contains(&"module:compatibility:result".to_owned())
        );
        assert!(runtime.registry_snapshot().is_empty());

        let ping = Heartbeat::ping("still there?");
        let heartbeat = EventEnvelope::new(ProtocolEvent::Heartbeat(ping));
        assert!(matches!(
            runtime.handle(&bot.id, heartbeat).await?,
            HandleOutcome::Closed { .. }
        ));

        let mut left = false;
        while let Ok(change) = membership.try_recv() {
            left |= change == MembershipChange::Left { module: bot.id.clone() };
        }
        assert!(left);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_custom_events_are_refused_in_strict_mode() -> Result<()> {
        let config = HostConfig {
            strict_custom_events: true,
            ..HostConfig::default()
        };
        let (runtime, sink) = host(config);
        let mut schemas = EventSchemaTable::new();
        schemas.register("weather:report", &json!({"type": "object", "required": ["city"]}))?;
        let runtime = runtime.with_event_schemas(schemas);

        let bot = identity("telegram-bot", &[]);
        runtime.open_session(bot.id.clone(), None).await?;
        runtime.handle(&bot.id, announce(&bot, Vec::new(), None)).await?;

        let unknown = EventEnvelope::new(ProtocolEvent::custom("weather:forecast", Value::Null));
        assert!(matches!(
            runtime.handle(&bot.id, unknown).await?,
            HandleOutcome::Ignored { .. }
        ));
        assert_eq!(sink.event_types(&bot.id).last().map(String::as_str), Some("error"));

        let report = ProtocolEvent::custom("weather:report", json!({"city": "Oslo"}));
        let report = EventEnvelope::new(report);
        assert_eq!(
            runtime.handle(&bot.id, report).await?,
            HandleOutcome::Routed { recipients: Vec::new() }
        );
        Ok(())
    }
}
