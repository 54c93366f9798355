//! # modlink-host — assembled host
//!
//! [`HostBuilder`] wires a [`HostRuntime`] to an event sink, an optional
//! delivery log, a token verifier, a config store and the custom event
//! schema table. [`ModuleHost`] is the surface transports talk to: one
//! session per connected module, one `handle` call per inbound envelope.

mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::stream::BoxStream;
use modlink_events::{Delivery, DeliveryLog, EventJournal, EventStreamHub, FileDeliveryLog};
use modlink_protocol::{
    ConfigStorePort, ConfigTarget, ContextId, EventEnvelope, EventSink, ModuleConfigEnvelope,
    ModuleId, ModulePhase, TokenVerifier,
};
use modlink_routing::RegistrySnapshot;
use modlink_runtime::{
    CapabilityRecord, EventSchemaTable, HandleOutcome, HostConfig, HostRuntime, MembershipChange,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, instrument};

pub use store::FileConfigStore;

#[derive(Clone, Default)]
pub struct HostBuilder {
    config: HostConfig,
    token_verifier: Option<Arc<dyn TokenVerifier>>,
    config_store: Option<Arc<dyn ConfigStorePort>>,
    event_schemas: Vec<(String, Value)>,
    sink: Option<Arc<dyn EventSink>>,
    delivery_log: Option<PathBuf>,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    pub fn token_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.token_verifier = Some(verifier);
        self
    }

    pub fn config_store(mut self, store: Arc<dyn ConfigStorePort>) -> Self {
        self.config_store = Some(store);
        self
    }

    /// Register a JSON Schema for a custom (non-catalogue) event type.
    pub fn event_schema(mut self, event_type: impl Into<String>, schema: Value) -> Self {
        self.event_schemas.push((event_type.into(), schema));
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Append every delivery to `<root>/deliveries.jsonl`.
    pub fn delivery_log(mut self, root: impl Into<PathBuf>) -> Self {
        self.delivery_log = Some(root.into());
        self
    }

    pub fn build(self) -> Result<ModuleHost> {
        let sink = self.sink.context("host needs an event sink")?;

        let mut schemas = EventSchemaTable::new();
        for (event_type, schema) in &self.event_schemas {
            schemas
                .register(event_type.clone(), schema)
                .with_context(|| format!("invalid schema for custom event {event_type}"))?;
        }

        let stream = EventStreamHub::new(self.config.stream_buffer);
        let mut journal = EventJournal::new(sink, stream);
        let log = self
            .delivery_log
            .map(|root| Arc::new(FileDeliveryLog::new(root)));
        if let Some(log) = &log {
            journal = journal.with_log(log.clone());
        }

        let mut runtime = HostRuntime::new(self.config, journal).with_event_schemas(schemas);
        if let Some(verifier) = self.token_verifier {
            runtime = runtime.with_token_verifier(verifier);
        }
        if let Some(store) = self.config_store {
            runtime = runtime.with_config_store(store);
        }
        info!(
            custom_events = self.event_schemas.len(),
            delivery_log = log.is_some(),
            "module host assembled"
        );

        Ok(ModuleHost { runtime, log })
    }
}

#[derive(Clone)]
pub struct ModuleHost {
    runtime: HostRuntime,
    log: Option<Arc<FileDeliveryLog>>,
}

impl ModuleHost {
    #[instrument(skip(self, source), fields(module_id = %module))]
    pub async fn open_session(&self, module: ModuleId, source: Option<String>) -> Result<()> {
        self.runtime.open_session(module, source).await
    }

    #[instrument(skip(self, reason), fields(module_id = %module))]
    pub async fn close_session(&self, module: &ModuleId, reason: &str) -> Result<bool> {
        self.runtime.close_session(module, reason).await
    }

    pub async fn handle(
        &self,
        module: &ModuleId,
        envelope: EventEnvelope,
    ) -> Result<HandleOutcome> {
        self.runtime.handle(module, envelope).await
    }

    pub fn phase_of(&self, module: &ModuleId) -> Option<ModulePhase> {
        self.runtime.phase_of(module)
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        self.runtime.registry_snapshot()
    }

    pub fn stored_config(&self, target: &ConfigTarget) -> Option<ModuleConfigEnvelope> {
        self.runtime.stored_config(target)
    }

    pub fn capability(&self, module: &ModuleId, capability: &str) -> Option<CapabilityRecord> {
        self.runtime.capability(module, capability)
    }

    pub fn context_text(&self, context_id: &ContextId) -> String {
        self.runtime.context_text(context_id)
    }

    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<Delivery> {
        self.runtime.subscribe_deliveries()
    }

    /// Deliveries addressed to one module, as a stream.
    pub fn delivery_stream(&self, recipient: ModuleId) -> BoxStream<'static, Delivery> {
        self.runtime.journal().stream().recipient_stream(recipient)
    }

    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipChange> {
        self.runtime.subscribe_membership()
    }

    /// Replay from the delivery log. Empty when no log is configured.
    #[instrument(skip(self))]
    pub async fn read_deliveries(&self, from_sequence: u64, limit: usize) -> Result<Vec<Delivery>> {
        match &self.log {
            Some(log) => log.read_from(from_sequence, limit).await,
            None => Ok(Vec::new()),
        }
    }

    pub fn config(&self) -> &HostConfig {
        self.runtime.config()
    }
}
