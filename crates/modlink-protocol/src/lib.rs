//! # modlink-protocol — module orchestration contracts
//!
//! Shared types, the event catalogue and the boundary ports used by a host
//! that orchestrates independently deployed modules. Dependency-light (no
//! tokio runtime) so transports and modules can depend on it directly.
//!
//! ## Module Overview
//!
//! - [`ids`] — typed id wrappers (ModuleId, PluginId, CapabilityId, ConfigId, EventId, ContextId)
//! - [`identity`] — plugin/module identities, dependencies, capabilities, registry entries
//! - [`config`] — config schemas, envelopes, validation results, plans, progress states
//! - [`phase`] — module lifecycle phases and legal transitions
//! - [`route`] — route target expressions and routing directives
//! - [`spark`] — notify/command/emit payloads
//! - [`context`] — context update payloads
//! - [`event`] — EventEnvelope + ProtocolEvent (forward-compatible)
//! - [`ports`] — sink, token verifier and config store ports
//! - [`error`] — ProtocolError, ProtocolResult

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod identity;
pub mod ids;
pub mod phase;
pub mod ports;
pub mod route;
pub mod spark;

// Re-export the most commonly used types at the crate root.
pub use config::{
    ConfigIssue, ConfigPayload, ConfigTarget, MigrationStep, ModuleConfigEnvelope,
    ModuleConfigPlan, ModuleConfigSchema, ModuleConfigValidation, NegotiationStep,
    ProgressState, ValidationStatus, apply_merge_patch,
};
pub use context::{ContextUpdate, ContextUpdateStrategy};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{
    EventBaseMetadata, EventEnvelope, EventLineage, KNOWN_EVENT_TYPES, ProtocolEvent,
    TokenUsage, is_known_event_type,
};
pub use identity::{
    Labels, ModuleCapability, ModuleDependency, ModuleIdentity, ModuleKind, ModuleRegistryEntry,
    PluginIdentity, compare_versions,
};
pub use ids::{CapabilityId, ConfigId, ContextId, EventId, ModuleId, PluginId};
pub use phase::ModulePhase;
pub use ports::{
    AllowAllTokens, ConfigStorePort, EnvelopeStream, EventSink, SharedTokenVerifier,
    TokenVerifier,
};
pub use route::{RouteConfig, RouteDestination, RouteTargetExpression};
pub use spark::{
    SparkCommand, SparkEmit, SparkEmitState, SparkInterrupt, SparkNotify, SparkPriority,
    SparkUrgency,
};
