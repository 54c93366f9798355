//! # modlink-runtime — the orchestrating host
//!
//! [`HostRuntime`] owns the module registry and drives every session through
//! compatibility, authentication, announcement, dependency resolution,
//! configuration negotiation and readiness. Non-control traffic is routed
//! between live modules with [`modlink_routing::resolve`].
//!
//! State lives behind one `parking_lot` mutex that is never held across an
//! `.await`: port calls (token verification, config persistence, delivery)
//! happen before or after the state transition they belong to.
//!
//! ## Module Overview
//!
//! - [`runtime`] — `HostRuntime`, the per-envelope dispatcher
//! - [`registry`] — sessions, announced modules, membership changes
//! - [`lifecycle`] — phase transitions, dependency roles, readiness gate
//! - [`capability`] — capability offers and activation
//! - [`negotiation`] — validate / plan / commit against stored revisions
//! - [`schema`] — JSON Schema compilation for configs and custom events
//! - [`compat`] — protocol/API version negotiation
//! - [`spark`] — notify/command/emit admission and receiver-side handling
//! - [`context`] — context update store
//! - [`dedupe`] — bounded recently-seen sets
//! - [`config`] — `HostConfig` (TOML)

pub mod capability;
pub mod compat;
pub mod config;
pub mod context;
pub mod dedupe;
pub mod lifecycle;
pub mod negotiation;
pub mod registry;
pub mod runtime;
pub mod schema;
pub mod spark;

pub use capability::{CapabilityRecord, CapabilitySet, OfferOutcome};
pub use config::HostConfig;
pub use context::{ContextApply, ContextEntry, ContextStore, ReplaceScope};
pub use dedupe::RecentSet;
pub use lifecycle::{DependencyReport, ModuleLifecycle, PhaseChange, ReadinessBlocker, RoleIndex};
pub use negotiation::{CommitRejection, NegotiationTable, StatusObservation};
pub use registry::{AnnouncedModule, MembershipChange, ModuleRegistry, ModuleSession, ROLE_LABEL};
pub use runtime::{HandleOutcome, HostRuntime};
pub use schema::{CompiledSchema, EventSchemaTable};
pub use spark::{
    Admission, EmitObservation, SparkAction, SparkEmitTracker, SparkReceiver, SparkRelay,
};
