//! The event catalogue: one variant per protocol event name.
//!
//! Events are adjacently tagged (`{"type": "module:announce", "data": {...}}`).
//! Known names decode strictly, so a malformed `module:announce` is an error
//! rather than a silently-accepted extension. Unknown names decode into
//! `Custom { event_type, data }` and are checked against the host's
//! registered schema table at the boundary.

use crate::config::{
    ConfigTarget, ModuleConfigEnvelope, ModuleConfigPlan, ModuleConfigSchema,
    ModuleConfigValidation, NegotiationStep, ProgressState,
};
use crate::context::ContextUpdate;
use crate::identity::{ModuleCapability, ModuleDependency, ModuleIdentity, ModuleRegistryEntry};
use crate::ids::{CapabilityId, EventId, ModuleId};
use crate::phase::ModulePhase;
use crate::route::{RouteConfig, RouteDestination};
use crate::spark::{SparkCommand, SparkEmit, SparkNotify};
use serde::de::Error as _;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use chrono::Utc;
use serde_json::Value;

// ─── Envelope ──────────────────────────────────────────────────────

/// Causality link for tracing. `parent_id` points at the request a reply
/// answers and must be preserved across request/response pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLineage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EventId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBaseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ModuleIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventLineage>,
}

/// An event plus its tracing metadata and optional routing directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event: ProtocolEvent,
    #[serde(default)]
    pub metadata: EventBaseMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteConfig>,
}

impl EventEnvelope {
    /// Wrap an event with a freshly minted event id.
    pub fn new(event: ProtocolEvent) -> Self {
        Self {
            event,
            metadata: EventBaseMetadata {
                source: None,
                event: Some(EventLineage {
                    id: Some(EventId::default()),
                    parent_id: None,
                }),
            },
            route: None,
        }
    }

    /// Build a reply whose `parent_id` is this envelope's id.
    pub fn reply(&self, event: ProtocolEvent) -> Self {
        let mut reply = Self::new(event);
        if let Some(lineage) = reply.metadata.event.as_mut() {
            lineage.parent_id = self.id().cloned();
        }
        reply
    }

    pub fn with_source(mut self, source: ModuleIdentity) -> Self {
        self.metadata.source = Some(source);
        self
    }

    pub fn with_route(mut self, route: RouteConfig) -> Self {
        self.route = Some(route);
        self
    }

    pub fn id(&self) -> Option<&EventId> {
        self.metadata.event.as_ref().and_then(|e| e.id.as_ref())
    }

    pub fn parent_id(&self) -> Option<&EventId> {
        self.metadata
            .event
            .as_ref()
            .and_then(|e| e.parent_id.as_ref())
    }

    pub fn event_type(&self) -> &str {
        self.event.event_type()
    }

    /// Destinations from the routing directive, falling back to the ones
    /// embedded in spark/context payloads.
    pub fn destinations(&self) -> Option<&[RouteDestination]> {
        self.route
            .as_ref()
            .and_then(|route| route.destinations.as_deref())
            .or_else(|| self.event.embedded_destinations())
    }

    pub fn bypasses_routing(&self) -> bool {
        self.route.as_ref().is_some_and(|route| route.bypass)
    }
}

// ─── Payloads ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authenticate {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authenticated {
    pub authenticated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityRequest {
    pub protocol_version: String,
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_protocol_versions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_api_versions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompatibilityMode {
    Exact,
    Downgraded,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityResult {
    pub protocol_version: String,
    pub api_version: String,
    pub mode: CompatibilityMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySync {
    pub modules: Vec<ModuleRegistryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleAnnounce {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    pub identity: ModuleIdentity,
    #[serde(default)]
    pub possible_events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<ModuleConfigSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ModuleDependency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModulePrepared {
    pub identity: ModuleIdentity,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_dependencies: Vec<ModuleDependency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationNeeded {
    pub identity: ModuleIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<ModuleConfigSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<ModuleConfigEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValidateRequest {
    pub identity: ModuleIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<ModuleConfigEnvelope>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValidateResponse {
    pub identity: ModuleIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    pub validation: ModuleConfigValidation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ModuleConfigPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPlanRequest {
    pub identity: ModuleIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ModuleConfigPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<ModuleConfigEnvelope>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPlanResponse {
    pub identity: ModuleIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    pub plan: ModuleConfigPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigCommitRequest {
    pub identity: ModuleIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    pub config: ModuleConfigEnvelope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigCommitResponse {
    pub identity: ModuleIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    pub accepted: bool,
    /// Revision after the commit, or the responder's current revision when
    /// rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ModuleConfigValidation>,
}

/// One entry of a `:status` progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigStepStatus {
    pub identity: ModuleIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    pub state: ProgressState,
    /// Monotonic per `(identity, capabilityId)` stream when the sender
    /// provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigConfigured {
    pub identity: ModuleIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    pub config: ModuleConfigEnvelope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityOffer {
    pub identity: ModuleIdentity,
    pub capability: ModuleCapability,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityActivated {
    pub identity: ModuleIdentity,
    pub capability_id: CapabilityId,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload of both `module:status` (authoritative, host→module) and
/// `module:status:change` (request, module→host).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    pub identity: ModuleIdentity,
    pub phase: ModulePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfigure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ModuleIdentity>,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputText {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_updates: Vec<ContextUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputTextVoice {
    pub transcription: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_updates: Vec<ContextUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputVoice {
    /// Base64 audio; the encoding of the carrier is the transport's business.
    pub audio: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_updates: Vec<ContextUpdate>,
}

/// Token usage reported by LLM providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Shared payload of the `output:gen-ai:chat:*` family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputChat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Tags naming the input(s) this output answers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakText {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeartbeatKind {
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub kind: HeartbeatKind,
    #[serde(default)]
    pub message: String,
    /// Milliseconds since UNIX epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<i64>,
}

impl Heartbeat {
    pub fn ping(message: impl Into<String>) -> Self {
        Self {
            kind: HeartbeatKind::Ping,
            message: message.into(),
            at: Some(Utc::now().timestamp_millis()),
        }
    }

    /// The pong answering this heartbeat; the message is echoed back.
    pub fn pong(&self) -> Self {
        Self {
            kind: HeartbeatKind::Pong,
            message: self.message.clone(),
            at: Some(Utc::now().timestamp_millis()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRaised {
    pub message: String,
}

// ─── Catalogue ─────────────────────────────────────────────────────

/// Every event name the protocol defines, plus `Custom` for host-registered
/// extensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(remote = "Self", tag = "type", content = "data")]
#[non_exhaustive]
pub enum ProtocolEvent {
    // ── Session handshake ──
    #[serde(rename = "module:authenticate")]
    Authenticate(Authenticate),
    #[serde(rename = "module:authenticated")]
    Authenticated(Authenticated),
    #[serde(rename = "module:compatibility:request")]
    CompatibilityRequest(CompatibilityRequest),
    #[serde(rename = "module:compatibility:result")]
    CompatibilityResult(CompatibilityResult),
    #[serde(rename = "registry:modules:sync")]
    RegistrySync(RegistrySync),

    // ── Lifecycle ──
    #[serde(rename = "module:announce")]
    Announce(ModuleAnnounce),
    #[serde(rename = "module:prepared")]
    Prepared(ModulePrepared),
    #[serde(rename = "module:status")]
    Status(ModuleStatus),
    #[serde(rename = "module:status:change")]
    StatusChange(ModuleStatus),

    // ── Module-level configuration ──
    #[serde(rename = "module:configuration:needed")]
    ConfigurationNeeded(ConfigurationNeeded),
    #[serde(rename = "module:configuration:validate:request")]
    ConfigValidateRequest(ConfigValidateRequest),
    #[serde(rename = "module:configuration:validate:response")]
    ConfigValidateResponse(ConfigValidateResponse),
    #[serde(rename = "module:configuration:validate:status")]
    ConfigValidateStatus(ConfigStepStatus),
    #[serde(rename = "module:configuration:plan:request")]
    ConfigPlanRequest(ConfigPlanRequest),
    #[serde(rename = "module:configuration:plan:response")]
    ConfigPlanResponse(ConfigPlanResponse),
    #[serde(rename = "module:configuration:plan:status")]
    ConfigPlanStatus(ConfigStepStatus),
    #[serde(rename = "module:configuration:commit:request")]
    ConfigCommitRequest(ConfigCommitRequest),
    #[serde(rename = "module:configuration:commit:response")]
    ConfigCommitResponse(ConfigCommitResponse),
    #[serde(rename = "module:configuration:commit:status")]
    ConfigCommitStatus(ConfigStepStatus),
    #[serde(rename = "module:configuration:configured")]
    ConfigConfigured(ConfigConfigured),

    // ── Capability contribution ──
    #[serde(rename = "module:contribute:capability:offer")]
    CapabilityOffer(CapabilityOffer),
    #[serde(rename = "module:contribute:capability:configuration:needed")]
    CapabilityConfigurationNeeded(ConfigurationNeeded),
    #[serde(rename = "module:contribute:capability:configuration:validate:request")]
    CapabilityConfigValidateRequest(ConfigValidateRequest),
    #[serde(rename = "module:contribute:capability:configuration:validate:response")]
    CapabilityConfigValidateResponse(ConfigValidateResponse),
    #[serde(rename = "module:contribute:capability:configuration:validate:status")]
    CapabilityConfigValidateStatus(ConfigStepStatus),
    #[serde(rename = "module:contribute:capability:configuration:plan:request")]
    CapabilityConfigPlanRequest(ConfigPlanRequest),
    #[serde(rename = "module:contribute:capability:configuration:plan:response")]
    CapabilityConfigPlanResponse(ConfigPlanResponse),
    #[serde(rename = "module:contribute:capability:configuration:plan:status")]
    CapabilityConfigPlanStatus(ConfigStepStatus),
    #[serde(rename = "module:contribute:capability:configuration:commit:request")]
    CapabilityConfigCommitRequest(ConfigCommitRequest),
    #[serde(rename = "module:contribute:capability:configuration:commit:response")]
    CapabilityConfigCommitResponse(ConfigCommitResponse),
    #[serde(rename = "module:contribute:capability:configuration:commit:status")]
    CapabilityConfigCommitStatus(ConfigStepStatus),
    #[serde(rename = "module:contribute:capability:configuration:configured")]
    CapabilityConfigConfigured(ConfigConfigured),
    #[serde(rename = "module:contribute:capability:activated")]
    CapabilityActivated(CapabilityActivated),

    // ── Host-pushed configuration ──
    #[serde(rename = "module:configure")]
    Configure(ModuleConfigure),
    #[serde(rename = "ui:configure")]
    UiConfigure(ModuleConfigure),

    // ── Peer traffic ──
    #[serde(rename = "input:text")]
    InputText(InputText),
    #[serde(rename = "input:text:voice")]
    InputTextVoice(InputTextVoice),
    #[serde(rename = "input:voice")]
    InputVoice(InputVoice),
    #[serde(rename = "output:gen-ai:chat:tool-call")]
    OutputToolCall(OutputChat),
    #[serde(rename = "output:gen-ai:chat:message")]
    OutputMessage(OutputChat),
    #[serde(rename = "output:gen-ai:chat:complete")]
    OutputComplete(OutputChat),
    #[serde(rename = "spark:notify")]
    SparkNotify(SparkNotify),
    #[serde(rename = "spark:command")]
    SparkCommand(SparkCommand),
    #[serde(rename = "spark:emit")]
    SparkEmit(SparkEmit),
    #[serde(rename = "speak:text")]
    SpeakText(SpeakText),
    #[serde(rename = "context:update")]
    ContextUpdate(ContextUpdate),

    // ── Transport & fallback ──
    #[serde(rename = "transport:connection:heartbeat")]
    Heartbeat(Heartbeat),
    #[serde(rename = "error")]
    Error(ErrorRaised),

    // ── Host-defined extension ──
    #[serde(skip)]
    Custom { event_type: String, data: Value },
}

/// Every event name with a dedicated variant.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "module:authenticate",
    "module:authenticated",
    "module:compatibility:request",
    "module:compatibility:result",
    "registry:modules:sync",
    "module:announce",
    "module:prepared",
    "module:status",
    "module:status:change",
    "module:configuration:needed",
    "module:configuration:validate:request",
    "module:configuration:validate:response",
    "module:configuration:validate:status",
    "module:configuration:plan:request",
    "module:configuration:plan:response",
    "module:configuration:plan:status",
    "module:configuration:commit:request",
    "module:configuration:commit:response",
    "module:configuration:commit:status",
    "module:configuration:configured",
    "module:contribute:capability:offer",
    "module:contribute:capability:configuration:needed",
    "module:contribute:capability:configuration:validate:request",
    "module:contribute:capability:configuration:validate:response",
    "module:contribute:capability:configuration:validate:status",
    "module:contribute:capability:configuration:plan:request",
    "module:contribute:capability:configuration:plan:response",
    "module:contribute:capability:configuration:plan:status",
    "module:contribute:capability:configuration:commit:request",
    "module:contribute:capability:configuration:commit:response",
    "module:contribute:capability:configuration:commit:status",
    "module:contribute:capability:configuration:configured",
    "module:contribute:capability:activated",
    "module:configure",
    "ui:configure",
    "input:text",
    "input:text:voice",
    "input:voice",
    "output:gen-ai:chat:tool-call",
    "output:gen-ai:chat:message",
    "output:gen-ai:chat:complete",
    "spark:notify",
    "spark:command",
    "spark:emit",
    "speak:text",
    "context:update",
    "transport:connection:heartbeat",
    "error",
];

pub fn is_known_event_type(event_type: &str) -> bool {
    KNOWN_EVENT_TYPES.contains(&event_type)
}

impl ProtocolEvent {
    pub fn custom(event_type: impl Into<String>, data: Value) -> Self {
        Self::Custom {
            event_type: event_type.into(),
            data,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            Self::Authenticate(_) => "module:authenticate",
            Self::Authenticated(_) => "module:authenticated",
            Self::CompatibilityRequest(_) => "module:compatibility:request",
            Self::CompatibilityResult(_) => "module:compatibility:result",
            Self::RegistrySync(_) => "registry:modules:sync",
            Self::Announce(_) => "module:announce",
            Self::Prepared(_) => "module:prepared",
            Self::Status(_) => "module:status",
            Self::StatusChange(_) => "module:status:change",
            Self::ConfigurationNeeded(_) => "module:configuration:needed",
            Self::ConfigValidateRequest(_) => "module:configuration:validate:request",
            Self::ConfigValidateResponse(_) => "module:configuration:validate:response",
            Self::ConfigValidateStatus(_) => "module:configuration:validate:status",
            Self::ConfigPlanRequest(_) => "module:configuration:plan:request",
            Self::ConfigPlanResponse(_) => "module:configuration:plan:response",
            Self::ConfigPlanStatus(_) => "module:configuration:plan:status",
            Self::ConfigCommitRequest(_) => "module:configuration:commit:request",
            Self::ConfigCommitResponse(_) => "module:configuration:commit:response",
            Self::ConfigCommitStatus(_) => "module:configuration:commit:status",
            Self::ConfigConfigured(_) => "module:configuration:configured",
            Self::CapabilityOffer(_) => "module:contribute:capability:offer",
            Self::CapabilityConfigurationNeeded(_) => {
                "module:contribute:capability:configuration:needed"
            }
            Self::CapabilityConfigValidateRequest(_) => {
                "module:contribute:capability:configuration:validate:request"
            }
            Self::CapabilityConfigValidateResponse(_) => {
                "module:contribute:capability:configuration:validate:response"
            }
            Self::CapabilityConfigValidateStatus(_) => {
                "module:contribute:capability:configuration:validate:status"
            }
            Self::CapabilityConfigPlanRequest(_) => {
                "module:contribute:capability:configuration:plan:request"
            }
            Self::CapabilityConfigPlanResponse(_) => {
                "module:contribute:capability:configuration:plan:response"
            }
            Self::CapabilityConfigPlanStatus(_) => {
                "module:contribute:capability:configuration:plan:status"
            }
            Self::CapabilityConfigCommitRequest(_) => {
                "module:contribute:capability:configuration:commit:request"
            }
            Self::CapabilityConfigCommitResponse(_) => {
                "module:contribute:capability:configuration:commit:response"
            }
            Self::CapabilityConfigCommitStatus(_) => {
                "module:contribute:capability:configuration:commit:status"
            }
            Self::CapabilityConfigConfigured(_) => {
                "module:contribute:capability:configuration:configured"
            }
            Self::CapabilityActivated(_) => "module:contribute:capability:activated",
            Self::Configure(_) => "module:configure",
            Self::UiConfigure(_) => "ui:configure",
            Self::InputText(_) => "input:text",
            Self::InputTextVoice(_) => "input:text:voice",
            Self::InputVoice(_) => "input:voice",
            Self::OutputToolCall(_) => "output:gen-ai:chat:tool-call",
            Self::OutputMessage(_) => "output:gen-ai:chat:message",
            Self::OutputComplete(_) => "output:gen-ai:chat:complete",
            Self::SparkNotify(_) => "spark:notify",
            Self::SparkCommand(_) => "spark:command",
            Self::SparkEmit(_) => "spark:emit",
            Self::SpeakText(_) => "speak:text",
            Self::ContextUpdate(_) => "context:update",
            Self::Heartbeat(_) => "transport:connection:heartbeat",
            Self::Error(_) => "error",
            Self::Custom { event_type, .. } => event_type,
        }
    }

    /// The module an identity-bearing event is inherently addressed to.
    pub fn inherent_target(&self) -> Option<&ModuleId> {
        let identity = match self {
            Self::Prepared(p) => &p.identity,
            Self::Status(s) | Self::StatusChange(s) => &s.identity,
            Self::ConfigurationNeeded(p) | Self::CapabilityConfigurationNeeded(p) => &p.identity,
            Self::ConfigValidateResponse(p) | Self::CapabilityConfigValidateResponse(p) => {
                &p.identity
            }
            Self::ConfigPlanResponse(p) | Self::CapabilityConfigPlanResponse(p) => &p.identity,
            Self::ConfigCommitResponse(p) | Self::CapabilityConfigCommitResponse(p) => {
                &p.identity
            }
            Self::ConfigConfigured(p) | Self::CapabilityConfigConfigured(p) => &p.identity,
            Self::Configure(p) | Self::UiConfigure(p) => p.identity.as_ref()?,
            _ => return None,
        };
        Some(&identity.id)
    }

    /// Destinations carried inside spark/context payloads.
    pub fn embedded_destinations(&self) -> Option<&[RouteDestination]> {
        match self {
            Self::SparkNotify(notify) => notify.destinations.as_deref(),
            Self::SparkCommand(command) => command.destinations.as_deref(),
            Self::ContextUpdate(update) => update.destinations.as_deref(),
            _ => None,
        }
    }

    /// Classify a configuration sub-protocol event: which step it belongs
    /// to and which target (module or capability) it addresses.
    #[rustfmt::skip]
    pub fn negotiation(&self) -> Option<Negotiation<'_>> {
        use NegotiationMessage as M;
        let (level, step, message) = match self {
            Self::ConfigValidateRequest(p) => (Level::Module, NegotiationStep::Validate, M::ValidateRequest(p)),
            Self::CapabilityConfigValidateRequest(p) => (Level::Capability, NegotiationStep::Validate, M::ValidateRequest(p)),
            Self::ConfigValidateResponse(p) => (Level::Module, NegotiationStep::Validate, M::ValidateResponse(p)),
            Self::CapabilityConfigValidateResponse(p) => (Level::Capability, NegotiationStep::Validate, M::ValidateResponse(p)),
            Self::ConfigValidateStatus(p) => (Level::Module, NegotiationStep::Validate, M::Status(p)),
            Self::CapabilityConfigValidateStatus(p) => (Level::Capability, NegotiationStep::Validate, M::Status(p)),
            Self::ConfigPlanRequest(p) => (Level::Module, NegotiationStep::Plan, M::PlanRequest(p)),
            Self::CapabilityConfigPlanRequest(p) => (Level::Capability, NegotiationStep::Plan, M::PlanRequest(p)),
            Self::ConfigPlanResponse(p) => (Level::Module, NegotiationStep::Plan, M::PlanResponse(p)),
            Self::CapabilityConfigPlanResponse(p) => (Level::Capability, NegotiationStep::Plan, M::PlanResponse(p)),
            Self::ConfigPlanStatus(p) => (Level::Module, NegotiationStep::Plan, M::Status(p)),
            Self::CapabilityConfigPlanStatus(p) => (Level::Capability, NegotiationStep::Plan, M::Status(p)),
            Self::ConfigCommitRequest(p) => (Level::Module, NegotiationStep::Commit, M::CommitRequest(p)),
            Self::CapabilityConfigCommitRequest(p) => (Level::Capability, NegotiationStep::Commit, M::CommitRequest(p)),
            Self::ConfigCommitResponse(p) => (Level::Module, NegotiationStep::Commit, M::CommitResponse(p)),
            Self::CapabilityConfigCommitResponse(p) => (Level::Capability, NegotiationStep::Commit, M::CommitResponse(p)),
            Self::ConfigCommitStatus(p) => (Level::Module, NegotiationStep::Commit, M::Status(p)),
            Self::CapabilityConfigCommitStatus(p) => (Level::Capability, NegotiationStep::Commit, M::Status(p)),
            Self::ConfigConfigured(p) => (Level::Module, NegotiationStep::Commit, M::Configured(p)),
            Self::CapabilityConfigConfigured(p) => (Level::Capability, NegotiationStep::Commit, M::Configured(p)),
            _ => return None,
        };
        Some(Negotiation {
            level,
            step,
            message,
        })
    }
}

/// Whether a negotiation event belongs to the module- or capability-level
/// family. Used to check that `capabilityId` is present exactly when the
/// event name says it should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Module,
    Capability,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NegotiationMessage<'a> {
    ValidateRequest(&'a ConfigValidateRequest),
    ValidateResponse(&'a ConfigValidateResponse),
    PlanRequest(&'a ConfigPlanRequest),
    PlanResponse(&'a ConfigPlanResponse),
    CommitRequest(&'a ConfigCommitRequest),
    CommitResponse(&'a ConfigCommitResponse),
    Status(&'a ConfigStepStatus),
    Configured(&'a ConfigConfigured),
}

/// A classified negotiation event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Negotiation<'a> {
    pub level: Level,
    pub step: NegotiationStep,
    pub message: NegotiationMessage<'a>,
}

impl Negotiation<'_> {
    pub fn identity(&self) -> &ModuleIdentity {
        match self.message {
            NegotiationMessage::ValidateRequest(p) => &p.identity,
            NegotiationMessage::ValidateResponse(p) => &p.identity,
            NegotiationMessage::PlanRequest(p) => &p.identity,
            NegotiationMessage::PlanResponse(p) => &p.identity,
            NegotiationMessage::CommitRequest(p) => &p.identity,
            NegotiationMessage::CommitResponse(p) => &p.identity,
            NegotiationMessage::Status(p) => &p.identity,
            NegotiationMessage::Configured(p) => &p.identity,
        }
    }

    pub fn capability_id(&self) -> Option<&CapabilityId> {
        match self.message {
            NegotiationMessage::ValidateRequest(p) => p.capability_id.as_ref(),
            NegotiationMessage::ValidateResponse(p) => p.capability_id.as_ref(),
            NegotiationMessage::PlanRequest(p) => p.capability_id.as_ref(),
            NegotiationMessage::PlanResponse(p) => p.capability_id.as_ref(),
            NegotiationMessage::CommitRequest(p) => p.capability_id.as_ref(),
            NegotiationMessage::CommitResponse(p) => p.capability_id.as_ref(),
            NegotiationMessage::Status(p) => p.capability_id.as_ref(),
            NegotiationMessage::Configured(p) => p.capability_id.as_ref(),
        }
    }

    /// The addressed target, or `None` when `capabilityId` disagrees with
    /// the event family.
    pub fn target(&self) -> Option<ConfigTarget> {
        let module = self.identity().id.clone();
        match (self.level, self.capability_id()) {
            (Level::Module, None) => Some(ConfigTarget::module(module)),
            (Level::Capability, Some(capability)) => {
                Some(ConfigTarget::capability(module, capability.clone()))
            }
            _ => None,
        }
    }
}

// ─── Boundary (de)serialization ────────────────────────────────────

impl Serialize for ProtocolEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Custom { event_type, data } => {
                let mut state = serializer.serialize_struct("ProtocolEvent", 2)?;
                state.serialize_field("type", event_type)?;
                state.serialize_field("data", data)?;
                state.end()
            }
            known => ProtocolEvent::serialize(known, serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ProtocolEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let event_type = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| D::Error::custom("event is missing a string `type` tag"))?
            .to_owned();

        if is_known_event_type(&event_type) {
            return ProtocolEvent::deserialize(raw).map_err(D::Error::custom);
        }

        let data = raw.get("data").cloned().unwrap_or(Value::Null);
        Ok(Self::Custom { event_type, data })
    }
}
