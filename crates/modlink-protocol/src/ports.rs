//! Boundary ports between the host runtime and its integrations.
//!
//! The runtime never talks to a transport directly: inbound envelopes are
//! handed to the host by a transport binding, and outbound envelopes leave
//! through an [`EventSink`]. Authentication and config persistence are
//! pluggable the same way.
//!
//! Traits use `async-trait` for dyn-dispatch.

use crate::config::{ConfigTarget, ModuleConfigEnvelope};
use crate::error::ProtocolResult;
use crate::event::EventEnvelope;
use crate::ids::ModuleId;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

pub type EnvelopeStream = BoxStream<'static, EventEnvelope>;

/// Outbound delivery to one connected module.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, recipient: &ModuleId, envelope: EventEnvelope) -> ProtocolResult<()>;
}

/// Checks `module:authenticate` tokens.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, module: &ModuleId, token: &str) -> ProtocolResult<bool>;
}

/// Accepts every token. The default when no verifier is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllTokens;

#[async_trait]
impl TokenVerifier for AllowAllTokens {
    async fn verify(&self, _module: &ModuleId, _token: &str) -> ProtocolResult<bool> {
        Ok(true)
    }
}

/// Accepts exactly one shared token.
#[derive(Debug, Clone)]
pub struct SharedTokenVerifier {
    token: String,
}

impl SharedTokenVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenVerifier for SharedTokenVerifier {
    async fn verify(&self, _module: &ModuleId, token: &str) -> ProtocolResult<bool> {
        Ok(!self.token.is_empty() && token == self.token)
    }
}

/// Persistence for committed configurations, consulted when a target
/// registers so a reconnecting module resumes from its last revision.
#[async_trait]
pub trait ConfigStorePort: Send + Sync {
    async fn load(&self, target: &ConfigTarget) -> ProtocolResult<Option<ModuleConfigEnvelope>>;
    async fn save(&self, target: &ConfigTarget, envelope: &ModuleConfigEnvelope)
    -> ProtocolResult<()>;
}
