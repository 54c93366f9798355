//! Host configuration, loaded from TOML.

use std::path::Path;

use anyhow::{Context, Result};
use modlink_routing::EmptyDestinations;
use serde::{Deserialize, Serialize};

use crate::context::ReplaceScope;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub protocol_version: String,
    pub api_version: String,
    /// Versions the host can fall back to, in addition to the current ones.
    pub supported_protocol_versions: Vec<String>,
    pub supported_api_versions: Vec<String>,
    /// Answer every non-handshake event from an unauthenticated session
    /// with `error`.
    pub require_authentication: bool,
    /// Promote to `ready` as soon as the readiness gate passes instead of
    /// waiting for a `module:status:change` request.
    pub auto_ready: bool,
    /// Emit `:status` progress events around host-side negotiation steps.
    pub emit_progress: bool,
    pub empty_destinations: EmptyDestinations,
    pub context_replace_scope: ReplaceScope,
    /// Capacity of every recently-seen set (spark pairs, context ids).
    pub dedupe_capacity: usize,
    /// Reject custom events that have no registered schema.
    pub strict_custom_events: bool,
    /// Buffer of the delivery and membership broadcast channels.
    pub stream_buffer: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            protocol_version: "1.0".to_owned(),
            api_version: "1.0".to_owned(),
            supported_protocol_versions: vec!["1.0".to_owned()],
            supported_api_versions: vec!["1.0".to_owned()],
            require_authentication: false,
            auto_ready: false,
            emit_progress: true,
            empty_destinations: EmptyDestinations::Broadcast,
            context_replace_scope: ReplaceScope::Lane,
            dedupe_capacity: 1024,
            strict_custom_events: false,
            stream_buffer: 256,
        }
    }
}

impl HostConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed parsing host config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading host config {path:?}"))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid host config {path:?}"))
    }

    /// Every protocol version the host accepts, current first.
    pub fn protocol_versions(&self) -> Vec<&str> {
        with_current(&self.protocol_version, &self.supported_protocol_versions)
    }

    pub fn api_versions(&self) -> Vec<&str> {
        with_current(&self.api_version, &self.supported_api_versions)
    }
}

fn with_current<'a>(current: &'a str, supported: &'a [String]) -> Vec<&'a str> {
    let mut versions = vec![current];
    versions.extend(
        supported
            .iter()
            .map(String::as_str)
            .filter(|version| *version != current),
    );
    versions
}
