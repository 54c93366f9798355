//! Configuration negotiation data: schemas, revisioned envelopes, and the
//! derived validation/plan results exchanged by validate → plan → commit.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{CapabilityId, ConfigId, ModuleId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Versioned schema descriptor. `version` increases monotonically per `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfigSchema {
    pub id: String,
    pub version: u32,
    /// JSON Schema document the config must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl ModuleConfigSchema {
    pub fn new(id: impl Into<String>, version: u32, schema: Option<Value>) -> Self {
        Self {
            id: id.into(),
            version,
            schema,
        }
    }
}

/// A revision-tracked configuration payload.
///
/// Exactly one of `full`/`patch` is operative. A patch must name the
/// `base_revision` it was computed against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfigEnvelope {
    pub config_id: ConfigId,
    pub revision: u64,
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_revision: Option<u64>,
}

/// The operative payload of an envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigPayload<'a> {
    Full {
        config: &'a Value,
        base_revision: Option<u64>,
    },
    Patch {
        patch: &'a Value,
        base_revision: u64,
    },
}

impl ModuleConfigEnvelope {
    pub fn full(
        config_id: impl Into<ConfigId>,
        revision: u64,
        schema_version: u32,
        config: Value,
    ) -> Self {
        Self {
            config_id: config_id.into(),
            revision,
            schema_version,
            source: None,
            full: Some(config),
            patch: None,
            base_revision: None,
        }
    }

    pub fn patch(
        config_id: impl Into<ConfigId>,
        base_revision: u64,
        schema_version: u32,
        patch: Value,
    ) -> Self {
        Self {
            config_id: config_id.into(),
            revision: base_revision,
            schema_version,
            source: None,
            full: None,
            patch: Some(patch),
            base_revision: Some(base_revision),
        }
    }

    /// Check the envelope's shape and return its operative payload.
    pub fn payload(&self) -> ProtocolResult<ConfigPayload<'_>> {
        match (&self.full, &self.patch) {
            (Some(config), None) => Ok(ConfigPayload::Full {
                config,
                base_revision: self.base_revision,
            }),
            (None, Some(patch)) => {
                let base_revision = self.base_revision.ok_or_else(|| {
                    ProtocolError::MalformedEnvelope(format!(
                        "patch for {} has no baseRevision",
                        self.config_id
                    ))
                })?;
                Ok(ConfigPayload::Patch {
                    patch,
                    base_revision,
                })
            }
            (Some(_), Some(_)) => Err(ProtocolError::MalformedEnvelope(format!(
                "envelope {} carries both full and patch",
                self.config_id
            ))),
            (None, None) => Err(ProtocolError::MalformedEnvelope(format!(
                "envelope {} carries neither full nor patch",
                self.config_id
            ))),
        }
    }
}

/// Apply an RFC 7396 JSON merge patch in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                apply_merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Validation outcome, ordered by remaining work: `Valid < Partial < Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationStatus {
    /// Complete and structurally correct.
    Valid,
    /// Structurally fine but incomplete (missing fields, outdated schema).
    Partial,
    /// Structurally wrong.
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigIssue {
    /// JSON pointer into the config (`""` is the root).
    pub path: String,
    pub reason: String,
}

impl ConfigIssue {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfigValidation {
    pub status: ValidationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ConfigIssue>,
}

impl ModuleConfigValidation {
    pub fn valid() -> Self {
        Self {
            status: ValidationStatus::Valid,
            issues: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStep {
    pub from: u32,
    pub to: u32,
}

/// Authoritative list of what must change for a config to become valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfigPlan {
    pub schema_id: String,
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid: Vec<ConfigIssue>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub defaults: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deprecated: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub migrations: Vec<MigrationStep>,
}

impl ModuleConfigPlan {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty() && self.migrations.is_empty()
    }
}

/// Progress of one negotiation step as reported on a `:status` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressState {
    Queued,
    Working,
    Done,
    Failed,
}

impl ProgressState {
    pub fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Working => 1,
            Self::Done | Self::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

/// The three negotiation steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationStep {
    Validate,
    Plan,
    Commit,
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validate => "validate",
            Self::Plan => "plan",
            Self::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// What a negotiation round is addressed at: the module itself or one of
/// its capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigTarget {
    pub module: ModuleId,
    pub capability: Option<CapabilityId>,
}

impl ConfigTarget {
    pub fn module(module: ModuleId) -> Self {
        Self {
            module,
            capability: None,
        }
    }

    pub fn capability(module: ModuleId, capability: CapabilityId) -> Self {
        Self {
            module,
            capability: Some(capability),
        }
    }

    pub fn is_capability(&self) -> bool {
        self.capability.is_some()
    }
}

impl fmt::Display for ConfigTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.capability {
            Some(capability) => write!(f, "{}/{}", self.module, capability),
            None => write!(f, "{}", self.module),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_requires_exactly_one_payload() {
        let mut envelope = ModuleConfigEnvelope::full("cfg", 1, 1, json!({"a": 1}));
        assert!(matches!(
            envelope.payload(),
            Ok(ConfigPayload::Full { .. })
        ));

        envelope.patch = Some(json!({"b": 2}));
        assert!(matches!(
            envelope.payload(),
            Err(ProtocolError::MalformedEnvelope(_))
        ));

        envelope.full = None;
        envelope.patch = None;
        assert!(envelope.payload().is_err());
    }

    #[test]
    fn patch_without_base_revision_is_malformed() {
        let mut envelope = ModuleConfigEnvelope::patch("cfg", 3, 1, json!({"a": 1}));
        assert!(matches!(
            envelope.payload(),
            Ok(ConfigPayload::Patch {
                base_revision: 3,
                ..
            })
        ));
        envelope.base_revision = None;
        let err = envelope.payload().unwrap_err();
        assert!(err.to_string().contains("baseRevision"));
    }

    #[test]
    fn envelope_uses_camel_case_on_the_wire() {
        let envelope = ModuleConfigEnvelope::patch("cfg", 5, 2, json!({}));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["configId"], "cfg");
        assert_eq!(json["baseRevision"], 5);
        assert_eq!(json["schemaVersion"], 2);
        assert!(json.get("full").is_none());
    }

    #[test]
    fn merge_patch_adds_replaces_and_removes() {
        let mut target = json!({"token": "a", "nested": {"x": 1, "y": 2}, "drop": true});
        apply_merge_patch(
            &mut target,
            &json!({"token": "b", "nested": {"y": null, "z": 3}, "drop": null}),
        );
        assert_eq!(target, json!({"token": "b", "nested": {"x": 1, "z": 3}}));
    }

    #[test]
    fn validation_status_orders_by_remaining_work() {
        assert!(ValidationStatus::Valid < ValidationStatus::Partial);
        assert!(ValidationStatus::Partial < ValidationStatus::Invalid);
        assert_eq!(
            [ValidationStatus::Partial, ValidationStatus::Invalid]
                .into_iter()
                .max(),
            Some(ValidationStatus::Invalid)
        );
    }

    #[test]
    fn progress_state_ranks() {
        assert!(ProgressState::Queued.rank() < ProgressState::Working.rank());
        assert!(ProgressState::Done.is_terminal());
        assert!(ProgressState::Failed.is_terminal());
        assert!(!ProgressState::Working.is_terminal());
    }
}
