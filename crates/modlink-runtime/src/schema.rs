//! JSON Schema validation for module configs and host-defined events.

use std::collections::HashMap;
use std::fmt;

use jsonschema::JSONSchema;
use jsonschema::error::ValidationErrorKind;
use modlink_protocol::{
    ConfigIssue, MigrationStep, ModuleConfigPlan, ModuleConfigSchema, ModuleConfigValidation,
    ProtocolError, ProtocolResult, ValidationStatus, is_known_event_type,
};
use serde_json::{Map, Value};

/// A config schema descriptor with its JSON Schema compiled.
pub struct CompiledSchema {
    descriptor: ModuleConfigSchema,
    validator: Option<JSONSchema>,
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("id", &self.descriptor.id)
            .field("version", &self.descriptor.version)
            .field("has_document", &self.validator.is_some())
            .finish()
    }
}

impl CompiledSchema {
    pub fn compile(descriptor: ModuleConfigSchema) -> ProtocolResult<Self> {
        let validator = match &descriptor.schema {
            Some(document) => Some(compile_document(&descriptor.id, document)?),
            None => None,
        };
        Ok(Self {
            descriptor,
            validator,
        })
    }

    pub fn descriptor(&self) -> &ModuleConfigSchema {
        &self.descriptor
    }

    fn document(&self) -> Option<&Value> {
        self.descriptor.schema.as_ref()
    }

    fn required(&self) -> Vec<&str> {
        self.document()
            .and_then(|doc| doc.get("required"))
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    fn properties(&self) -> Option<&Map<String, Value>> {
        self.document()
            .and_then(|doc| doc.get("properties"))
            .and_then(Value::as_object)
    }

    /// Validate a config (or its absence) written against `schema_version`.
    ///
    /// Missing required properties and an outdated schema version make the
    /// result `partial`; every other violation makes it `invalid`.
    pub fn validate(
        &self,
        config: Option<&Value>,
        schema_version: Option<u32>,
    ) -> ModuleConfigValidation {
        let mut status = ValidationStatus::Valid;
        let mut issues = Vec::new();

        match config {
            None => {
                for name in self.required() {
                    status = status.max(ValidationStatus::Partial);
                    let pointer = format!("/{name}");
                    issues.push(ConfigIssue::new(pointer, "required property is missing"));
                }
            }
            Some(config) => {
                for (missing, issue) in self.violations(config) {
                    let severity = if missing {
                        ValidationStatus::Partial
                    } else {
                        ValidationStatus::Invalid
                    };
                    status = status.max(severity);
                    issues.push(issue);
                }
            }
        }

        if let Some(version) = schema_version {
            let current = self.descriptor.version;
            if version < current {
                status = status.max(ValidationStatus::Partial);
                issues.push(ConfigIssue::new(
                    "",
                    format!("config targets schema version {version}, current is {current}"),
                ));
            } else if version > current {
                status = ValidationStatus::Invalid;
                issues.push(ConfigIssue::new(
                    "",
                    format!(
                        "config targets unknown schema version {version} (current is {current})"
                    ),
                ));
            }
        }

        ModuleConfigValidation { status, issues }
    }

    /// The authoritative list of changes needed for `config` to validate.
    pub fn plan(&self, config: Option<&Value>, schema_version: Option<u32>) -> ModuleConfigPlan {
        let mut plan = ModuleConfigPlan {
            schema_id: self.descriptor.id.clone(),
            schema_version: self.descriptor.version,
            ..ModuleConfigPlan::default()
        };

        match config {
            None => {
                plan.missing = self.required().iter().map(|name| format!("/{name}")).collect();
            }
            Some(config) => {
                for (missing, issue) in self.violations(config) {
                    if missing {
                        plan.missing.push(issue.path);
                    } else {
                        plan.invalid.push(issue);
                    }
                }
            }
        }

        let present = config.and_then(Value::as_object);
        if let Some(properties) = self.properties() {
            for (name, property) in properties {
                let is_set = present.is_some_and(|object| object.contains_key(name));
                if !is_set && let Some(default) = property.get("default") {
                    plan.defaults.insert(name.clone(), default.clone());
                }
                let deprecated = property
                    .get("deprecated")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if is_set && deprecated {
                    plan.deprecated.push(format!("/{name}"));
                }
            }
        }

        if let Some(version) = schema_version
            && version < self.descriptor.version
        {
            plan.migrations.push(MigrationStep {
                from: version,
                to: self.descriptor.version,
            });
        }

        plan
    }

    /// `(is_missing_required, issue)` for every schema violation.
    fn violations(&self, config: &Value) -> Vec<(bool, ConfigIssue)> {
        let Some(validator) = &self.validator else {
            return Vec::new();
        };
        match validator.validate(config) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|error| {
                    let base = error.instance_path.to_string();
                    match &error.kind {
                        ValidationErrorKind::Required { property } => {
                            let name = property
                                .as_str()
                                .map(str::to_owned)
                                .unwrap_or_else(|| property.to_string());
                            (
                                true,
                                ConfigIssue::new(
                                    format!("{base}/{name}"),
                                    "required property is missing",
                                ),
                            )
                        }
                        _ => (false, ConfigIssue::new(base, error.to_string())),
                    }
                })
                .collect(),
        }
    }
}

fn compile_document(id: &str, document: &Value) -> ProtocolResult<JSONSchema> {
    JSONSchema::compile(document)
        .map_err(|error| ProtocolError::Schema(format!("schema {id} does not compile: {error}")))
}

/// Host-registered schemas for custom event names.
#[derive(Default)]
pub struct EventSchemaTable {
    schemas: HashMap<String, JSONSchema>,
}

impl fmt::Debug for EventSchemaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSchemaTable")
            .field("event_types", &self.schemas.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventSchemaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the payload schema of a custom event. Built-in event names
    /// cannot be redefined.
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        schema: &Value,
    ) -> ProtocolResult<()> {
        let event_type = event_type.into();
        if is_known_event_type(&event_type) {
            return Err(ProtocolError::Schema(format!(
                "{event_type} is a built-in event and cannot be redefined"
            )));
        }
        let compiled = compile_document(&event_type, schema)?;
        self.schemas.insert(event_type, compiled);
        Ok(())
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.schemas.contains_key(event_type)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Check a custom event payload at the boundary.
    pub fn check(&self, event_type: &str, data: &Value, strict: bool) -> ProtocolResult<()> {
        let Some(schema) = self.schemas.get(event_type) else {
            if strict {
                return Err(ProtocolError::Schema(format!(
                    "custom event {event_type} has no registered schema"
                )));
            }
            return Ok(());
        };
        if let Err(errors) = schema.validate(data) {
            let issues = errors.map(|e| e.to_string()).collect::<Vec<_>>();
            return Err(ProtocolError::Schema(format!(
                "{event_type}: {}",
                issues.join("; ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> CompiledSchema {
        CompiledSchema::compile(ModuleConfigSchema::new(
            "telegram",
            2,
            Some(json!({
                "type": "object",
                "required": ["token"],
                "properties": {
                    "token": {"type": "string"},
                    "pollMs": {"type": "integer", "default": 500},
                    "legacyChat": {"type": "string", "deprecated": true}
                }
            })),
        ))
        .unwrap()
    }

    #[test]
    fn absent_config_is_partial_when_fields_are_required() {
        let validation = schema().validate(None, None);
        assert_eq!(validation.status, ValidationStatus::Partial);
        assert_eq!(validation.issues[0].path, "/token");

        let relaxed = CompiledSchema::compile(ModuleConfigSchema::new(
            "free",
            1,
            Some(json!({"type": "object"})),
        ))
        .unwrap();
        assert!(relaxed.validate(None, None).is_valid());
    }

    #[test]
    fn missing_is_partial_wrong_type_is_invalid() {
        let schema = schema();
        let missing = schema.validate(Some(&json!({"pollMs": 10})), Some(2));
        assert_eq!(missing.status, ValidationStatus::Partial);
        assert_eq!(missing.issues[0].path, "/token");

        let wrong = schema.validate(Some(&json!({"token": 7})), Some(2));
        assert_eq!(wrong.status, ValidationStatus::Invalid);
        assert_eq!(wrong.issues[0].path, "/token");
        assert!(!wrong.issues[0].reason.is_empty());

        assert!(schema.validate(Some(&json!({"token": "t"})), Some(2)).is_valid());
    }

    #[test]
    fn outdated_schema_version_needs_migration() {
        let schema = schema();
        let validation = schema.validate(Some(&json!({"token": "t"})), Some(1));
        assert_eq!(validation.status, ValidationStatus::Partial);

        let plan = schema.plan(Some(&json!({"token": "t", "legacyChat": "x"})), Some(1));
        assert_eq!(plan.migrations, vec![MigrationStep { from: 1, to: 2 }]);
        assert_eq!(plan.deprecated, vec!["/legacyChat"]);
        assert_eq!(plan.defaults.get("pollMs"), Some(&json!(500)));
        assert!(plan.missing.is_empty());
    }

    #[test]
    fn event_table_validates_custom_payloads() {
        let mut table = EventSchemaTable::new();
        table
            .register(
                "vendor:telemetry:frame",
                &json!({"type": "object", "required": ["fps"]}),
            )
            .unwrap();
        assert!(table.register("spark:notify", &json!({})).is_err());

        assert!(table.check("vendor:telemetry:frame", &json!({"fps": 60}), true).is_ok());
        assert!(table.check("vendor:telemetry:frame", &json!({}), false).is_err());
        assert!(table.check("vendor:other", &json!({}), false).is_ok());
        assert!(table.check("vendor:other", &json!({}), true).is_err());
    }
}
