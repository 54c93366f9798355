//! Identity and capability model: who a module is, what software it runs,
//! what it depends on and what it contributes.

use crate::config::ModuleConfigSchema;
use crate::ids::{CapabilityId, ModuleId, PluginId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Free-form `key -> value` labels attached to plugins and modules.
pub type Labels = BTreeMap<String, String>;

/// Describes the plugin software, not the running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginIdentity {
    pub id: PluginId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
}

impl PluginIdentity {
    pub fn new(id: impl Into<PluginId>) -> Self {
        Self {
            id: id.into(),
            version: None,
            labels: Labels::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleKind {
    #[default]
    Plugin,
}

/// A running instance of a plugin. Immutable once announced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleIdentity {
    pub id: ModuleId,
    #[serde(default)]
    pub kind: ModuleKind,
    pub plugin: PluginIdentity,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
}

impl ModuleIdentity {
    pub fn new(id: impl Into<ModuleId>, plugin: PluginIdentity) -> Self {
        Self {
            id: id.into(),
            kind: ModuleKind::Plugin,
            plugin,
            labels: Labels::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Plugin labels overlaid with instance labels; instance labels win.
    pub fn effective_labels(&self) -> Labels {
        let mut labels = self.plugin.labels.clone();
        labels.extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        labels
    }
}

/// A logical dependency on some role another module must provide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDependency {
    pub role: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<serde_json::Value>,
}

impl ModuleDependency {
    pub fn required(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            optional: false,
            version: None,
            min: None,
            max: None,
            constraints: None,
        }
    }

    pub fn optional(role: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::required(role)
        }
    }

    pub fn is_version_constrained(&self) -> bool {
        self.version.is_some() || self.min.is_some() || self.max.is_some()
    }

    /// Whether a provider at `provided` satisfies this dependency's version
    /// bounds. A provider without a version only satisfies unconstrained
    /// dependencies.
    pub fn accepts_version(&self, provided: Option<&str>) -> bool {
        let Some(provided) = provided else {
            return !self.is_version_constrained();
        };

        if let Some(wanted) = &self.version {
            let matches = match wanted.strip_suffix('*') {
                Some(prefix) => {
                    provided.starts_with(prefix) || provided == prefix.trim_end_matches('.')
                }
                None => compare_versions(provided, wanted) == Ordering::Equal,
            };
            if !matches {
                return false;
            }
        }
        if let Some(min) = &self.min
            && compare_versions(provided, min) == Ordering::Less
        {
            return false;
        }
        if let Some(max) = &self.max
            && compare_versions(provided, max) == Ordering::Greater
        {
            return false;
        }
        true
    }
}

/// Dotted-numeric comparison (`1.10.0 > 1.9`). Missing components count as
/// zero; non-numeric components compare lexically.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let left: Vec<&str> = left.trim_start_matches('v').split('.').collect();
    let right: Vec<&str> = right.trim_start_matches('v').split('.').collect();
    let len = left.len().max(right.len());
    for i in 0..len {
        let a = left.get(i).copied().unwrap_or("0");
        let b = right.get(i).copied().unwrap_or("0");
        let ordering = match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => a.cmp(b),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// A discrete feature a module contributes after it is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleCapability {
    pub id: CapabilityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<ModuleConfigSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ModuleCapability {
    pub fn new(id: impl Into<CapabilityId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            config_schema: None,
            metadata: None,
        }
    }

    pub fn with_config_schema(mut self, schema: ModuleConfigSchema) -> Self {
        self.config_schema = Some(schema);
        self
    }
}

/// One row of `registry:modules:sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRegistryEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    pub identity: ModuleIdentity,
}

impl ModuleRegistryEntry {
    /// Instance key used by `instance` route matchers: `name` or `name#index`.
    pub fn instance_key(&self) -> String {
        match self.index {
            Some(index) => format!("{}#{index}", self.name),
            None => self.name.clone(),
        }
    }
}
