use std::path::{Path, PathBuf};

use async_trait::async_trait;
use modlink_protocol::{
    ConfigStorePort, ConfigTarget, ModuleConfigEnvelope, ProtocolError, ProtocolResult,
};
use tokio::fs;
use tracing::{debug, instrument};

/// Committed configurations as one JSON file per target:
/// `<root>/<module>/module.json` and `<root>/<module>/capabilities/<id>.json`.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    root: PathBuf,
}

impl FileConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, target: &ConfigTarget) -> PathBuf {
        let module_dir = self.root.join(path_segment(target.module.as_str()));
        match &target.capability {
            Some(capability) => module_dir
                .join("capabilities")
                .join(format!("{}.json", path_segment(capability.as_str()))),
            None => module_dir.join("module.json"),
        }
    }
}

/// Ids may contain `:` or `/`; keep file names portable.
fn path_segment(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn storage_error(path: &Path, error: std::io::Error) -> ProtocolError {
    ProtocolError::Storage(format!("{}: {error}", path.display()))
}

#[async_trait]
impl ConfigStorePort for FileConfigStore {
    #[instrument(skip(self), fields(config_target = %target))]
    async fn load(&self, target: &ConfigTarget) -> ProtocolResult<Option<ModuleConfigEnvelope>> {
        let path = self.path_for(target);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(storage_error(&path, error)),
        };
        let envelope: ModuleConfigEnvelope = serde_json::from_str(&raw)?;
        debug!(revision = envelope.revision, "persisted config loaded");
        Ok(Some(envelope))
    }

    #[instrument(
        skip(self, envelope),
        fields(config_target = %target, revision = envelope.revision)
    )]
    async fn save(
        &self,
        target: &ConfigTarget,
        envelope: &ModuleConfigEnvelope,
    ) -> ProtocolResult<()> {
        let path = self.path_for(target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|error| storage_error(parent, error))?;
        }
        let body = serde_json::to_vec_pretty(envelope)?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, body)
            .await
            .map_err(|error| storage_error(&staging, error))?;
        fs::rename(&staging, &path)
            .await
            .map_err(|error| storage_error(&path, error))?;
        debug!("config persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use serde_json::json;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[tokio::test]
    async fn saved_envelopes_load_back_per_target() -> Result<()> {
        let root = unique_test_root("modlink-config-store");
        let store = FileConfigStore::new(&root);
        let module = ConfigTarget::module("telegram-bot".into());
        let capability = ConfigTarget::capability("speaker".into(), "audio:tts".into());

        assert!(store.load(&module).await?.is_none());

        let envelope = ModuleConfigEnvelope::full("telegram", 3, 1, json!({"token": "abc"}));
        store.save(&module, &envelope).await?;
        store
            .save(&capability, &ModuleConfigEnvelope::full("tts", 1, 1, json!({})))
            .await?;

        assert_eq!(store.load(&module).await?, Some(envelope));
        assert_eq!(store.load(&capability).await?.map(|e| e.revision), Some(1));
        assert!(
            root.join("speaker")
                .join("capabilities")
                .join("audio_tts.json")
                .exists()
        );

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
