//! Settings storage (settings.json in the data directory)

use crate::error::ChimeraError;
use chimera_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

const SETTINGS_FILE: &str = "settings.json";

/// Storage manager for Chimera settings
#[derive(Clone, Debug)]
pub struct SettingsStorage {
    data_dir: PathBuf,
}

impl SettingsStorage {
    /// Create a storage rooted at `data_dir`, creating the directory
    pub async fn new(data_dir: PathBuf) -> Result<Self, ChimeraError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    /// Load settings; a missing or unreadable file yields the defaults
    pub async fn load(&self) -> Settings {
        let path = self.settings_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
            Err(e) => {
                warn!("Failed to read {}: {}; using defaults", path.display(), e);
                return Settings::default();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Invalid settings in {}: {}; using defaults", path.display(), e);
            Settings::default()
        })
    }

    pub async fn save(&self, settings: &Settings) -> Result<(), ChimeraError> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.settings_path(), content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_storage(name: &str) -> SettingsStorage {
        let dir = std::env::temp_dir().join(format!("chimera-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir).await;
        SettingsStorage::new(dir).await.unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let storage = temp_storage("settings-missing").await;
        assert_eq!(storage.load().await, Settings::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let storage = temp_storage("settings-save").await;
        let settings = Settings {
            user_agent: "chimera-test".to_string(),
            real_debrid_token: Some("rd".to_string()),
            ..Settings::default()
        };

        storage.save(&settings).await.unwrap();
        assert_eq!(storage.load().await, settings);
    }

    #[tokio::test]
    async fn test_partial_and_corrupt_files() {
        let storage = temp_storage("settings-corrupt").await;

        fs::write(storage.settings_path(), r#"{"max_redirects": 7}"#)
            .await
            .unwrap();
        let settings = storage.load().await;
        assert_eq!(settings.max_redirects, 7);
        assert_eq!(settings.user_agent, "chimera");

        fs::write(storage.settings_path(), "{not json").await.unwrap();
        assert_eq!(storage.load().await, Settings::default());
    }
}
