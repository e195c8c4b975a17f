use crate::universe::UniverseKind;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tokio::fs;

// CONFIGURATION

/// Settings read from `storage/config.json`. Every field is optional in the
/// file; command-line flags are layered on top afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub preset: String,
    /// Reject unknown preset names instead of falling back to balanced.
    pub strict_preset: bool,
    /// Percent; a stock is flagged when its change is at or below this.
    pub drop_threshold: f64,
    pub max_workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub max_news: usize,
    pub top_n: usize,
    pub universe: UniverseKind,
    pub tickers_file: PathBuf,
    pub symbols: Vec<String>,
    /// Yahoo chart range, e.g. "5d", "3mo".
    pub history_range: String,
    pub output_dir: PathBuf,
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            preset: "balanced".to_string(),
            strict_preset: false,
            drop_threshold: -10.0,
            max_workers: None,
            max_retries: None,
            max_news: 3,
            top_n: 3,
            universe: UniverseKind::Sp500,
            tickers_file: PathBuf::from("us_public_tickers.csv"),
            symbols: Vec::new(),
            history_range: "3mo".to_string(),
            output_dir: PathBuf::from("."),
            request_timeout_secs: 10,
        }
    }
}

// STORAGE MANAGER

pub struct AsyncStorageManager {
    pub base_dir: PathBuf,
}

impl AsyncStorageManager {
    /// Storage directory next to the running binary, created if missing.
    pub async fn new_relative<P: AsRef<Path>>(relative_path: P) -> anyhow::Result<Self> {
        let exe_path = std::env::current_exe()?;
        let base_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not find binary directory"))?
            .join(relative_path);
        Self::new_at(base_dir).await
    }

    pub async fn new_at(base_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.json"))
    }

    /// Pretty JSON, written to a `.tmp` sibling and renamed into place so a
    /// crash never leaves a half-written file behind.
    pub async fn save<T: Serialize>(&self, name: &str, data: &T) -> anyhow::Result<()> {
        let final_path = self.path_of(name);
        let tmp_path = self.base_dir.join(format!("{name}.json.tmp"));

        let json_bytes = serde_json::to_vec_pretty(data)?;
        fs::write(&tmp_path, json_bytes).await?;
        fs::rename(tmp_path, final_path).await?;
        Ok(())
    }

    pub async fn load<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let content = fs::read(self.path_of(name)).await?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Like [`load`](Self::load), but a missing file is `Ok(None)`.
    pub async fn load_optional<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        if !fs::try_exists(self.path_of(name)).await? {
            return Ok(None);
        }
        self.load(name).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partial_config_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new_at(dir.path()).await.unwrap();
        tokio::fs::write(
            storage.path_of("config"),
            r#"{"preset": "conservative", "drop_threshold": -7.5, "universe": "csv"}"#,
        )
        .await
        .unwrap();

        let config: AppConfig = storage.load_optional("config").await.unwrap().unwrap();

        assert_eq!(config.preset, "conservative");
        assert_eq!(config.drop_threshold, -7.5);
        assert_eq!(config.universe, UniverseKind::Csv);
        assert_eq!(config.max_news, 3);
        assert_eq!(config.history_range, "3mo");
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new_at(dir.path()).await.unwrap();
        let config: Option<AppConfig> = storage.load_optional("config").await.unwrap();
        assert!(config.is_none());
        assert!(storage.load::<AppConfig>("config").await.is_err());
    }

    #[tokio::test]
    async fn save_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new_at(dir.path().join("nested")).await.unwrap();

        storage.save("config", &AppConfig::default()).await.unwrap();
        let changed = AppConfig {
            top_n: 7,
            ..AppConfig::default()
        };
        storage.save("config", &changed).await.unwrap();

        let loaded: AppConfig = storage.load("config").await.unwrap();
        assert_eq!(loaded, changed);
        assert!(!storage.base_dir.join("config.json.tmp").exists());
    }
}
