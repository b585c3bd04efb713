use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use heating_common::{ConfigEntry, RuntimeConfig};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;

/// JSON files under the data directory: `runtime.json` and `entries.json`.
#[derive(Clone)]
pub struct AppStore {
    runtime_path: Arc<PathBuf>,
    entries_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn new() -> Self {
        let data_dir = std::env::var("HEATING_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heating"));
        Self::with_dir(data_dir)
    }

    pub fn with_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            entries_path: Arc::new(data_dir.join("entries.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        self.read_or_default(&self.runtime_path).await
    }

    pub async fn load_entries(&self) -> anyhow::Result<Vec<ConfigEntry>> {
        self.read_or_default(&self.entries_path).await
    }

    pub async fn save_entries(&self, entries: &[ConfigEntry]) -> anyhow::Result<()> {
        self.write(&self.entries_path, entries).await
    }

    async fn read_or_default<T: DeserializeOwned + Default>(&self, path: &Path) -> anyhow::Result<T> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

#[cfg(test)]
pub fn scratch_store(name: &str) -> AppStore {
    let dir = std::env::temp_dir().join(format!("heating-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    AppStore::with_dir(dir)
}
