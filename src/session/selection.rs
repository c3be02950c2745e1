use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// A user's last successful selection, offered as the default next time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionState {
    pub last_selected_path: String,
    pub display_name: String,
}

#[async_trait]
pub trait SelectionStore: Debug + Send + Sync {
    async fn load(&self, principal: &str) -> Result<Option<SelectionState>>;
    async fn save(&self, principal: &str, state: &SelectionState) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySelectionStore {
    states: Mutex<BTreeMap<String, SelectionState>>,
}

impl MemorySelectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SelectionStore for MemorySelectionStore {
    async fn load(&self, principal: &str) -> Result<Option<SelectionState>> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        Ok(states.get(principal).cloned())
    }

    async fn save(&self, principal: &str, state: &SelectionState) -> Result<()> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(principal.to_string(), state.clone());
        Ok(())
    }
}

/// Selections for all principals in one JSON document, replaced atomically
/// on every save.
#[derive(Debug)]
pub struct JsonFileSelectionStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileSelectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<String, SelectionState>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, states: &BTreeMap<String, SelectionState>) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let bytes = serde_json::to_vec_pretty(states)?;
        let target = self.path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(())
    }
}

#[async_trait]
impl SelectionStore for JsonFileSelectionStore {
    async fn load(&self, principal: &str) -> Result<Option<SelectionState>> {
        Ok(self.read_all().await?.remove(principal))
    }

    async fn save(&self, principal: &str, state: &SelectionState) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut states = self.read_all().await?;
        states.insert(principal.to_string(), state.clone());
        self.write_all(&states).await
    }
}
