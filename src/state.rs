//! Node State Persistence
//!
//! One JSON document per object id, stored as `<id>.json` below a base
//! directory.

use crate::domain::ports::StateStore;
use crate::error::{Error, Result, ResultExt};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const SUFFIX: &str = ".json";

/// File-backed state store
pub struct FileState {
    location: PathBuf,
}

impl FileState {
    /// Use `location`, creating it if needed
    pub async fn new(location: impl AsRef<Path>) -> Result<Self> {
        let location = location.as_ref().to_path_buf();
        if location.as_os_str().is_empty() {
            return Err(Error::Configuration("state location is empty".into()));
        }
        fs::create_dir_all(&location)
            .await
            .context(format!("create state directory {}", location.display()))?;

        Ok(Self { location })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains('/') || id.starts_with('.') {
            return Err(Error::Internal(format!("invalid state id {:?}", id)));
        }
        Ok(self.location.join(format!("{}{}", id, SUFFIX)))
    }
}

#[async_trait]
impl StateStore for FileState {
    async fn create(&self, id: &str, data: &serde_json::Value) -> Result<()> {
        let path = self.path_for(id)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(data)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!(id, path = %path.display(), "Stored state");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.location).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(SUFFIX)) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
