//! File persistence for flow definitions
//!
//! One `<flow_id>.json` file per flow. Writes go to a temporary file in the
//! same directory and are renamed into place.

use std::path::{Path, PathBuf};

use crate::error::{FlowError, Result};
use crate::flow::types::FlowMeta;
use crate::flow::validate::is_safe_flow_id;

const EXTENSION: &str = "json";

/// Directory-backed flow storage
#[derive(Debug, Clone)]
pub struct FlowStorage {
    dir: PathBuf,
}

impl FlowStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the storage directory if it doesn't exist
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    pub fn path_for(&self, flow_id: &str) -> Result<PathBuf> {
        if !is_safe_flow_id(flow_id) {
            return Err(FlowError::Validation(format!("'{}' is not a valid flow id", flow_id)));
        }
        Ok(self.dir.join(format!("{}.{}", flow_id, EXTENSION)))
    }

    /// Serialized form written to disk
    pub fn encode(meta: &FlowMeta) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(meta)?)
    }

    /// Atomically write a definition
    pub async fn save(&self, meta: &FlowMeta) -> Result<()> {
        let path = self.path_for(&meta.id)?;
        let bytes = Self::encode(meta)?;
        self.init().await?;

        let tmp = self.dir.join(format!(".{}.{}.tmp", meta.id, uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::debug!("Flow {} saved to {}", meta.id, path.display());
        Ok(())
    }

    pub async fn load(&self, flow_id: &str) -> Result<FlowMeta> {
        let path = self.path_for(flow_id)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FlowError::NotFound(format!("flow '{}'", flow_id)),
            _ => e.into(),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Definition files in the directory, sorted by name
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_definition = path.extension().is_some_and(|ext| ext == EXTENSION)
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'));
            if is_definition {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Remove a definition; a missing file is not an error
    pub async fn delete(&self, flow_id: &str) -> Result<()> {
        let path = self.path_for(flow_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Flow file {} removed", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Flow id derived from a definition file name
pub fn flow_id_from_path(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}
