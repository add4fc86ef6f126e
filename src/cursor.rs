//! Persistence of the subscriber's last processed block

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Storage for one subscription cursor
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Last fully processed block, if any
    async fn load(&self) -> Result<Option<u64>>;

    /// Record `block` as fully processed
    async fn store(&self, block: u64) -> Result<()>;

    /// Forget the cursor so the next run starts from the configured start block
    async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl<T: CursorStore + ?Sized> CursorStore for Arc<T> {
    async fn load(&self) -> Result<Option<u64>> {
        (**self).load().await
    }

    async fn store(&self, block: u64) -> Result<()> {
        (**self).store(block).await
    }

    async fn clear(&self) -> Result<()> {
        (**self).clear().await
    }
}

/// In-process cursor, lost on restart
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    block: Mutex<Option<u64>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `block`
    pub fn starting_at(block: u64) -> Self {
        Self {
            block: Mutex::new(Some(block)),
        }
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self) -> Result<Option<u64>> {
        Ok(*self.block.lock().await)
    }

    async fn store(&self, block: u64) -> Result<()> {
        *self.block.lock().await = Some(block);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.block.lock().await = None;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorFile {
    last_processed_block: u64,
}

/// Cursor kept in a small JSON file.
///
/// Writes go to a sibling temp file which is then renamed over the target.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "cursor".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self) -> Result<Option<u64>> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PipelineError::Cursor(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let file: CursorFile = serde_json::from_slice(&contents).map_err(|e| {
            PipelineError::Cursor(format!("malformed cursor file {}: {}", self.path.display(), e))
        })?;
        Ok(Some(file.last_processed_block))
    }

    async fn store(&self, block: u64) -> Result<()> {
        let contents = serde_json::to_vec_pretty(&CursorFile {
            last_processed_block: block,
        })
        .map_err(|e| PipelineError::Cursor(e.to_string()))?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, &contents).await.map_err(|e| {
            PipelineError::Cursor(format!("failed to write {}: {}", temp.display(), e))
        })?;
        tokio::fs::rename(&temp, &self.path).await.map_err(|e| {
            PipelineError::Cursor(format!("failed to replace {}: {}", self.path.display(), e))
        })?;

        debug!("Cursor stored at block {} in {}", block, self.path.display());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Cursor file {} removed", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::Cursor(format!(
                "failed to remove {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}
