//! File existence checks and deletion

use crate::error::ChimeraError;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait FileProbe: Send + Sync {
    async fn exists(&self, path: &Path) -> Result<bool, ChimeraError>;

    async fn delete(&self, path: &Path) -> Result<(), ChimeraError>;
}

/// Local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFiles;

#[async_trait]
impl FileProbe for LocalFiles {
    async fn exists(&self, path: &Path) -> Result<bool, ChimeraError> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn delete(&self, path: &Path) -> Result<(), ChimeraError> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }
}
