use anyhow::{Result, bail};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Object store for alert artifacts. Returns a reference that is carried
/// in the alert payload.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, name: &str, content_type: &str) -> Result<String>;
}

/// Filesystem-backed object store rooted at one directory.
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        if name.is_empty() || rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            bail!("invalid object name: {}", name);
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn upload(&self, bytes: Vec<u8>, name: &str, content_type: &str) -> Result<String> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        debug!(
            "Stored object {} ({} bytes, {})",
            path.display(),
            bytes.len(),
            content_type
        );
        Ok(format!("local://{}", name))
    }
}
