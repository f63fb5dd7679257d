use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::schedule::types::StagedFile;

/// Local directory holding file payloads and combined transcripts.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in ["files", "results"] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .await
                .with_context(|| format!("Failed to create directory {}", path.display()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a payload that is not yet attached to any task.
    pub async fn stage(&self, original_name: &str, bytes: &[u8]) -> std::io::Result<StagedFile> {
        let path = self
            .root
            .join("files")
            .join(format!("{}_{}", Uuid::new_v4().simple(), sanitize(original_name)));
        fs::write(&path, bytes).await?;
        debug!("Staged {} ({} bytes) at {}", original_name, bytes.len(), path.display());

        Ok(StagedFile {
            original_name: original_name.to_string(),
            path,
            size: bytes.len() as u64,
        })
    }

    pub async fn write_result(&self, task_id: &str, text: &str) -> Result<PathBuf> {
        let path = self
            .root
            .join("results")
            .join(format!("task_{}_transcript.txt", task_id));
        fs::write(&path, text)
            .await
            .with_context(|| format!("Failed to write transcript {}", path.display()))?;
        Ok(path)
    }

    /// Remove a payload. A missing file is fine; other errors are logged and swallowed.
    pub async fn remove(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => debug!("Removed payload {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove payload {}: {}", path.display(), e),
        }
    }
}

/// Keep only the final path component so remote names cannot escape the blob root.
fn sanitize(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." {
        "file".to_string()
    } else {
        base.to_string()
    }
}
