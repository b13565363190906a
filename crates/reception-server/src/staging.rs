use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ReceptionError;

const UPLOAD_DIR: &str = "upload";
const READY_DIR: &str = "ready";

/// Identifier shared by every file uploaded with one submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchId(String);

impl BatchId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept an externally supplied id, refusing anything that is not a
    /// single safe path component.
    pub fn parse(value: &str) -> Result<Self, ReceptionError> {
        if !is_safe_component(value) {
            return Err(ReceptionError::InvalidBatchId(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_safe_component(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ReceptionError> {
    let relative = target.strip_prefix(base).unwrap_or(target);
    let mut resolved = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            _ => {
                return Err(ReceptionError::BadRequest(
                    "Path traversal detected".to_string(),
                ));
            }
        }
    }
    Ok(resolved)
}

/// On-disk staging area.
///
/// ```text
/// <root>/upload/<batch_id>/<content_id>        ciphertext
/// <root>/upload/<batch_id>/<content_id>.json   key descriptor
/// <root>/ready/<content_id>/                   promoted artifact
/// ```
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub async fn new(root: PathBuf) -> Result<Self, ReceptionError> {
        for dir in [root.join(UPLOAD_DIR), root.join(READY_DIR)] {
            fs::create_dir_all(&dir).await.map_err(|e| {
                ReceptionError::Internal(format!(
                    "Failed to create staging directory '{}': {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        info!(path = %root.display(), "Staging area initialized");
        Ok(Self { root })
    }

    pub fn upload_root(&self) -> PathBuf {
        self.root.join(UPLOAD_DIR)
    }

    pub fn ready_root(&self) -> PathBuf {
        self.root.join(READY_DIR)
    }

    pub fn batch_dir(&self, batch: &BatchId) -> Result<PathBuf, ReceptionError> {
        let base = self.upload_root();
        ensure_within(&base, &base.join(batch.as_str()))
    }

    pub fn ready_dir(&self, content_id: &str) -> Result<PathBuf, ReceptionError> {
        if !is_safe_component(content_id) {
            return Err(ReceptionError::BadRequest(format!(
                "Invalid content id: {content_id}"
            )));
        }
        let base = self.ready_root();
        ensure_within(&base, &base.join(content_id))
    }

    /// Remove a batch directory. Already-absent is not an error.
    pub async fn remove_batch(&self, batch: &BatchId) -> Result<bool, ReceptionError> {
        let dir = self.batch_dir(batch)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(batch = %batch, "Removed staged batch");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove staged batches whose directory has not changed for `max_age`.
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<usize, ReceptionError> {
        let mut removed = 0;
        let mut entries = fs::read_dir(self.upload_root()).await?;

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_dir() => m,
                _ => continue,
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }

            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    removed += 1;
                    info!(batch = ?entry.file_name(), age_secs = age.as_secs(), "Swept stale batch");
                }
                Err(e) => warn!(batch = ?entry.file_name(), error = %e, "Failed to sweep batch"),
            }
        }

        Ok(removed)
    }
}
