//! Moves completed upload batches from staging to the outbound intake.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::ReceptionError;
use crate::intake::{write_json, StagedDescriptor};
use crate::registrar::IntakeRegistrar;
use crate::staging::{BatchId, StagingArea};

pub const STATE_FILE: &str = "state.json";
pub const KEYS_FILE: &str = "keys.json";
pub const FIRST_PART: &str = "0.part";
const REGISTERED_MARKER: &str = ".registered";

/// Artifact record handed to the transfer stage, keys stripped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactState {
    pub content_id: String,
    pub key_reference: String,
    pub retry: u32,
    pub created: i64,
}

pub struct BatchPromoter {
    staging: StagingArea,
    registrar: Arc<dyn IntakeRegistrar>,
}

impl BatchPromoter {
    pub fn new(staging: StagingArea, registrar: Arc<dyn IntakeRegistrar>) -> Self {
        Self { staging, registrar }
    }

    /// Promote every staged artifact of `batch`, register each one, then
    /// clear the batch. Returns the number of artifacts promoted.
    ///
    /// On failure the staging directory is left in place so the whole
    /// batch can be promoted again.
    pub async fn promote(&self, batch: &BatchId) -> Result<usize, ReceptionError> {
        let dir = self.staging.batch_dir(batch)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(batch = %batch, "Nothing staged for batch");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut promoted = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            promoted.push(self.promote_artifact(&dir, &path).await?);
        }

        for destination in &promoted {
            self.register_once(destination).await?;
        }

        fs::remove_dir_all(&dir).await?;
        info!(batch = %batch, artifacts = promoted.len(), "Batch promoted");
        Ok(promoted.len())
    }

    async fn promote_artifact(
        &self,
        batch_dir: &Path,
        descriptor_path: &Path,
    ) -> Result<PathBuf, ReceptionError> {
        let staged: StagedDescriptor = serde_json::from_slice(&fs::read(descriptor_path).await?)?;
        let destination = self.staging.ready_dir(&staged.content_id)?;
        fs::create_dir_all(&destination).await?;

        let state = ArtifactState {
            content_id: staged.content_id.clone(),
            key_reference: staged.key_reference.clone(),
            retry: staged.retry,
            created: staged.created,
        };
        write_json(&destination.join(STATE_FILE), &state).await?;
        write_json(&destination.join(KEYS_FILE), &staged.keys).await?;

        let content = batch_dir.join(&staged.content_id);
        let part = destination.join(FIRST_PART);
        if fs::try_exists(&part).await? {
            debug!(content_id = %staged.content_id, "Ciphertext already promoted");
            match fs::remove_file(&content).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            fs::rename(&content, &part).await?;
        }

        Ok(destination)
    }

    /// Register a promoted artifact unless an earlier attempt already did.
    async fn register_once(&self, destination: &Path) -> Result<bool, ReceptionError> {
        let marker = destination.join(REGISTERED_MARKER);
        if fs::try_exists(&marker).await? {
            debug!(path = %destination.display(), "Artifact already registered");
            return Ok(false);
        }

        self.registrar.register(destination).await?;
        fs::write(&marker, b"").await?;
        Ok(true)
    }

    pub async fn discard(&self, batch: &BatchId) -> Result<bool, ReceptionError> {
        let removed = self.staging.remove_batch(batch).await?;
        if removed {
            info!(batch = %batch, "Batch discarded");
        }
        Ok(removed)
    }
}

/// A staged batch that must end in exactly one of promote or discard.
///
/// Dropping an unresolved session schedules a discard.
pub struct BatchSession {
    id: BatchId,
    promoter: Arc<BatchPromoter>,
    resolved: bool,
}

impl BatchSession {
    pub fn open(promoter: Arc<BatchPromoter>) -> Self {
        Self {
            id: BatchId::generate(),
            promoter,
            resolved: false,
        }
    }

    pub fn id(&self) -> &BatchId {
        &self.id
    }

    pub async fn promote(mut self) -> Result<usize, ReceptionError> {
        self.resolved = true;
        self.promoter.promote(&self.id).await
    }

    /// Best effort; failures are logged and the sweep catches leftovers.
    pub async fn discard(mut self) {
        self.resolved = true;
        if let Err(e) = self.promoter.discard(&self.id).await {
            warn!(batch = %self.id, error = %e, "Failed to discard batch");
        }
    }
}

impl Drop for BatchSession {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }

        let promoter = self.promoter.clone();
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = promoter.discard(&id).await {
                        warn!(batch = %id, error = %e, "Failed to discard abandoned batch");
                    }
                });
            }
            Err(_) => warn!(batch = %self.id, "Abandoned batch left for the staging sweep"),
        }
    }
}
