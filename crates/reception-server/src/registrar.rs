//! Hand-off of promoted artifacts to the transfer stage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::ReceptionError;

/// Accepts a ready artifact directory for onward transfer.
#[async_trait]
pub trait IntakeRegistrar: Send + Sync {
    async fn register(&self, path: &Path) -> Result<(), ReceptionError>;
}

/// Queues promoted artifacts for the transfer worker.
pub struct TransferQueue {
    tx: mpsc::UnboundedSender<PathBuf>,
}

impl TransferQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PathBuf>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl IntakeRegistrar for TransferQueue {
    async fn register(&self, path: &Path) -> Result<(), ReceptionError> {
        self.tx
            .send(path.to_path_buf())
            .map_err(|_| ReceptionError::Internal("transfer queue closed".to_string()))?;
        info!(path = %path.display(), "Artifact queued for transfer");
        Ok(())
    }
}
