//! Encrypted submission of messages to the messaging domain.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use reception_shared::constants::{ACTION_POST_MESSAGE, DOMAIN_MESSAGES};
use reception_shared::EncryptedMessage;

use crate::broker::Producer;
use crate::error::ReceptionError;
use crate::intake::FileDescriptor;
use crate::keyring::KeyringCache;
use crate::message::{CallerMetadata, PendingMessage};
use crate::promoter::BatchSession;

/// Broker field echoing the raw request, never returned to clients.
const ORIGINAL_FIELD: &str = "__original";

/// How the messaging domain answered.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Reply carried `ok: true`.
    Accepted(Value),
    Rejected(Value),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted(_))
    }
}

impl IntoResponse for SubmitOutcome {
    fn into_response(self) -> Response {
        match self {
            SubmitOutcome::Accepted(body) => (StatusCode::CREATED, Json(body)).into_response(),
            SubmitOutcome::Rejected(body) => (StatusCode::OK, Json(body)).into_response(),
        }
    }
}

pub struct MessageSubmitter {
    producer: Arc<Producer>,
    keyring: Arc<KeyringCache>,
    permits: Semaphore,
    producer_wait: Duration,
    reply_timeout: Duration,
}

impl MessageSubmitter {
    pub fn new(
        producer: Arc<Producer>,
        keyring: Arc<KeyringCache>,
        concurrency: usize,
        producer_wait: Duration,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            producer,
            keyring,
            permits: Semaphore::new(concurrency.max(1)),
            producer_wait,
            reply_timeout,
        }
    }

    pub async fn submit(
        &self,
        message: &PendingMessage,
        metadata: Option<CallerMetadata>,
        files: Vec<FileDescriptor>,
    ) -> Result<SubmitOutcome, ReceptionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ReceptionError::Internal("submitter closed".to_string()))?;

        self.producer.wait_ready(self.producer_wait).await?;

        let envelope = message.envelope(metadata, files);
        let certificates = self.keyring.certificates();
        if certificates.is_empty() {
            warn!("Message refused, no encryption certificate loaded yet");
            return Err(ReceptionError::NoEncryptionKeys);
        }

        let sealed =
            EncryptedMessage::seal(&certificates, &envelope, DOMAIN_MESSAGES, ACTION_POST_MESSAGE)?;
        let routing = format!("commande.{DOMAIN_MESSAGES}.{ACTION_POST_MESSAGE}");
        let payload = serde_json::to_value(&sealed)?;

        let reply = self
            .producer
            .request(&routing, &sealed.id, payload, self.reply_timeout)
            .await?;
        let accepted = reply.is_ok();

        let mut body = reply.body;
        if let Some(fields) = body.as_object_mut() {
            fields.remove(ORIGINAL_FIELD);
        }

        info!(
            message_id = %sealed.id,
            recipients = message.recipients.len(),
            keys = sealed.keys.len(),
            accepted,
            "Message submitted"
        );

        Ok(if accepted {
            SubmitOutcome::Accepted(body)
        } else {
            SubmitOutcome::Rejected(body)
        })
    }

    /// Submit, then promote `batch` if the message was accepted and discard
    /// it on any other outcome.
    pub async fn submit_with_batch(
        &self,
        message: &PendingMessage,
        metadata: Option<CallerMetadata>,
        batch: BatchSession,
        files: Vec<FileDescriptor>,
    ) -> Result<SubmitOutcome, ReceptionError> {
        match self.submit(message, metadata, files).await {
            Ok(SubmitOutcome::Accepted(body)) => {
                let batch_id = batch.id().clone();
                if let Err(e) = batch.promote().await {
                    error!(batch = %batch_id, error = %e, "Accepted message but batch promotion failed");
                    return Err(e);
                }
                Ok(SubmitOutcome::Accepted(body))
            }
            other => {
                batch.discard().await;
                other
            }
        }
    }
}
