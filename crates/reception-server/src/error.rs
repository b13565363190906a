use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use reception_shared::CryptoError;

/// Application-level code telling clients the keyring is still loading.
pub const CODE_KEYS_UNAVAILABLE: u32 = 2;

#[derive(Debug, Error)]
pub enum ReceptionError {
    #[error("Missing recipients")]
    MissingRecipients,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Certificate declares no accepted domain: {0:?}")]
    InvalidCertificateDomain(Vec<String>),

    #[error("No encryption certificate could be loaded")]
    NoEncryptionCertificate,

    #[error("Encryption keys not received yet, retry in 30 seconds")]
    NoEncryptionKeys,

    #[error("No recipient to wrap the file key for")]
    NoRecipients,

    #[error("Broker producer unavailable")]
    ProducerUnavailable,

    #[error("Timed out waiting for broker reply")]
    SubmitTimeout,

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Invalid batch id: {0}")]
    InvalidBatchId(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Staging error: {0}")]
    Staging(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReceptionError {
    /// Errors a client should retry shortly rather than treat as final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReceptionError::NoEncryptionKeys | ReceptionError::NoEncryptionCertificate
        )
    }
}

impl IntoResponse for ReceptionError {
    fn into_response(self) -> Response {
        if self.is_retryable() {
            let body = serde_json::json!({
                "ok": false,
                "code": CODE_KEYS_UNAVAILABLE,
                "err": ReceptionError::NoEncryptionKeys.to_string(),
            });
            return (StatusCode::OK, axum::Json(body)).into_response();
        }

        let (status, message) = match &self {
            ReceptionError::MissingRecipients
            | ReceptionError::InvalidMessage(_)
            | ReceptionError::BadRequest(_)
            | ReceptionError::UnsupportedContentType(_)
            | ReceptionError::InvalidBatchId(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ReceptionError::NotImplemented(_) => (StatusCode::NOT_IMPLEMENTED, self.to_string()),
            ReceptionError::SubmitTimeout | ReceptionError::ProducerUnavailable => {
                tracing::error!(error = %self, "Message submission failed");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            _ => {
                tracing::error!(error = %self, "Unexpected error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "ok": false,
            "err": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ReceptionError::NoEncryptionKeys, StatusCode::OK),
            (ReceptionError::NoEncryptionCertificate, StatusCode::OK),
            (ReceptionError::MissingRecipients, StatusCode::BAD_REQUEST),
            (
                ReceptionError::UnsupportedContentType("text/plain".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ReceptionError::NotImplemented("signed messages"),
                StatusCode::NOT_IMPLEMENTED,
            ),
            (ReceptionError::SubmitTimeout, StatusCode::INTERNAL_SERVER_ERROR),
            (
                ReceptionError::ProducerUnavailable,
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ReceptionError::NoRecipients, StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_retryable() {
        assert!(ReceptionError::NoEncryptionKeys.is_retryable());
        assert!(!ReceptionError::SubmitTimeout.is_retryable());
    }
}
