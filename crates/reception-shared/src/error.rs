use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid stream header: expected {expected} bytes, got {actual}")]
    InvalidHeader { expected: usize, actual: usize },

    #[error("No recipient certificate to encrypt for")]
    NoRecipients,

    #[error("No wrapped key for fingerprint {0}")]
    UnknownRecipient(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
