//! Multi-recipient encryption of message envelopes.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use x25519_dalek::StaticSecret;

use crate::certificate::RecipientCertificate;
use crate::constants::NONCE_SIZE;
use crate::crypto::{decrypt, encrypt, generate_symmetric_key};
use crate::domain_signature::DomainSignature;
use crate::error::CryptoError;
use crate::keywrap::{unwrap_key, wrap_key};

/// An envelope encrypted once and readable by every listed recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// BLAKE3 hex digest of `content`; doubles as the correlation id.
    pub id: String,
    pub domain: String,
    pub action: String,
    pub created_at: i64,
    /// base64(nonce || ciphertext)
    pub content: String,
    /// fingerprint -> base64 wrapped key
    pub keys: BTreeMap<String, String>,
    pub signature: DomainSignature,
}

impl EncryptedMessage {
    pub fn seal<T: Serialize>(
        certificates: &[RecipientCertificate],
        envelope: &T,
        domain: &str,
        action: &str,
    ) -> Result<Self, CryptoError> {
        if certificates.is_empty() {
            return Err(CryptoError::NoRecipients);
        }

        let plaintext = serde_json::to_vec(envelope)?;
        let key = generate_symmetric_key();
        let sealed = encrypt(&key, &plaintext)?;

        let mut keys = BTreeMap::new();
        for certificate in certificates {
            let (wrapped, fingerprint) = wrap_key(certificate, &key)?;
            keys.insert(fingerprint, BASE64.encode(wrapped));
        }

        let signature = DomainSignature::sign(&key, &[domain], &sealed[..NONCE_SIZE]);

        Ok(Self {
            id: blake3::hash(&sealed).to_hex().to_string(),
            domain: domain.to_string(),
            action: action.to_string(),
            created_at: Utc::now().timestamp(),
            content: BASE64.encode(&sealed),
            keys,
            signature,
        })
    }

    pub fn open(&self, secret: &StaticSecret, fingerprint: &str) -> Result<Vec<u8>, CryptoError> {
        let wrapped = self
            .keys
            .get(fingerprint)
            .ok_or_else(|| CryptoError::UnknownRecipient(fingerprint.to_string()))?;
        let wrapped = BASE64
            .decode(wrapped)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let key = unwrap_key(secret, &wrapped)?;

        let sealed = BASE64
            .decode(&self.content)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        decrypt(&key, &sealed)
    }

    pub fn open_json<T: DeserializeOwned>(
        &self,
        secret: &StaticSecret,
        fingerprint: &str,
    ) -> Result<T, CryptoError> {
        Ok(serde_json::from_slice(&self.open(secret, fingerprint)?)?)
    }
}
