use serde::{Deserialize, Serialize};

/// Public encryption certificate of a recipient domain.
///
/// Only the X25519 public key and the declared domain list matter here: the
/// certificate is used for asymmetric key wrapping and nothing else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientCertificate {
    /// X25519 public key, hex on the wire.
    #[serde(with = "hex::serde")]
    pub public_key: [u8; 32],
    /// Logical service domains this certificate speaks for.
    pub domains: Vec<String>,
}

impl RecipientCertificate {
    pub fn new(public_key: [u8; 32], domains: Vec<String>) -> Self {
        Self {
            public_key,
            domains,
        }
    }

    /// Stable identifier: BLAKE3 of the public key, hex encoded.
    pub fn fingerprint(&self) -> String {
        blake3::hash(&self.public_key).to_hex().to_string()
    }

    pub fn declares(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d == domain)
    }

    pub fn declares_any(&self, domains: &[&str]) -> bool {
        domains.iter().any(|d| self.declares(d))
    }
}
