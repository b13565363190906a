use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};

use crate::constants::KDF_CONTEXT_DOMAIN_SIGNATURE;
use crate::crypto::{derive_key, SymmetricKey};

const SIGNATURE_VERSION: u8 = 1;

/// Declares which service domains may unwrap a symmetric key.
///
/// The signing key is derived from the symmetric key itself, so only a
/// holder of the key can produce (or check) the binding. The key reference
/// used everywhere else to name the key is a digest of the signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainSignature {
    pub version: u8,
    pub domains: Vec<String>,
    /// Stream header or other public material the key was derived with, hex.
    pub key_material: String,
    /// Ed25519 signature, hex.
    pub signature: String,
}

impl DomainSignature {
    pub fn sign(key: &SymmetricKey, domains: &[&str], key_material: &[u8]) -> Self {
        let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
        let signing_key = signing_key(key);
        let signature = signing_key.sign(&binding_digest(&domains, key_material));

        Self {
            version: SIGNATURE_VERSION,
            domains,
            key_material: hex::encode(key_material),
            signature: hex::encode(signature.to_bytes()),
        }
    }

    /// Stable name for the bound key.
    pub fn key_reference(&self) -> String {
        blake3::hash(self.signature.as_bytes()).to_hex().to_string()
    }

    pub fn verify(&self, key: &SymmetricKey) -> bool {
        let Ok(material) = hex::decode(&self.key_material) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(&self.signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&sig_bytes) else {
            return false;
        };

        signing_key(key)
            .verifying_key()
            .verify(&binding_digest(&self.domains, &material), &signature)
            .is_ok()
    }
}

fn signing_key(key: &SymmetricKey) -> SigningKey {
    SigningKey::from_bytes(&derive_key(KDF_CONTEXT_DOMAIN_SIGNATURE, &[&key[..]]))
}

// domains are NUL-separated so ["ab", "c"] and ["a", "bc"] differ
fn binding_digest(domains: &[String], key_material: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for domain in domains {
        hasher.update(domain.as_bytes());
        hasher.update(&[0u8]);
    }
    hasher.update(key_material);
    *hasher.finalize().as_bytes()
}
