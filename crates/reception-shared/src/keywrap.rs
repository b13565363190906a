//! Asymmetric wrapping of per-upload symmetric keys.
//!
//! Each wrap runs an ephemeral X25519 exchange against the recipient's
//! public key, derives a key-encryption key with BLAKE3 and seals the
//! symmetric key with XChaCha20-Poly1305.
//!
//! Wire format: `ephemeral_public (32) || nonce (24) || ciphertext+tag`.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::certificate::RecipientCertificate;
use crate::constants::{KDF_CONTEXT_KEY_WRAP, PUBKEY_SIZE};
use crate::crypto::{decrypt, derive_key, encrypt, SymmetricKey};
use crate::error::CryptoError;

/// Wrap `key` for the holder of `certificate`.
///
/// Returns the wrapped bytes together with the certificate fingerprint so
/// callers can key their wrap map without recomputing it.
pub fn wrap_key(
    certificate: &RecipientCertificate,
    key: &SymmetricKey,
) -> Result<(Vec<u8>, String), CryptoError> {
    let recipient = PublicKey::from(certificate.public_key);
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(&recipient);
    let kek = derive_key(
        KDF_CONTEXT_KEY_WRAP,
        &[
            &shared.as_bytes()[..],
            &ephemeral_public.as_bytes()[..],
            &recipient.as_bytes()[..],
        ],
    );

    let sealed = encrypt(&kek, key)?;
    let mut wrapped = Vec::with_capacity(PUBKEY_SIZE + sealed.len());
    wrapped.extend_from_slice(ephemeral_public.as_bytes());
    wrapped.extend_from_slice(&sealed);

    Ok((wrapped, certificate.fingerprint()))
}

/// Recover a symmetric key wrapped with [`wrap_key`].
pub fn unwrap_key(secret: &StaticSecret, wrapped: &[u8]) -> Result<SymmetricKey, CryptoError> {
    if wrapped.len() <= PUBKEY_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (ephemeral_bytes, sealed) = wrapped.split_at(PUBKEY_SIZE);
    let mut ephemeral = [0u8; PUBKEY_SIZE];
    ephemeral.copy_from_slice(ephemeral_bytes);
    let ephemeral_public = PublicKey::from(ephemeral);
    let own_public = PublicKey::from(secret);

    let shared = secret.diffie_hellman(&ephemeral_public);
    let kek = derive_key(
        KDF_CONTEXT_KEY_WRAP,
        &[
            &shared.as_bytes()[..],
            &ephemeral_public.as_bytes()[..],
            &own_public.as_bytes()[..],
        ],
    );

    let key = decrypt(&kek, sealed)?;
    key.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}
