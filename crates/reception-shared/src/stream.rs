//! Streaming authenticated encryption for uploaded files.
//!
//! Plaintext is fed in arbitrary chunks and sealed as fixed 64 KiB
//! XChaCha20-Poly1305 STREAM segments (big-endian 32-bit counter). The
//! symmetric key is derived from an ephemeral X25519 exchange with the
//! owner's public key, so the owner can always recover it from the header.
//! A BLAKE3 digest runs over every ciphertext byte emitted and becomes the
//! content id of the encrypted file.
//!
//! Header layout: `ephemeral_public (32) || stream_nonce (19)`.

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::stream::{DecryptorBE32, EncryptorBE32};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{
    KDF_CONTEXT_STREAM_KEY, PUBKEY_SIZE, STREAM_BLOCK_SIZE, STREAM_NONCE_SIZE, TAG_SIZE,
};
use crate::crypto::{derive_key, SymmetricKey};
use crate::error::CryptoError;

pub const HEADER_SIZE: usize = PUBKEY_SIZE + STREAM_NONCE_SIZE;

const SEALED_SEGMENT_SIZE: usize = STREAM_BLOCK_SIZE + TAG_SIZE;

/// Everything known about an encrypted stream once it is finalized.
#[derive(Clone)]
pub struct StreamSeal {
    pub key: SymmetricKey,
    pub header: Vec<u8>,
    /// BLAKE3 hex digest of the full ciphertext.
    pub content_id: String,
}

impl std::fmt::Debug for StreamSeal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSeal")
            .field("header", &hex::encode(&self.header))
            .field("content_id", &self.content_id)
            .finish_non_exhaustive()
    }
}

pub struct StreamEncryptor {
    encryptor: EncryptorBE32<XChaCha20Poly1305>,
    buffer: Vec<u8>,
    digest: blake3::Hasher,
    key: SymmetricKey,
    header: Vec<u8>,
}

impl StreamEncryptor {
    /// Start a stream readable by the holder of `owner_public_key`.
    pub fn new(owner_public_key: &[u8; 32]) -> Self {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&PublicKey::from(*owner_public_key));
        let key = derive_key(
            KDF_CONTEXT_STREAM_KEY,
            &[&shared.as_bytes()[..], &ephemeral_public.as_bytes()[..]],
        );

        let mut nonce = [0u8; STREAM_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let aead = XChaCha20Poly1305::new((&key).into());
        let encryptor = EncryptorBE32::from_aead(aead, GenericArray::from_slice(&nonce));

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(ephemeral_public.as_bytes());
        header.extend_from_slice(&nonce);

        Self {
            encryptor,
            buffer: Vec::with_capacity(STREAM_BLOCK_SIZE),
            digest: blake3::Hasher::new(),
            key,
            header,
        }
    }

    /// Feed plaintext, returning the ciphertext segments completed so far.
    pub fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.buffer.extend_from_slice(data);

        let mut output = Vec::new();
        // Strictly greater: the last block is always left for `finalize`.
        while self.buffer.len() > STREAM_BLOCK_SIZE {
            let segment = self
                .encryptor
                .encrypt_next(&self.buffer[..STREAM_BLOCK_SIZE])
                .map_err(|_| CryptoError::EncryptionFailed)?;
            self.buffer.drain(..STREAM_BLOCK_SIZE);
            output.extend_from_slice(&segment);
        }

        self.digest.update(&output);
        Ok(output)
    }

    /// Seal the remaining plaintext as the final segment.
    pub fn finalize(self) -> Result<(Vec<u8>, StreamSeal), CryptoError> {
        let Self {
            encryptor,
            buffer,
            mut digest,
            key,
            header,
        } = self;

        let last = encryptor
            .encrypt_last(buffer.as_slice())
            .map_err(|_| CryptoError::EncryptionFailed)?;
        digest.update(&last);

        let seal = StreamSeal {
            key,
            header,
            content_id: digest.finalize().to_hex().to_string(),
        };
        Ok((last, seal))
    }
}

/// Recover the stream key from its header with the owner's secret.
pub fn recover_key(owner: &StaticSecret, header: &[u8]) -> Result<SymmetricKey, CryptoError> {
    let ephemeral_public = parse_header(header)?.0;
    let shared = owner.diffie_hellman(&ephemeral_public);
    Ok(derive_key(
        KDF_CONTEXT_STREAM_KEY,
        &[&shared.as_bytes()[..], &ephemeral_public.as_bytes()[..]],
    ))
}

pub struct StreamDecryptor {
    decryptor: DecryptorBE32<XChaCha20Poly1305>,
    buffer: Vec<u8>,
}

impl StreamDecryptor {
    pub fn new(key: &SymmetricKey, header: &[u8]) -> Result<Self, CryptoError> {
        let (_, nonce) = parse_header(header)?;
        let aead = XChaCha20Poly1305::new(key.into());
        Ok(Self {
            decryptor: DecryptorBE32::from_aead(aead, GenericArray::from_slice(nonce)),
            buffer: Vec::with_capacity(SEALED_SEGMENT_SIZE),
        })
    }

    pub fn update(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.buffer.extend_from_slice(data);

        let mut output = Vec::new();
        while self.buffer.len() > SEALED_SEGMENT_SIZE {
            let plain = self
                .decryptor
                .decrypt_next(&self.buffer[..SEALED_SEGMENT_SIZE])
                .map_err(|_| CryptoError::DecryptionFailed)?;
            self.buffer.drain(..SEALED_SEGMENT_SIZE);
            output.extend_from_slice(&plain);
        }
        Ok(output)
    }

    pub fn finalize(self) -> Result<Vec<u8>, CryptoError> {
        self.decryptor
            .decrypt_last(self.buffer.as_slice())
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Decrypt a complete ciphertext in one call.
pub fn open_stream(
    key: &SymmetricKey,
    header: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut decryptor = StreamDecryptor::new(key, header)?;
    let mut plaintext = decryptor.update(ciphertext)?;
    plaintext.extend_from_slice(&decryptor.finalize()?);
    Ok(plaintext)
}

fn parse_header(header: &[u8]) -> Result<(PublicKey, &[u8]), CryptoError> {
    if header.len() != HEADER_SIZE {
        return Err(CryptoError::InvalidHeader {
            expected: HEADER_SIZE,
            actual: header.len(),
        });
    }
    let (public, nonce) = header.split_at(PUBKEY_SIZE);
    let mut bytes = [0u8; PUBKEY_SIZE];
    bytes.copy_from_slice(public);
    Ok((PublicKey::from(bytes), nonce))
}
