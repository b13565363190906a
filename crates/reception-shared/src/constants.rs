/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// STREAM nonce prefix size for XChaCha20-Poly1305 (24 - 5 bytes of counter/flag)
pub const STREAM_NONCE_SIZE: usize = 19;

/// Plaintext bytes sealed per STREAM segment (64 KiB)
pub const STREAM_BLOCK_SIZE: usize = 64 * 1024;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Cipher format tag recorded in file descriptors
pub const CIPHER_FORMAT: &str = "xchacha20poly1305-stream";

/// Domain of the key custodian service
pub const DOMAIN_KEY_CUSTODIAN: &str = "MaitreDesCles";

/// Domain of the messaging service
pub const DOMAIN_MESSAGES: &str = "Messages";

/// Broker action used to post a message
pub const ACTION_POST_MESSAGE: &str = "posterV1";

/// Broker action used to register file keys with the custodian
pub const ACTION_ADD_DOMAIN_KEY: &str = "ajouterCleDomaines";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_STREAM_KEY: &str = "reception-stream-key-v1";
pub const KDF_CONTEXT_KEY_WRAP: &str = "reception-key-wrap-v1";
pub const KDF_CONTEXT_DOMAIN_SIGNATURE: &str = "reception-domain-signature-v1";
