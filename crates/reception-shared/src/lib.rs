//! Cryptographic building blocks shared by the reception service: stream
//! encryption of uploads, per-recipient key wrapping, domain binding of
//! keys and multi-recipient message envelopes.

pub mod certificate;
pub mod constants;
pub mod crypto;
pub mod domain_signature;
pub mod envelope;
pub mod error;
pub mod keywrap;
pub mod stream;

pub use certificate::RecipientCertificate;
pub use crypto::SymmetricKey;
pub use domain_signature::DomainSignature;
pub use envelope::EncryptedMessage;
pub use error::CryptoError;
pub use stream::{StreamEncryptor, StreamSeal};
