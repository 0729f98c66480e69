use std::path::PathBuf;

use thiserror::Error;

/// Encryption-related errors
///
/// Every variant is fatal to the session that raised it. Nothing is retried
/// internally: callers rebuild a fresh session and start over. Messages never
/// carry key material.
#[derive(Error, Debug)]
pub enum EncryptionError {
    /// Missing randomness, hash or cipher provider on this platform.
    #[error("Crypto provider unavailable: {0}")]
    CryptoUnavailable(String),

    /// I/O or cipher failure on a single submission file. Already written
    /// `.enc` siblings are left in place.
    #[error("Failed to encrypt {}: {source}", path.display())]
    FileEncryption {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Signature computation failed: {0}")]
    SignatureComputation(String),

    /// Manifest serialization or write failure. Encrypted attachments stay on disk.
    #[error("Failed to write manifest {}: {source}", path.display())]
    ManifestWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Key management errors
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Form {form_id} has no public key and is not eligible for encryption")]
    NotEncryptionEligible { form_id: String },

    #[error("Missing instance ID")]
    MissingInstanceId,

    /// Server-side (decryption) errors
    #[error("Key unwrap failed: {0}")]
    KeyUnwrap(String),

    #[error("Failed to decrypt {}: {source}", path.display())]
    FileDecryption {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid ciphertext length: {0}")]
    InvalidCiphertextLength(u64),

    #[error("Invalid padding in decrypted stream")]
    InvalidPadding,

    #[error("Malformed manifest: {0}")]
    ManifestParse(String),

    #[error("Manifest signature does not match submission contents")]
    SignatureMismatch,

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for encryption operations
pub type Result<T> = std::result::Result<T, EncryptionError>;

impl From<common::CommonError> for EncryptionError {
    fn from(err: common::CommonError) -> Self {
        match err {
            common::CommonError::EmptyInstanceId => EncryptionError::MissingInstanceId,
            other => EncryptionError::InvalidConfiguration(other.to_string()),
        }
    }
}
