//! # Submission Encryption
//!
//! Envelope encryption of finalized form submissions before they leave the
//! device, plus the server-side counterpart used to verify and open them.
//!
//! ## Features
//!
//! - **AES-256-CFB**: Per-file stream encryption with PKCS#5 padding
//! - **Counter IVs**: One IV per file from an MD5 seed over instance ID and key
//! - **RSA-OAEP Key Wrap**: Session key wrapped under the form's public key
//! - **Element Signature**: MD5 over the ordered artifact list, RSA-OAEP encrypted
//! - **Manifest**: `submission.xml` replaced by an encrypted-submission manifest
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use common::FormRecord;
//! use encryption::{finalize_submission, EncryptOptions, FinalizeOutcome};
//!
//! let form = FormRecord::new("household_survey")?.with_public_key(base64_key);
//!
//! match finalize_submission(dir, &form, &EncryptOptions::default())? {
//!     FinalizeOutcome::Plaintext => println!("form has no key, sending as is"),
//!     FinalizeOutcome::Encrypted(report) => {
//!         println!("{} files encrypted", report.stats.files_encrypted);
//!     }
//! }
//! ```
//!
//! ## Security Considerations
//!
//! - **Key Handling**: The symmetric key exists only in memory and is zeroized on drop
//! - **Ordering**: Media are encrypted before `submission.xml`; the signature depends on it
//! - **No Rollback**: A failed pass leaves `.enc` files behind; retry with a new session
//! - **IV Scheme**: The rotating-byte IV counter is kept bit-exact for server compatibility
//!
//! ## Architecture
//!
//! ```text
//! pipeline::encrypt_submission
//!     ↓ (one per submission)
//! session::EncryptedFormSession
//!     ↓ (uses)
//! - keymaterial (key, IV sequence)
//! - envelope    (RSA-OAEP)
//! - cipher      (AES-256-CFB streams)
//! - signature   (ordered source, digest)
//!     ↓ (produces)
//! manifest::EncryptedManifest → submission.xml
//! ```

// Module declarations
pub mod cipher;
pub mod decrypt;
pub mod envelope;
pub mod error;
pub mod instance;
pub mod keymaterial;
pub mod manifest;
pub mod pipeline;
pub mod session;
pub mod signature;

// Re-exports for convenience
pub use cipher::{decrypt_stream, encrypt_stream, StreamDigest, BLOCK_SIZE};
pub use decrypt::{decrypt_submission, DecryptedFile, DecryptedSubmission};
pub use envelope::{load_private_key_pem, parse_public_key, private_key_from_env, PRIVATE_KEY_ENV};
pub use error::{EncryptionError, Result};
pub use instance::read_instance_id;
pub use keymaterial::{FixedKeySource, IvSequence, KeySource, OsKeySource, SymmetricKey};
pub use manifest::EncryptedManifest;
pub use pipeline::{
    encrypt_submission, encrypt_submission_with, finalize_submission, EncryptOptions,
    EncryptionStats, FinalizeOutcome, SubmissionReport,
};
pub use session::{EncryptedFile, EncryptedFormSession};
pub use signature::SignatureSource;

pub use rsa::{RsaPrivateKey, RsaPublicKey};

/// Encryption crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Symmetric key length (AES-256)
pub const SYMMETRIC_KEY_LENGTH: usize = keymaterial::SYMMETRIC_KEY_SIZE;

/// IV length (one AES block)
pub const IV_LENGTH: usize = keymaterial::IV_SIZE;
