//! Session Key Material
//!
//! Generates the per-submission symmetric key and derives the IV sequence
//! used for every file of the submission.
//!
//! ## Key Model
//!
//! - One fresh AES-256 key per submission, from the OS CSPRNG
//! - The key only leaves the device wrapped under the form's RSA public key
//! - Keys are zeroized on drop
//!
//! ## IV Sequence
//!
//! ```text
//! seed  = MD5(instance_id || key)          (16 bytes)
//! file n: seed[n % 16] += 1; iv_n = seed
//! ```
//!
//! Every file of the session gets the next IV. The server replays the same
//! sequence, in manifest order, so this must stay bit-for-bit stable.

use crate::error::{EncryptionError, Result};
use md5::{Digest, Md5};
use rand_core::{OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-256 key size
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// AES block / IV size
pub const IV_SIZE: usize = 16;

/// Per-submission AES-256 key
///
/// Zeroized on drop for security
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build from a slice of unknown length (e.g. an unwrapped RSA payload)
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SYMMETRIC_KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|_| EncryptionError::InvalidKeyLength {
                    expected: SYMMETRIC_KEY_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Source of fresh symmetric keys.
pub trait KeySource {
    fn generate(&self) -> Result<SymmetricKey>;
}

/// Operating-system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeySource;

impl KeySource for OsKeySource {
    fn generate(&self) -> Result<SymmetricKey> {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| EncryptionError::CryptoUnavailable(format!("secure random: {e}")))?;
        let key = SymmetricKey::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }
}

/// Replays a known key. Used to reproduce a session byte-for-byte.
#[derive(Debug, Clone)]
pub struct FixedKeySource {
    key: SymmetricKey,
}

impl FixedKeySource {
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }
}

impl KeySource for FixedKeySource {
    fn generate(&self) -> Result<SymmetricKey> {
        Ok(self.key.clone())
    }
}

/// IV seed: `MD5(instance_id || key)`, repeated/truncated to 16 bytes.
pub fn derive_iv_seed(instance_id: &str, key: &SymmetricKey) -> [u8; IV_SIZE] {
    let mut hasher = Md5::new();
    hasher.update(instance_id.as_bytes());
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();

    let mut seed = [0u8; IV_SIZE];
    for (i, byte) in seed.iter_mut().enumerate() {
        *byte = digest[i % digest.len()];
    }
    seed
}

/// Rotating byte counter over the IV seed.
#[derive(Clone, PartialEq, Eq)]
pub struct IvSequence {
    seed: [u8; IV_SIZE],
    counter: usize,
}

impl IvSequence {
    pub fn new(seed: [u8; IV_SIZE]) -> Self {
        Self { seed, counter: 0 }
    }

    pub fn for_instance(instance_id: &str, key: &SymmetricKey) -> Self {
        Self::new(derive_iv_seed(instance_id, key))
    }

    /// Bump one byte of the seed and hand out the result.
    pub fn next_iv(&mut self) -> [u8; IV_SIZE] {
        let slot = self.counter % IV_SIZE;
        self.seed[slot] = self.seed[slot].wrapping_add(1);
        self.counter += 1;
        self.seed
    }

    /// Number of IVs handed out so far
    pub fn issued(&self) -> usize {
        self.counter
    }

    pub fn current(&self) -> &[u8; IV_SIZE] {
        &self.seed
    }
}

impl std::fmt::Debug for IvSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IvSequence")
            .field("issued", &self.counter)
            .finish_non_exhaustive()
    }
}
