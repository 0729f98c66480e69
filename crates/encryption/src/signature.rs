//! Manifest Signature
//!
//! Tamper evidence for an encrypted submission. Every encrypted artifact is
//! described, in a fixed order, in a text buffer:
//!
//! ```text
//! formId\n
//! formVersion\n            (only when the form has a version)
//! base64EncryptedKey\n
//! instanceId\n
//! <file>::<md5 hex>\n      (one per file, in encryption order, submission.xml last)
//! ```
//!
//! The MD5 of that text is RSA-OAEP encrypted under the form's public key.
//! Only the private-key holder can open it and compare it with its own
//! rebuild of the buffer, so any reordering, renaming or content change is
//! detected server side.

use crate::envelope;
use crate::error::{EncryptionError, Result};
use md5::{Digest, Md5};
use rand_core::CryptoRngCore;
use rsa::{RsaPrivateKey, RsaPublicKey};
use subtle::ConstantTimeEq;

/// MD5 digest size
pub const DIGEST_SIZE: usize = 16;

/// Ordered signature source text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureSource {
    text: String,
    entries: usize,
}

impl SignatureSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header shared by every submission, in the mandated order.
    pub fn for_submission(
        form_id: &str,
        form_version: Option<&str>,
        wrapped_key: &str,
        instance_id: &str,
    ) -> Self {
        let mut source = Self::new();
        source.append(form_id);
        if let Some(version) = form_version {
            source.append(version);
        }
        source.append(wrapped_key);
        source.append(instance_id);
        source
    }

    pub fn append(&mut self, value: &str) {
        self.text.push_str(value);
        self.text.push('\n');
        self.entries += 1;
    }

    /// `name::md5hex`
    pub fn append_file(&mut self, file_name: &str, md5_hex: &str) {
        self.append(&format!("{file_name}::{md5_hex}"));
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// MD5 over the UTF-8 text
    pub fn digest(&self) -> [u8; DIGEST_SIZE] {
        Md5::digest(self.text.as_bytes()).into()
    }

    /// `base64(RSA-OAEP-SHA256(MD5(text)))`
    pub fn encrypt_signature<R: CryptoRngCore>(
        &self,
        public_key: &RsaPublicKey,
        rng: &mut R,
    ) -> Result<String> {
        envelope::encrypt_to_base64(public_key, &self.digest(), rng)
            .map_err(|e| EncryptionError::SignatureComputation(e.to_string()))
    }

    /// Server side: open `signature` and compare it with this buffer's digest.
    pub fn verify_signature(&self, private_key: &RsaPrivateKey, signature: &str) -> Result<()> {
        let opened = envelope::decrypt_from_base64(private_key, signature)
            .map_err(|_| EncryptionError::SignatureMismatch)?;
        let expected = self.digest();

        if opened.len() == DIGEST_SIZE && bool::from(opened.as_slice().ct_eq(&expected)) {
            Ok(())
        } else {
            Err(EncryptionError::SignatureMismatch)
        }
    }
}
