//! Per-submission encryption session.
//!
//! One session covers one encrypt-and-manifest pass over a submission
//! directory. It owns the symmetric key, the IV sequence and the signature
//! source; nothing is shared between sessions and nothing survives a failure.
//! Retrying means building a fresh session.

use crate::cipher;
use crate::envelope;
use crate::error::{EncryptionError, Result};
use crate::keymaterial::{IvSequence, KeySource, OsKeySource, SymmetricKey, IV_SIZE};
use crate::manifest::EncryptedManifest;
use crate::signature::SignatureSource;
use common::{encrypted_name, FormRecord, InstanceMetadata};
use rand_chacha::ChaCha20Rng;
use rsa::RsaPublicKey;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A plaintext file and its `.enc` sibling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptedFile {
    /// Plaintext file name, as recorded in the signature source
    pub name: String,
    pub original: PathBuf,
    pub encrypted: PathBuf,
    pub plaintext_md5: String,
    pub plaintext_len: u64,
    pub ciphertext_len: u64,
}

impl EncryptedFile {
    /// `photo.jpg.enc`
    pub fn encrypted_name(&self) -> String {
        encrypted_name(&self.name)
    }
}

pub struct EncryptedFormSession {
    form_id: String,
    form_version: Option<String>,
    instance_id: String,
    public_key: RsaPublicKey,
    key: SymmetricKey,
    iv_seed: [u8; IV_SIZE],
    ivs: IvSequence,
    oaep_rng: ChaCha20Rng,
    wrapped_key: String,
    signature_source: SignatureSource,
}

impl EncryptedFormSession {
    /// Session keyed from the OS CSPRNG.
    pub fn new(form: &FormRecord, instance_id: &str) -> Result<Self> {
        Self::with_key_source(form, instance_id, &OsKeySource)
    }

    pub fn with_key_source(
        form: &FormRecord,
        instance_id: &str,
        keys: &dyn KeySource,
    ) -> Result<Self> {
        let policy = form.encryption_policy();
        let base64_key =
            policy
                .public_key()
                .ok_or_else(|| EncryptionError::NotEncryptionEligible {
                    form_id: form.form_id().to_string(),
                })?;

        let instance = InstanceMetadata::new(instance_id)?;
        let public_key = envelope::parse_public_key(base64_key)?;

        let key = keys.generate()?;
        let ivs = IvSequence::for_instance(instance.instance_id(), &key);
        let iv_seed = *ivs.current();

        let mut oaep_rng = envelope::oaep_rng(&key);
        let wrapped_key = envelope::wrap_key(&public_key, &key, &mut oaep_rng)?;

        let signature_source = SignatureSource::for_submission(
            form.form_id(),
            form.form_version(),
            &wrapped_key,
            instance.instance_id(),
        );

        debug!(
            form_id = form.form_id(),
            instance_id = instance.instance_id(),
            algorithm = policy.algorithm_name(),
            "encryption session started"
        );

        Ok(Self {
            form_id: form.form_id().to_string(),
            form_version: form.form_version().map(str::to_owned),
            instance_id: instance.instance_id,
            public_key,
            key,
            iv_seed,
            ivs,
            oaep_rng,
            wrapped_key,
            signature_source,
        })
    }

    /// Encrypt one file to its `.enc` sibling and record it in the signature source.
    ///
    /// Call order is the manifest order: media first, `submission.xml` last.
    pub fn encrypt_file(&mut self, path: &Path) -> Result<EncryptedFile> {
        let wrap = |source: std::io::Error| EncryptionError::FileEncryption {
            path: path.to_path_buf(),
            source,
        };

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                wrap(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    "file name is not valid UTF-8",
                ))
            })?
            .to_string();
        let encrypted = path.with_file_name(encrypted_name(&name));

        let iv = self.ivs.next_iv();

        match fs::remove_file(&encrypted) {
            Ok(()) => warn!(file = %encrypted.display(), "replaced leftover encrypted file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(wrap(e)),
        }

        let digest = {
            let input = File::open(path).map_err(wrap)?;
            let output = File::create(&encrypted).map_err(wrap)?;
            cipher::encrypt_stream(
                BufReader::new(input),
                BufWriter::new(output),
                &self.key,
                &iv,
            )
            .map_err(wrap)?
        };

        let plaintext_md5 = digest.md5_hex();
        self.signature_source.append_file(&name, &plaintext_md5);

        debug!(
            file = %name,
            plaintext_len = digest.plaintext_len,
            ciphertext_len = digest.ciphertext_len,
            "file encrypted"
        );

        Ok(EncryptedFile {
            name,
            original: path.to_path_buf(),
            encrypted,
            plaintext_md5,
            plaintext_len: digest.plaintext_len,
            ciphertext_len: digest.ciphertext_len,
        })
    }

    /// `base64EncryptedElementSignature` over everything recorded so far.
    pub fn element_signature(&mut self) -> Result<String> {
        self.signature_source
            .encrypt_signature(&self.public_key, &mut self.oaep_rng)
    }

    /// Sign and assemble the manifest for the recorded files.
    pub fn manifest(
        &mut self,
        media: Vec<String>,
        encrypted_xml_file: String,
    ) -> Result<EncryptedManifest> {
        let base64_signature = self.element_signature()?;
        Ok(EncryptedManifest {
            form_id: self.form_id.clone(),
            form_version: self.form_version.clone(),
            base64_encrypted_key: self.wrapped_key.clone(),
            instance_id: self.instance_id.clone(),
            media,
            encrypted_xml_file,
            base64_signature,
        })
    }

    pub fn form_id(&self) -> &str {
        &self.form_id
    }

    pub fn form_version(&self) -> Option<&str> {
        self.form_version.as_deref()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn wrapped_key(&self) -> &str {
        &self.wrapped_key
    }

    /// IV seed as derived at session start (before any file bumped it)
    pub fn iv_seed(&self) -> &[u8; IV_SIZE] {
        &self.iv_seed
    }

    pub fn files_encrypted(&self) -> usize {
        self.ivs.issued()
    }

    pub fn signature_source(&self) -> &SignatureSource {
        &self.signature_source
    }
}

impl std::fmt::Debug for EncryptedFormSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFormSession")
            .field("form_id", &self.form_id)
            .field("form_version", &self.form_version)
            .field("instance_id", &self.instance_id)
            .field("key", &self.key)
            .field("files_encrypted", &self.ivs.issued())
            .finish_non_exhaustive()
    }
}
