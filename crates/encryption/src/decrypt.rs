//! Server-side decryption of an encrypted submission.
//!
//! Replays the device's session from the manifest: unwrap the key with the
//! form's private key, rebuild the IV sequence from the instance ID, decrypt
//! media in manifest order and `submission.xml.enc` last, then check the
//! element signature against the recovered plaintext digests.
//!
//! Plaintexts are written to `out_dir` before the signature check. On
//! [`EncryptionError::SignatureMismatch`] the contents of `out_dir` must not
//! be trusted.

use crate::cipher;
use crate::envelope;
use crate::error::{EncryptionError, Result};
use crate::keymaterial::{IvSequence, SymmetricKey, IV_SIZE};
use crate::manifest::EncryptedManifest;
use crate::signature::SignatureSource;
use common::{plaintext_name, SUBMISSION_XML};
use rsa::RsaPrivateKey;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecryptedFile {
    pub name: String,
    pub path: PathBuf,
    pub plaintext_md5: String,
    pub plaintext_len: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecryptedSubmission {
    pub manifest: EncryptedManifest,
    pub media: Vec<DecryptedFile>,
    pub submission: DecryptedFile,
}

#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn decrypt_submission(
    dir: &Path,
    private_key: &RsaPrivateKey,
    out_dir: &Path,
) -> Result<DecryptedSubmission> {
    let manifest = EncryptedManifest::read_from(&dir.join(SUBMISSION_XML))?;
    let key = envelope::unwrap_key(private_key, &manifest.base64_encrypted_key)?;

    let mut ivs = IvSequence::for_instance(&manifest.instance_id, &key);
    let mut source = SignatureSource::for_submission(
        &manifest.form_id,
        manifest.form_version.as_deref(),
        &manifest.base64_encrypted_key,
        &manifest.instance_id,
    );

    fs::create_dir_all(out_dir)?;

    let mut media = Vec::with_capacity(manifest.media.len());
    for encrypted in &manifest.media {
        let file = decrypt_file(dir, encrypted, out_dir, &key, &ivs.next_iv())?;
        source.append_file(&file.name, &file.plaintext_md5);
        media.push(file);
    }

    let submission = decrypt_file(
        dir,
        &manifest.encrypted_xml_file,
        out_dir,
        &key,
        &ivs.next_iv(),
    )?;
    source.append_file(&submission.name, &submission.plaintext_md5);

    source.verify_signature(private_key, &manifest.base64_signature)?;

    info!(
        form_id = %manifest.form_id,
        instance_id = %manifest.instance_id,
        files = media.len() + 1,
        "submission decrypted and signature verified"
    );

    Ok(DecryptedSubmission {
        manifest,
        media,
        submission,
    })
}

/// Names in a manifest must be bare `*.enc` file names inside the submission.
fn checked_plaintext_name(encrypted: &str) -> Result<&str> {
    let is_bare = Path::new(encrypted)
        .file_name()
        .is_some_and(|n| n == encrypted);
    match plaintext_name(encrypted) {
        Some(name) if is_bare => Ok(name),
        _ => Err(EncryptionError::ManifestParse(format!(
            "unexpected encrypted file name {encrypted:?}"
        ))),
    }
}

fn decrypt_file(
    dir: &Path,
    encrypted: &str,
    out_dir: &Path,
    key: &SymmetricKey,
    iv: &[u8; IV_SIZE],
) -> Result<DecryptedFile> {
    let name = checked_plaintext_name(encrypted)?;
    let input_path = dir.join(encrypted);
    let output_path = out_dir.join(name);

    let wrap = |source: std::io::Error| EncryptionError::FileDecryption {
        path: input_path.clone(),
        source,
    };

    let input = File::open(&input_path).map_err(wrap)?;
    let output = File::create(&output_path).map_err(wrap)?;
    let digest = cipher::decrypt_stream(BufReader::new(input), BufWriter::new(output), key, iv)
        .map_err(|e| match e {
            EncryptionError::IoError(source) => wrap(source),
            other => other,
        })?;

    debug!(file = %name, plaintext_len = digest.plaintext_len, "file decrypted");

    Ok(DecryptedFile {
        name: name.to_string(),
        path: output_path,
        plaintext_md5: digest.md5_hex(),
        plaintext_len: digest.plaintext_len,
    })
}
