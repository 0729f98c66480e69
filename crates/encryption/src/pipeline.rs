//! Submission encryption pipeline
//!
//! Drives a session over a whole instance directory:
//!
//! ```text
//! submission dir
//!     ↓ (list, drop stale .enc, sort by name)
//! media files ──encrypt──► name.enc        (IV 1..n)
//! submission.xml ─encrypt─► submission.xml.enc   (IV n+1)
//!     ↓
//! signature + manifest ──► submission.xml (replaced)
//! ```
//!
//! The pass is synchronous and runs to completion or stops at the first
//! error. Nothing is rolled back: `.enc` files already written stay on disk
//! and the caller retries with a fresh session.

use crate::error::{EncryptionError, Result};
use crate::instance::parse_instance_id;
use crate::keymaterial::{KeySource, OsKeySource};
use crate::manifest::EncryptedManifest;
use crate::session::{EncryptedFile, EncryptedFormSession};
use common::{FormRecord, ENCRYPTED_SUFFIX, SUBMISSION_XML};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Caller-supplied knobs for one pass.
#[derive(Debug, Clone, Default)]
pub struct EncryptOptions {
    /// Use this instead of reading `instanceID` from submission.xml
    pub instance_id: Option<String>,
    /// File names left untouched (neither encrypted nor deleted)
    pub retain: Vec<String>,
}

impl EncryptOptions {
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn retain(mut self, name: impl Into<String>) -> Self {
        self.retain.push(name.into());
        self
    }
}

/// Byte and file totals of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EncryptionStats {
    pub files_encrypted: usize,
    pub stale_files_removed: usize,
    pub plaintext_bytes: u64,
    pub ciphertext_bytes: u64,
}

impl EncryptionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, file: &EncryptedFile) {
        self.files_encrypted += 1;
        self.plaintext_bytes += file.plaintext_len;
        self.ciphertext_bytes += file.ciphertext_len;
    }

    pub fn add_stale(&mut self) {
        self.stale_files_removed += 1;
    }

    /// Padding overhead as a fraction of plaintext (0.0 when nothing was read)
    pub fn overhead_ratio(&self) -> f64 {
        if self.plaintext_bytes == 0 {
            return 0.0;
        }
        (self.ciphertext_bytes - self.plaintext_bytes) as f64 / self.plaintext_bytes as f64
    }
}

/// Outcome of a completed pass.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionReport {
    pub form_id: String,
    pub instance_id: String,
    pub media: Vec<EncryptedFile>,
    pub submission: EncryptedFile,
    pub manifest_path: PathBuf,
    pub stats: EncryptionStats,
}

/// Result of the finalize gate.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    /// Form has no public key; the directory was not touched.
    Plaintext,
    Encrypted(SubmissionReport),
}

impl FinalizeOutcome {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, FinalizeOutcome::Encrypted(_))
    }
}

/// Only submissions of forms with a registered key are encrypted; anything
/// else is left as plaintext for the upload step.
#[instrument(skip_all, fields(form_id = form.form_id()))]
pub fn finalize_submission(
    dir: &Path,
    form: &FormRecord,
    options: &EncryptOptions,
) -> Result<FinalizeOutcome> {
    if !form.encryption_policy().is_enabled() {
        debug!("form has no public key, submission stays plaintext");
        return Ok(FinalizeOutcome::Plaintext);
    }
    encrypt_submission(dir, form, options).map(FinalizeOutcome::Encrypted)
}

/// Encrypt every file of a submission directory and replace submission.xml
/// with the manifest.
pub fn encrypt_submission(
    dir: &Path,
    form: &FormRecord,
    options: &EncryptOptions,
) -> Result<SubmissionReport> {
    encrypt_submission_with(dir, form, options, &OsKeySource)
}

#[instrument(skip_all, fields(form_id = form.form_id(), dir = %dir.display()))]
pub fn encrypt_submission_with(
    dir: &Path,
    form: &FormRecord,
    options: &EncryptOptions,
    keys: &dyn KeySource,
) -> Result<SubmissionReport> {
    let submission_path = dir.join(SUBMISSION_XML);
    if !submission_path.is_file() {
        return Err(EncryptionError::InvalidConfiguration(format!(
            "{} has no {SUBMISSION_XML}",
            dir.display()
        )));
    }

    let xml = fs::read_to_string(&submission_path).map_err(|source| {
        EncryptionError::FileEncryption {
            path: submission_path.clone(),
            source,
        }
    })?;
    // the plaintext behind a manifest only exists as .enc files now
    if EncryptedManifest::is_manifest(&xml) {
        return Err(EncryptionError::InvalidConfiguration(
            "submission already encrypted".to_string(),
        ));
    }

    let instance_id = match &options.instance_id {
        Some(id) => id.clone(),
        None => parse_instance_id(&xml)?,
    };

    let mut session = EncryptedFormSession::with_key_source(form, &instance_id, keys)?;

    let mut stats = EncryptionStats::new();
    let media_paths = collect_media(dir, &options.retain, &mut stats)?;

    let mut media = Vec::with_capacity(media_paths.len());
    for path in &media_paths {
        let file = session.encrypt_file(path)?;
        stats.add_file(&file);
        media.push(file);
    }

    let submission = session.encrypt_file(&submission_path)?;
    stats.add_file(&submission);

    let manifest = session.manifest(
        media.iter().map(EncryptedFile::encrypted_name).collect(),
        submission.encrypted_name(),
    )?;
    manifest.write_to(&submission_path)?;

    info!(
        instance_id = %instance_id,
        files = stats.files_encrypted,
        plaintext_bytes = stats.plaintext_bytes,
        ciphertext_bytes = stats.ciphertext_bytes,
        "submission encrypted"
    );

    Ok(SubmissionReport {
        form_id: form.form_id().to_string(),
        instance_id,
        media,
        submission,
        manifest_path: submission_path,
        stats,
    })
}

/// Media files of the submission, sorted by name. Stale `.enc` files are
/// deleted on the way.
fn collect_media(
    dir: &Path,
    retain: &[String],
    stats: &mut EncryptionStats,
) -> Result<Vec<PathBuf>> {
    let listing_error = |path: &Path, source| EncryptionError::FileEncryption {
        path: path.to_path_buf(),
        source,
    };
    let mut media = Vec::new();

    for entry in fs::read_dir(dir).map_err(|e| listing_error(dir, e))? {
        let entry = entry.map_err(|e| listing_error(dir, e))?;
        let path = entry.path();

        // symlinks are followed so a link to a directory is skipped too
        let file_type = entry.file_type().map_err(|e| listing_error(&path, e))?;
        if file_type.is_dir() || (file_type.is_symlink() && path.is_dir()) {
            continue;
        }

        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => {
                return Err(EncryptionError::FileEncryption {
                    path,
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "file name is not valid UTF-8",
                    ),
                })
            }
        };

        if name == SUBMISSION_XML || retain.iter().any(|r| *r == name) {
            continue;
        }

        if name.ends_with(ENCRYPTED_SUFFIX) {
            warn!(file = %name, "removing stale encrypted file");
            fs::remove_file(&path).map_err(|e| listing_error(&path, e))?;
            stats.add_stale();
            continue;
        }

        media.push((name, path));
    }

    media.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    Ok(media.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::test_keys::TEST_PUBLIC_B64;
    use tracing_test::traced_test;

    fn form() -> FormRecord {
        FormRecord::new("f1").unwrap().with_public_key(TEST_PUBLIC_B64)
    }

    fn submission_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        dir
    }

    #[test]
    fn test_media_sorted_bytewise() {
        let dir = submission_dir(&[
            ("submission.xml", "<data/>"),
            ("b.jpg", "b"),
            ("B.jpg", "B"),
            ("a.jpg", "a"),
        ]);
        let mut stats = EncryptionStats::new();
        let media = collect_media(dir.path(), &[], &mut stats).unwrap();

        let names: Vec<_> = media
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["B.jpg", "a.jpg", "b.jpg"]);
    }

    #[test]
    fn test_collect_skips_dirs_retained_and_stale() {
        let dir = submission_dir(&[
            ("submission.xml", "<data/>"),
            ("keep.txt", "keep"),
            ("old.jpg.enc", "stale"),
            ("photo.jpg", "ABC"),
        ]);
        fs::create_dir(dir.path().join("nested")).unwrap();

        let mut stats = EncryptionStats::new();
        let media = collect_media(dir.path(), &["keep.txt".to_string()], &mut stats).unwrap();

        assert_eq!(media, vec![dir.path().join("photo.jpg")]);
        assert_eq!(stats.stale_files_removed, 1);
        assert!(!dir.path().join("old.jpg.enc").exists());
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn test_listing_errors_name_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let mut stats = EncryptionStats::new();

        match collect_media(&missing, &[], &mut stats).unwrap_err() {
            EncryptionError::FileEncryption { path, source } => {
                assert_eq!(path, missing);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_collect_skips_symlinked_dirs() {
        let dir = submission_dir(&[("submission.xml", "<data/>"), ("photo.jpg", "ABC")]);
        let target = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(target.path(), dir.path().join("linked")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("photo.jpg"), dir.path().join("alias.jpg"))
            .unwrap();

        let mut stats = EncryptionStats::new();
        let media = collect_media(dir.path(), &[], &mut stats).unwrap();

        assert_eq!(
            media,
            vec![dir.path().join("alias.jpg"), dir.path().join("photo.jpg")]
        );
    }

    #[test]
    fn test_already_encrypted_submission_is_refused() {
        let dir = submission_dir(&[("submission.xml", "<data/>"), ("photo.jpg", "ABC")]);
        let options = EncryptOptions::default().with_instance_id("uuid-1");
        encrypt_submission(dir.path(), &form(), &options).unwrap();

        let manifest = fs::read(dir.path().join("submission.xml")).unwrap();
        let photo_enc = fs::read(dir.path().join("photo.jpg.enc")).unwrap();
        let xml_enc = fs::read(dir.path().join("submission.xml.enc")).unwrap();

        let err = encrypt_submission(dir.path(), &form(), &options).unwrap_err();
        match err {
            EncryptionError::InvalidConfiguration(msg) => {
                assert_eq!(msg, "submission already encrypted")
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(fs::read(dir.path().join("submission.xml")).unwrap(), manifest);
        assert_eq!(fs::read(dir.path().join("photo.jpg.enc")).unwrap(), photo_enc);
        assert_eq!(fs::read(dir.path().join("submission.xml.enc")).unwrap(), xml_enc);
        assert!(!dir.path().join("submission.xml.enc.enc").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_attachment_stops_before_submission() {
        let dir = submission_dir(&[("submission.xml", "<data/>"), ("a.jpg", "ABC")]);
        std::os::unix::fs::symlink(dir.path().join("missing"), dir.path().join("b.jpg")).unwrap();

        let err = encrypt_submission(
            dir.path(),
            &form(),
            &EncryptOptions::default().with_instance_id("uuid-1"),
        )
        .unwrap_err();

        match err {
            EncryptionError::FileEncryption { path, .. } => assert!(path.ends_with("b.jpg")),
            other => panic!("unexpected error: {other:?}"),
        }
        // no rollback: earlier output stays, the submission is still plaintext
        assert!(dir.path().join("a.jpg.enc").exists());
        assert!(!dir.path().join("submission.xml.enc").exists());
        assert_eq!(
            fs::read(dir.path().join("submission.xml")).unwrap(),
            b"<data/>"
        );
    }

    #[test]
    fn test_manifest_write_failure_keeps_encrypted_files() {
        let dir = submission_dir(&[("submission.xml", "<data/>"), ("a.jpg", "ABC")]);
        let mut session = EncryptedFormSession::new(&form(), "uuid-1").unwrap();
        let media = session.encrypt_file(&dir.path().join("a.jpg")).unwrap();
        let submission = session
            .encrypt_file(&dir.path().join(SUBMISSION_XML))
            .unwrap();
        let manifest = session
            .manifest(vec![media.encrypted_name()], submission.encrypted_name())
            .unwrap();

        let target = dir.path().join("gone").join(SUBMISSION_XML);
        let err = manifest.write_to(&target).unwrap_err();
        assert!(matches!(err, EncryptionError::ManifestWrite { .. }));

        assert!(dir.path().join("a.jpg.enc").exists());
        assert!(dir.path().join("submission.xml.enc").exists());
        assert_eq!(
            fs::read(dir.path().join("submission.xml")).unwrap(),
            b"<data/>"
        );
    }

    #[test]
    fn test_missing_submission_xml() {
        let dir = submission_dir(&[("photo.jpg", "ABC")]);
        let err = encrypt_submission(dir.path(), &form(), &EncryptOptions::default()).unwrap_err();
        assert!(matches!(err, EncryptionError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_instance_id_read_from_submission() {
        let dir = submission_dir(&[("submission.xml", "<data id=\"f1\"><meta><instanceID>uuid:77</instanceID></meta></data>",
        )]);
        let report =
            encrypt_submission(dir.path(), &form(), &EncryptOptions::default()).unwrap();

        assert_eq!(report.instance_id, "uuid:77");
        assert!(report.media.is_empty());
        assert_eq!(report.stats.files_encrypted, 1);
    }

    #[test]
    fn test_missing_instance_id_touches_nothing() {
        let dir = submission_dir(&[("submission.xml", "<data/>"), ("photo.jpg", "ABC")]);
        let err = encrypt_submission(dir.path(), &form(), &EncryptOptions::default()).unwrap_err();

        assert!(matches!(err, EncryptionError::MissingInstanceId));
        assert!(!dir.path().join("photo.jpg.enc").exists());
        assert_eq!(
            fs::read(dir.path().join("submission.xml")).unwrap(),
            b"<data/>"
        );
    }

    #[test]
    fn test_finalize_plaintext_form() {
        let dir = submission_dir(&[("submission.xml", "<data/>"), ("photo.jpg", "ABC")]);
        let form = FormRecord::new("f1").unwrap().with_public_key("");

        let outcome = finalize_submission(
            dir.path(),
            &form,
            &EncryptOptions::default().with_instance_id("uuid-1"),
        )
        .unwrap();

        assert!(!outcome.is_encrypted());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    #[traced_test]
    fn test_logs_summary_without_key_material() {
        let dir = submission_dir(&[
            ("submission.xml", "<data/>"),
            ("photo.jpg", "ABC"),
            ("photo.jpg.enc", "stale"),
        ]);
        let report = encrypt_submission(
            dir.path(),
            &form(),
            &EncryptOptions::default().with_instance_id("uuid-1"),
        )
        .unwrap();

        assert!(logs_contain("removing stale encrypted file"));
        assert!(logs_contain("submission encrypted"));
        assert!(logs_contain("uuid-1"));
        assert_eq!(report.stats.stale_files_removed, 1);

        let manifest = fs::read_to_string(&report.manifest_path).unwrap();
        let wrapped_key = manifest
            .split("<base64EncryptedKey>")
            .nth(1)
            .and_then(|rest| rest.split('<').next())
            .unwrap();
        assert!(!logs_contain(wrapped_key));
    }

    #[test]
    fn test_stats_overhead() {
        let mut stats = EncryptionStats::new();
        assert_eq!(stats.overhead_ratio(), 0.0);

        stats.plaintext_bytes = 32;
        stats.ciphertext_bytes = 48;
        assert!((stats.overhead_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
