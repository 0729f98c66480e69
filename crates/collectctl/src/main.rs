use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use common::FormRecord;
use encryption::{
    decrypt_submission, finalize_submission, load_private_key_pem, private_key_from_env,
    EncryptOptions, EncryptedManifest, FinalizeOutcome, RsaPrivateKey, PRIVATE_KEY_ENV,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_FORMAT_ENV: &str = "COLLECT_LOG_FORMAT";

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let format = std::env::var(LOG_FORMAT_ENV).unwrap_or_else(|_| "compact".to_string());

        if format.eq_ignore_ascii_case("json") {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter.clone())
                .with_target(true)
                .with_writer(std::io::stderr)
                .json()
                .flatten_event(true)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .compact()
                .init();
        }
    });
}

#[derive(Parser)]
#[command(name = "collectctl")]
#[command(about = "Encrypted form submission utility", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a finalized submission directory in place
    Encrypt {
        /// Instance directory holding submission.xml and attachments
        #[arg(short, long)]
        dir: PathBuf,
        /// YAML form definition (form_id, version, base64_rsa_public_key)
        #[arg(short, long)]
        form: PathBuf,
        /// Override the instanceID found in submission.xml
        #[arg(long)]
        instance_id: Option<String>,
        /// File names to leave untouched (repeatable)
        #[arg(long)]
        retain: Vec<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Decrypt an encrypted submission and verify its signature
    Decrypt {
        #[arg(short, long)]
        dir: PathBuf,
        /// Output directory for recovered plaintexts
        #[arg(short, long)]
        out: PathBuf,
        /// PEM private key file (falls back to COLLECT_PRIVATE_KEY)
        #[arg(long)]
        private_key: Option<PathBuf>,
    },
    /// Show the manifest of an encrypted submission
    Inspect {
        #[arg(short, long)]
        dir: PathBuf,
    },
}

fn load_form_file(path: &Path) -> Result<FormRecord> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading form definition {}", path.display()))?;
    let form: FormRecord = serde_yaml::from_str(&text).map_err(|err| anyhow!(err))?;
    if form.form_id().trim().is_empty() {
        return Err(anyhow!("form definition {} has an empty form_id", path.display()));
    }
    Ok(form)
}

fn resolve_private_key(path: Option<&Path>) -> Result<RsaPrivateKey> {
    match path {
        Some(path) => {
            let pem = fs::read_to_string(path)
                .with_context(|| format!("reading private key {}", path.display()))?;
            Ok(load_private_key_pem(&pem)?)
        }
        None => private_key_from_env()
            .with_context(|| format!("pass --private-key or set {PRIVATE_KEY_ENV}")),
    }
}

fn run_encrypt(
    dir: &Path,
    form_path: &Path,
    instance_id: Option<String>,
    retain: Vec<String>,
    json: bool,
) -> Result<()> {
    let form = load_form_file(form_path)?;
    let options = EncryptOptions {
        instance_id,
        retain,
    };

    let outcome = finalize_submission(dir, &form, &options)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match outcome {
        FinalizeOutcome::Plaintext => {
            println!(
                "Form {} has no public key; submission left as plaintext",
                form.form_id()
            );
        }
        FinalizeOutcome::Encrypted(report) => {
            println!("Form: {}", report.form_id);
            println!("Instance: {}", report.instance_id);
            println!("File\tPlaintext (bytes)\tCiphertext (bytes)\tMD5");
            for file in report.media.iter().chain(std::iter::once(&report.submission)) {
                println!(
                    "{}\t{:>12}\t{:>12}\t{}",
                    file.encrypted_name(),
                    file.plaintext_len,
                    file.ciphertext_len,
                    file.plaintext_md5
                );
            }
            if report.stats.stale_files_removed > 0 {
                println!("Stale .enc files removed: {}", report.stats.stale_files_removed);
            }
            println!("Manifest: {}", report.manifest_path.display());
        }
    }
    Ok(())
}

fn print_manifest(manifest: &EncryptedManifest) {
    println!("Form: {}", manifest.form_id);
    if let Some(version) = &manifest.form_version {
        println!("Version: {}", version);
    }
    println!("Instance: {}", manifest.instance_id);
    if manifest.media.is_empty() {
        println!("Media: (none)");
    } else {
        println!("Media:");
        for name in &manifest.media {
            println!("  {}", name);
        }
    }
    println!("Encrypted XML: {}", manifest.encrypted_xml_file);
    println!("Wrapped key: {} chars", manifest.base64_encrypted_key.len());
    println!("Signature: {} chars", manifest.base64_signature.len());
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Encrypt {
            dir,
            form,
            instance_id,
            retain,
            json,
        } => run_encrypt(&dir, &form, instance_id, retain, json)?,
        Commands::Decrypt {
            dir,
            out,
            private_key,
        } => {
            let key = resolve_private_key(private_key.as_deref())?;
            let decrypted = decrypt_submission(&dir, &key, &out)?;
            info!(out = %out.display(), "decryption complete");
            for file in decrypted.media.iter().chain(std::iter::once(&decrypted.submission)) {
                println!("{}\t{:>12}\t{}", file.name, file.plaintext_len, file.path.display());
            }
            println!("Signature verified for instance {}", decrypted.manifest.instance_id);
        }
        Commands::Inspect { dir } => {
            let manifest = EncryptedManifest::read_from(&dir.join(common::SUBMISSION_XML))?;
            print_manifest(&manifest);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_form_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("form.yaml");
        fs::write(
            &path,
            "form_id: household_survey\nversion: \"2024031501\"\nbase64_rsa_public_key: \"\"\n",
        )
        .unwrap();

        let form = load_form_file(&path).unwrap();
        assert_eq!(form.form_id(), "household_survey");
        assert_eq!(form.form_version(), Some("2024031501"));
        assert!(!form.encryption_policy().is_enabled());
    }

    #[test]
    fn test_load_form_file_rejects_blank_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("form.yaml");
        fs::write(&path, "form_id: \"  \"\n").unwrap();

        assert!(load_form_file(&path).is_err());
    }

    #[test]
    fn test_cli_parses_repeated_retain() {
        let cli = Cli::try_parse_from([
            "collectctl",
            "encrypt",
            "--dir",
            "instances/a",
            "--form",
            "form.yaml",
            "--retain",
            "a.log",
            "--retain",
            "b.log",
            "--json",
        ])
        .unwrap();

        match cli.command {
            Commands::Encrypt { retain, json, .. } => {
                assert_eq!(retain, vec!["a.log", "b.log"]);
                assert!(json);
            }
            _ => panic!("expected encrypt"),
        }
    }

    #[test]
    fn test_resolve_private_key_missing_file() {
        let err = resolve_private_key(Some(Path::new("/nonexistent/key.pem"))).unwrap_err();
        assert!(err.to_string().contains("reading private key"));
    }
}
