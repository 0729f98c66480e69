//! RSA-OAEP Envelope
//!
//! Wraps the session's symmetric key (and the manifest signature digest)
//! under the form's RSA public key with OAEP, SHA-256 for both the label hash
//! and MGF1. Only the server holds the private key; the device never signs
//! anything, it only encrypts to the server.
//!
//! ## Padding randomness
//!
//! OAEP needs random seeds. They are drawn from a ChaCha20 stream keyed by
//! `SHA-256(domain || symmetric key)`, so every random input of a session
//! flows from symmetric key generation alone: replaying a key reproduces the
//! wrapped key and the signature exactly.

use crate::error::{EncryptionError, Result};
use crate::keymaterial::SymmetricKey;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand_chacha::ChaCha20Rng;
use rand_core::{CryptoRngCore, SeedableRng};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Smallest accepted form key
pub const MIN_RSA_KEY_BITS: usize = 2048;

/// Environment variable holding the server's PEM private key
pub const PRIVATE_KEY_ENV: &str = "COLLECT_PRIVATE_KEY";

const OAEP_SEED_DOMAIN: &[u8] = b"COLLECT-OAEP-SEED-STREAM-V1";

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// Decode a form key: base64 of a DER X.509 SubjectPublicKeyInfo.
pub fn parse_public_key(base64_key: &str) -> Result<RsaPublicKey> {
    let compact: String = base64_key.split_whitespace().collect();
    if compact.is_empty() {
        return Err(EncryptionError::InvalidPublicKey("empty key".into()));
    }

    let der = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| EncryptionError::InvalidPublicKey(format!("bad base64: {e}")))?;

    let key = RsaPublicKey::from_public_key_der(&der)
        .map_err(|e| EncryptionError::InvalidPublicKey(format!("bad X.509 key: {e}")))?;

    let bits = key.n().bits();
    if bits < MIN_RSA_KEY_BITS {
        return Err(EncryptionError::InvalidPublicKey(format!(
            "{bits}-bit modulus, at least {MIN_RSA_KEY_BITS} bits required"
        )));
    }

    Ok(key)
}

/// Keyed seed stream for OAEP padding.
pub fn oaep_rng(key: &SymmetricKey) -> ChaCha20Rng {
    let mut hasher = Sha256::new();
    hasher.update(OAEP_SEED_DOMAIN);
    hasher.update(key.as_bytes());
    ChaCha20Rng::from_seed(hasher.finalize().into())
}

/// RSA-OAEP encrypt arbitrary short payload, base64 result.
pub fn encrypt_to_base64<R: CryptoRngCore>(
    public_key: &RsaPublicKey,
    payload: &[u8],
    rng: &mut R,
) -> std::result::Result<String, rsa::Error> {
    let ciphertext = public_key.encrypt(rng, oaep(), payload)?;
    Ok(STANDARD.encode(ciphertext))
}

/// `base64(RSA-OAEP-SHA256(key))`
pub fn wrap_key<R: CryptoRngCore>(
    public_key: &RsaPublicKey,
    key: &SymmetricKey,
    rng: &mut R,
) -> Result<String> {
    encrypt_to_base64(public_key, key.as_bytes(), rng)
        .map_err(|e| EncryptionError::CryptoUnavailable(format!("RSA-OAEP key wrap: {e}")))
}

/// Server side: RSA-OAEP decrypt a base64 payload.
pub fn decrypt_from_base64(private_key: &RsaPrivateKey, base64_payload: &str) -> Result<Vec<u8>> {
    let compact: String = base64_payload.split_whitespace().collect();
    let ciphertext = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| EncryptionError::KeyUnwrap(format!("bad base64: {e}")))?;
    private_key
        .decrypt(oaep(), &ciphertext)
        .map_err(|e| EncryptionError::KeyUnwrap(e.to_string()))
}

/// Server side: recover the symmetric key from `base64EncryptedKey`.
pub fn unwrap_key(private_key: &RsaPrivateKey, wrapped: &str) -> Result<SymmetricKey> {
    let bytes = decrypt_from_base64(private_key, wrapped)?;
    SymmetricKey::from_slice(&bytes)
}

/// Load a PKCS#8 or PKCS#1 PEM private key
pub fn load_private_key_pem(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| EncryptionError::InvalidConfiguration(format!("unreadable private key: {e}")))
}

/// Load the private key from `COLLECT_PRIVATE_KEY` (PEM text)
///
/// # Errors
/// Returns error if env var missing or invalid
pub fn private_key_from_env() -> Result<RsaPrivateKey> {
    let pem = std::env::var(PRIVATE_KEY_ENV).map_err(|_| {
        EncryptionError::InvalidConfiguration(format!(
            "{PRIVATE_KEY_ENV} environment variable not set"
        ))
    })?;
    load_private_key_pem(&pem)
}

#[cfg(test)]
pub(crate) mod test_keys {
    use super::*;

    pub const TEST_PRIVATE_PEM: &str = include_str!("../tests/fixtures/test_rsa_2048.pem");
    pub const TEST_PUBLIC_B64: &str = include_str!("../tests/fixtures/test_rsa_2048.pub.b64");
    pub const OTHER_PRIVATE_PEM: &str = include_str!("../tests/fixtures/other_rsa_2048.pem");
    pub const WEAK_PUBLIC_B64: &str = include_str!("../tests/fixtures/weak_rsa_1024.pub.b64");

    pub fn private_key() -> RsaPrivateKey {
        load_private_key_pem(TEST_PRIVATE_PEM).unwrap()
    }

    pub fn public_key() -> RsaPublicKey {
        parse_public_key(TEST_PUBLIC_B64).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_keys::*;
    use super::*;
    use serial_test::serial;

    fn sample_key() -> SymmetricKey {
        SymmetricKey::from_bytes([0x3Cu8; 32])
    }

    #[test]
    fn test_parse_public_key_matches_private() {
        let public = public_key();
        assert_eq!(public, RsaPublicKey::from(&private_key()));
        assert_eq!(public.n().bits(), 2048);
    }

    #[test]
    fn test_parse_public_key_tolerates_line_breaks() {
        let wrapped: String = TEST_PUBLIC_B64
            .trim()
            .as_bytes()
            .chunks(64)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(parse_public_key(&wrapped).unwrap(), public_key());
    }

    #[test]
    fn test_parse_public_key_rejects_garbage() {
        assert!(matches!(
            parse_public_key(""),
            Err(EncryptionError::InvalidPublicKey(_))
        ));
        assert!(matches!(
            parse_public_key("not base64 !!"),
            Err(EncryptionError::InvalidPublicKey(_))
        ));
        assert!(matches!(
            parse_public_key("AAAA"),
            Err(EncryptionError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_parse_public_key_rejects_short_modulus() {
        let err = parse_public_key(WEAK_PUBLIC_B64).unwrap_err();
        assert!(err.to_string().contains("1024-bit"));
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let key = sample_key();
        let wrapped = wrap_key(&public_key(), &key, &mut oaep_rng(&key)).unwrap();

        let unwrapped = unwrap_key(&private_key(), &wrapped).unwrap();
        assert_eq!(unwrapped.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_wrap_is_deterministic_per_key() {
        let key = sample_key();
        let a = wrap_key(&public_key(), &key, &mut oaep_rng(&key)).unwrap();
        let b = wrap_key(&public_key(), &key, &mut oaep_rng(&key)).unwrap();
        assert_eq!(a, b);

        let other = SymmetricKey::from_bytes([0x3Du8; 32]);
        let c = wrap_key(&public_key(), &other, &mut oaep_rng(&other)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_unwrap_with_wrong_private_key_fails() {
        let key = sample_key();
        let wrapped = wrap_key(&public_key(), &key, &mut oaep_rng(&key)).unwrap();
        let other = load_private_key_pem(OTHER_PRIVATE_PEM).unwrap();

        assert!(matches!(
            unwrap_key(&other, &wrapped),
            Err(EncryptionError::KeyUnwrap(_))
        ));
    }

    #[test]
    fn test_load_private_key_rejects_garbage() {
        assert!(matches!(
            load_private_key_pem("-----BEGIN NOTHING-----"),
            Err(EncryptionError::InvalidConfiguration(_))
        ));
    }

    #[test]
    #[serial]
    fn test_private_key_from_env_missing() {
        let original = std::env::var(PRIVATE_KEY_ENV).ok();
        std::env::remove_var(PRIVATE_KEY_ENV);

        let result = private_key_from_env();

        if let Some(val) = original {
            std::env::set_var(PRIVATE_KEY_ENV, val);
        }

        assert!(matches!(
            result,
            Err(EncryptionError::InvalidConfiguration(_))
        ));
    }

    #[test]
    #[serial]
    fn test_private_key_from_env_valid() {
        let original = std::env::var(PRIVATE_KEY_ENV).ok();
        std::env::set_var(PRIVATE_KEY_ENV, TEST_PRIVATE_PEM);

        let result = private_key_from_env();

        if let Some(val) = original {
            std::env::set_var(PRIVATE_KEY_ENV, val);
        } else {
            std::env::remove_var(PRIVATE_KEY_ENV);
        }

        let key = result.expect("valid PEM in env should load");
        assert_eq!(RsaPublicKey::from(&key), public_key());
    }
}
