use serde::{Deserialize, Serialize};

/// Submission encryption selection for a form.
///
/// A form is encryption-eligible only when its definition registers an RSA
/// public key. Forms without one are submitted as plaintext and never reach
/// the encryption pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EncryptionPolicy {
    /// Submit plaintext.
    #[default]
    None,

    /// Envelope encryption: AES-256-CFB per file, key wrapped with RSA-OAEP.
    Envelope {
        /// Base64 of the DER-encoded X.509 SubjectPublicKeyInfo.
        base64_rsa_public_key: String,
    },
}

impl EncryptionPolicy {
    /// Build the policy from an optional base64 key. Blank keys mean "no key".
    pub fn from_public_key(key: Option<&str>) -> Self {
        match key.map(str::trim) {
            Some(key) if !key.is_empty() => EncryptionPolicy::Envelope {
                base64_rsa_public_key: key.to_string(),
            },
            _ => EncryptionPolicy::None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, EncryptionPolicy::None)
    }

    pub fn public_key(&self) -> Option<&str> {
        match self {
            EncryptionPolicy::None => None,
            EncryptionPolicy::Envelope {
                base64_rsa_public_key,
            } => Some(base64_rsa_public_key),
        }
    }

    /// Algorithm name (for logging)
    pub fn algorithm_name(&self) -> &str {
        match self {
            EncryptionPolicy::None => "none",
            EncryptionPolicy::Envelope { .. } => "rsa-oaep-sha256+aes-256-cfb",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = EncryptionPolicy::default();
        assert_eq!(policy, EncryptionPolicy::None);
        assert!(!policy.is_enabled());
        assert_eq!(policy.algorithm_name(), "none");
        assert_eq!(policy.public_key(), None);
    }

    #[test]
    fn test_blank_key_is_not_eligible() {
        assert_eq!(EncryptionPolicy::from_public_key(None), EncryptionPolicy::None);
        assert_eq!(
            EncryptionPolicy::from_public_key(Some("")),
            EncryptionPolicy::None
        );
        assert_eq!(
            EncryptionPolicy::from_public_key(Some(" \n")),
            EncryptionPolicy::None
        );
    }

    #[test]
    fn test_envelope_policy() {
        let policy = EncryptionPolicy::from_public_key(Some(" MIIBIjAN "));
        assert!(policy.is_enabled());
        assert_eq!(policy.public_key(), Some("MIIBIjAN"));
        assert_eq!(policy.algorithm_name(), "rsa-oaep-sha256+aes-256-cfb");
    }

    #[test]
    fn test_serialization() {
        let policy = EncryptionPolicy::from_public_key(Some("MIIB"));
        let json = serde_json::to_string(&policy).unwrap();
        let deserialized: EncryptionPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, deserialized);
    }
}
