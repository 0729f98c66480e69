use serde::{Deserialize, Deserializer, Serialize};

use crate::{CommonError, EncryptionPolicy, Result};

/// Form definition as registered on the device.
///
/// Loaded from YAML form definition files by `collectctl`:
///
/// ```yaml
/// form_id: household_survey
/// version: "2024031501"
/// base64_rsa_public_key: MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEA...
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormRecord {
    pub form_id: String,

    #[serde(
        default,
        rename = "version",
        deserialize_with = "blank_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub form_version: Option<String>,

    #[serde(
        default,
        deserialize_with = "blank_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub base64_rsa_public_key: Option<String>,
}

impl FormRecord {
    pub fn new(form_id: impl Into<String>) -> Result<Self> {
        let form_id = form_id.into();
        if form_id.trim().is_empty() {
            return Err(CommonError::EmptyFormId);
        }
        Ok(Self {
            form_id,
            form_version: None,
            base64_rsa_public_key: None,
        })
    }

    /// Empty versions are treated as "no version".
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.form_version = non_blank(version.into());
        self
    }

    pub fn with_public_key(mut self, base64_key: impl Into<String>) -> Self {
        self.base64_rsa_public_key = non_blank(base64_key.into());
        self
    }

    pub fn form_id(&self) -> &str {
        &self.form_id
    }

    pub fn form_version(&self) -> Option<&str> {
        self.form_version.as_deref()
    }

    pub fn encryption_policy(&self) -> EncryptionPolicy {
        EncryptionPolicy::from_public_key(self.base64_rsa_public_key.as_deref())
    }
}

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn blank_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.and_then(non_blank))
}
