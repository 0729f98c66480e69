use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod form;
pub mod policy;
pub use form::FormRecord;
pub use policy::EncryptionPolicy;

/// Name of the submission document inside an instance directory.
pub const SUBMISSION_XML: &str = "submission.xml";

/// Suffix appended to every encrypted sibling file.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

/// Default namespace of the encrypted submission manifest.
pub const ENCRYPTED_XML_NAMESPACE: &str = "http://www.opendatakit.org/xforms/encrypted";

/// OpenRosa metadata namespace (bound to the `orx` prefix in manifests).
pub const OPENROSA_NAMESPACE: &str = "http://openrosa.org/xforms";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommonError {
    #[error("instance ID must not be empty")]
    EmptyInstanceId,

    #[error("form ID must not be empty")]
    EmptyFormId,
}

pub type Result<T> = std::result::Result<T, CommonError>;

/// Metadata block of a filled-in form instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub instance_id: String,
}

impl InstanceMetadata {
    pub fn new(instance_id: impl Into<String>) -> Result<Self> {
        let instance_id = instance_id.into();
        if instance_id.trim().is_empty() {
            return Err(CommonError::EmptyInstanceId);
        }
        Ok(Self { instance_id })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// `photo.jpg` -> `photo.jpg.enc`
pub fn encrypted_name(name: &str) -> String {
    format!("{name}{ENCRYPTED_SUFFIX}")
}

/// `photo.jpg.enc` -> `photo.jpg`. Returns `None` for names without the suffix
/// or consisting of the suffix alone.
pub fn plaintext_name(name: &str) -> Option<&str> {
    name.strip_suffix(ENCRYPTED_SUFFIX)
        .filter(|stem| !stem.is_empty())
}
