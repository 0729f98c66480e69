//! Instance ID lookup in a saved submission.

use crate::error::{EncryptionError, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::Path;

const INSTANCE_ID_ELEMENT: &[u8] = b"instanceID";

/// First `instanceID` element (any namespace prefix) in the document.
pub fn parse_instance_id(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                inside = start.local_name().as_ref() == INSTANCE_ID_ELEMENT;
            }
            Ok(Event::Text(text)) if inside => {
                let value = text
                    .unescape()
                    .map_err(|e| EncryptionError::InvalidConfiguration(e.to_string()))?;
                let value = value.trim();
                if value.is_empty() {
                    break;
                }
                return Ok(value.to_owned());
            }
            Ok(Event::End(_)) => {
                if inside {
                    break;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(EncryptionError::InvalidConfiguration(format!(
                    "submission is not well-formed XML: {e}"
                )))
            }
        }
    }

    Err(EncryptionError::MissingInstanceId)
}

pub fn read_instance_id(path: &Path) -> Result<String> {
    let xml = std::fs::read_to_string(path)?;
    parse_instance_id(&xml)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_prefixed_instance_id() {
        let xml = r#"<data id="f1" xmlns:orx="http://openrosa.org/xforms">
            <name>Ada</name>
            <orx:meta><orx:instanceID>uuid:1234</orx:instanceID></orx:meta>
        </data>"#;
        assert_eq!(parse_instance_id(xml).unwrap(), "uuid:1234");
    }

    #[test]
    fn test_finds_unprefixed_instance_id() {
        let xml = "<data><meta><instanceID> uuid-1 </instanceID></meta></data>";
        assert_eq!(parse_instance_id(xml).unwrap(), "uuid-1");
    }

    #[test]
    fn test_missing_instance_id() {
        assert!(matches!(
            parse_instance_id("<data><meta/></data>"),
            Err(EncryptionError::MissingInstanceId)
        ));
        assert!(matches!(
            parse_instance_id("<data><meta><instanceID>  </instanceID></meta></data>"),
            Err(EncryptionError::MissingInstanceId)
        ));
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(
            parse_instance_id("<data><meta></data>"),
            Err(EncryptionError::InvalidConfiguration(_))
        ));
    }
}
