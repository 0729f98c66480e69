//! Encrypted Submission Manifest
//!
//! Once every file is encrypted, the plaintext `submission.xml` is replaced by
//! a manifest describing the encrypted submission:
//!
//! ```text
//! <data xmlns="http://www.opendatakit.org/xforms/encrypted" id="FORMID" version="V" encrypted="yes">
//!   <base64EncryptedKey>...</base64EncryptedKey>
//!   <orx:meta xmlns:orx="http://openrosa.org/xforms"><orx:instanceID>...</orx:instanceID></orx:meta>
//!   <media><file>name1.enc</file></media>
//!   <encryptedXmlFile>submission.xml.enc</encryptedXmlFile>
//!   <base64EncryptedElementSignature>...</base64EncryptedElementSignature>
//! </data>
//! ```
//!
//! Child order is fixed. `version` is omitted when the form has none. Media
//! entries appear in encryption order, which is also the order the server
//! replays the IV sequence in.

use crate::error::{EncryptionError, Result};
use common::{ENCRYPTED_XML_NAMESPACE, OPENROSA_NAMESPACE};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::Serialize;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use tempfile::NamedTempFile;

const ROOT: &str = "data";
const ENCRYPTED_KEY: &str = "base64EncryptedKey";
const META: &str = "orx:meta";
const INSTANCE_ID: &str = "orx:instanceID";
const MEDIA: &str = "media";
const FILE: &str = "file";
const ENCRYPTED_XML_FILE: &str = "encryptedXmlFile";
const SIGNATURE: &str = "base64EncryptedElementSignature";

/// Parsed or to-be-written manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptedManifest {
    pub form_id: String,
    pub form_version: Option<String>,
    pub base64_encrypted_key: String,
    pub instance_id: String,
    /// Encrypted attachment names (`*.enc`), in encryption order
    pub media: Vec<String>,
    pub encrypted_xml_file: String,
    pub base64_signature: String,
}

fn xml_error(err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(err.to_string())
}

fn write_text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> std::io::Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_error)
}

fn write_layout<W: std::io::Write>(writer: &mut Writer<W>, whitespace: &str) -> std::io::Result<()> {
    writer
        .write_event(Event::Text(BytesText::from_escaped(whitespace)))
        .map_err(xml_error)
}

impl EncryptedManifest {
    /// Serialize to the manifest document.
    pub fn to_xml(&self) -> std::io::Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;
        write_layout(&mut writer, "\n")?;

        let mut root = BytesStart::new(ROOT);
        root.push_attribute(("xmlns", ENCRYPTED_XML_NAMESPACE));
        root.push_attribute(("id", self.form_id.as_str()));
        if let Some(version) = &self.form_version {
            root.push_attribute(("version", version.as_str()));
        }
        root.push_attribute(("encrypted", "yes"));
        writer.write_event(Event::Start(root)).map_err(xml_error)?;

        write_layout(&mut writer, "\n  ")?;
        write_text_element(&mut writer, ENCRYPTED_KEY, &self.base64_encrypted_key)?;

        write_layout(&mut writer, "\n  ")?;
        let mut meta = BytesStart::new(META);
        meta.push_attribute(("xmlns:orx", OPENROSA_NAMESPACE));
        writer.write_event(Event::Start(meta)).map_err(xml_error)?;
        write_text_element(&mut writer, INSTANCE_ID, &self.instance_id)?;
        writer
            .write_event(Event::End(BytesEnd::new(META)))
            .map_err(xml_error)?;

        for media in &self.media {
            write_layout(&mut writer, "\n  ")?;
            writer
                .write_event(Event::Start(BytesStart::new(MEDIA)))
                .map_err(xml_error)?;
            write_text_element(&mut writer, FILE, media)?;
            writer
                .write_event(Event::End(BytesEnd::new(MEDIA)))
                .map_err(xml_error)?;
        }

        write_layout(&mut writer, "\n  ")?;
        write_text_element(&mut writer, ENCRYPTED_XML_FILE, &self.encrypted_xml_file)?;

        write_layout(&mut writer, "\n  ")?;
        write_text_element(&mut writer, SIGNATURE, &self.base64_signature)?;

        write_layout(&mut writer, "\n")?;
        writer
            .write_event(Event::End(BytesEnd::new(ROOT)))
            .map_err(xml_error)?;
        write_layout(&mut writer, "\n")?;

        String::from_utf8(writer.into_inner().into_inner()).map_err(xml_error)
    }

    /// Replace `path` (the plaintext submission.xml) with the manifest.
    ///
    /// The manifest is written to a sibling temporary file and renamed over
    /// `path`, so on error `path` still holds its previous content. The
    /// plaintext submission is gone once this returns `Ok`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let wrap = |source: std::io::Error| EncryptionError::ManifestWrite {
            path: path.to_path_buf(),
            source,
        };
        let xml = self.to_xml().map_err(wrap)?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged = NamedTempFile::new_in(dir).map_err(wrap)?;
        staged.write_all(xml.as_bytes()).map_err(wrap)?;
        staged.as_file().sync_all().map_err(wrap)?;
        staged.persist(path).map_err(|e| wrap(e.error))?;
        Ok(())
    }

    /// Whether `xml` is already an encrypted-submission manifest: root
    /// `<data encrypted="yes">` in the encrypted namespace.
    pub fn is_manifest(xml: &str) -> bool {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) | Ok(Event::Empty(start)) => {
                    return local_name(&start)
                        .and_then(|name| parse_root(&start, &name))
                        .is_ok();
                }
                Ok(Event::Eof) | Err(_) => return false,
                Ok(_) => {}
            }
        }
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let xml = fs::read_to_string(path)?;
        Self::parse(&xml)
    }

    /// Parse a manifest document.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut form_id = None;
        let mut form_version = None;
        let mut encrypted_key = None;
        let mut instance_id = None;
        let mut media = Vec::new();
        let mut encrypted_xml_file = None;
        let mut signature = None;

        let mut path: Vec<String> = Vec::new();
        loop {
            let event = reader.read_event().map_err(|e| {
                EncryptionError::ManifestParse(format!(
                    "at byte {}: {e}",
                    reader.buffer_position()
                ))
            })?;

            match event {
                Event::Start(start) => {
                    let name = local_name(&start)?;
                    if path.is_empty() {
                        let root = parse_root(&start, &name)?;
                        form_id = Some(root.0);
                        form_version = root.1;
                    }
                    path.push(name);
                }
                Event::Empty(start) if path.is_empty() => {
                    let name = local_name(&start)?;
                    parse_root(&start, &name)?;
                    return Err(EncryptionError::ManifestParse("empty manifest".into()));
                }
                Event::Text(text) => {
                    let value = text
                        .unescape()
                        .map_err(|e| EncryptionError::ManifestParse(e.to_string()))?
                        .into_owned();
                    let parent = path.len().checked_sub(2).and_then(|i| path.get(i));
                    match (parent.map(String::as_str), path.last().map(String::as_str)) {
                        (Some(ROOT), Some(ENCRYPTED_KEY)) => encrypted_key = Some(value),
                        (Some("meta"), Some("instanceID")) => instance_id = Some(value),
                        (Some(MEDIA), Some(FILE)) => media.push(value),
                        (Some(ROOT), Some(ENCRYPTED_XML_FILE)) => encrypted_xml_file = Some(value),
                        (Some(ROOT), Some(SIGNATURE)) => signature = Some(value),
                        _ => {}
                    }
                }
                Event::End(_) => {
                    path.pop();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let missing = |what: &str| EncryptionError::ManifestParse(format!("missing <{what}>"));
        Ok(Self {
            form_id: form_id.ok_or_else(|| missing(ROOT))?,
            form_version,
            base64_encrypted_key: encrypted_key.ok_or_else(|| missing(ENCRYPTED_KEY))?,
            instance_id: instance_id.ok_or_else(|| missing("instanceID"))?,
            media,
            encrypted_xml_file: encrypted_xml_file.ok_or_else(|| missing(ENCRYPTED_XML_FILE))?,
            base64_signature: signature.ok_or_else(|| missing(SIGNATURE))?,
        })
    }
}

fn local_name(start: &BytesStart<'_>) -> Result<String> {
    std::str::from_utf8(start.local_name().as_ref())
        .map(str::to_owned)
        .map_err(|e| EncryptionError::ManifestParse(e.to_string()))
}

/// Validates the root element, returns `(id, version)`.
fn parse_root(start: &BytesStart<'_>, name: &str) -> Result<(String, Option<String>)> {
    if name != ROOT {
        return Err(EncryptionError::ManifestParse(format!(
            "unexpected root <{name}>"
        )));
    }

    let mut id = None;
    let mut version = None;
    let mut encrypted = false;
    let mut namespace = None;
    for attr in start.attributes() {
        let attr = attr.map_err(|e| EncryptionError::ManifestParse(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| EncryptionError::ManifestParse(e.to_string()))?
            .into_owned();
        match attr.key.as_ref() {
            b"id" => id = Some(value),
            b"version" => version = Some(value).filter(|v| !v.is_empty()),
            b"encrypted" => encrypted = value == "yes",
            b"xmlns" => namespace = Some(value),
            _ => {}
        }
    }

    if namespace.as_deref() != Some(ENCRYPTED_XML_NAMESPACE) {
        return Err(EncryptionError::ManifestParse(
            "root is not in the encrypted submission namespace".into(),
        ));
    }
    if !encrypted {
        return Err(EncryptionError::ManifestParse(
            "root is not marked encrypted=\"yes\"".into(),
        ));
    }
    let id = id.ok_or_else(|| EncryptionError::ManifestParse("root has no id".into()))?;
    Ok((id, version))
}
