//! Files module - submission content handling
//!
//! This module provides:
//! - `SubmissionFile`: one blob of content with a resolved content type
//! - `Submission`: the bundle of files and inline text a student handed in
//! - Archive probing and extraction (ZIP, TAR, gzip-compressed TAR)
//! - `unpack`: staging a file into a workspace with a disk-space guard
//!
//! Archive detection always looks at the content, never at the file extension.

pub mod archive;
pub mod submission;
pub mod unpack;

use std::fmt;
use std::path::Path;

use anyhow::Context;
use encoding_rs::Encoding;
use tracing::warn;

pub use archive::ArchiveKind;
pub use submission::{GradingStatus, Owner, Submission};
pub use unpack::{unpack, Unpacker};

/// Content types that all denote a (possibly compressed) TAR archive
pub const TAR_CONTENT: &[&str] = &[
    "application/x-tar",
    "application/x-gzip",
    "application/gzip",
    "application/tar",
    "application/tar+gzip",
    "application/x-gtar",
    "application/x-tgz",
];

const ZIP_CONTENT: &[&str] = &["application/zip", "application/x-zip-compressed"];

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Raw file content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Bytes(Vec<u8>),
    Text(String),
}

impl Content {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Content::Bytes(bytes) => bytes,
            Content::Text(text) => text.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        Content::Bytes(bytes)
    }
}

impl From<&[u8]> for Content {
    fn from(bytes: &[u8]) -> Self {
        Content::Bytes(bytes.to_vec())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

/// A single file of a submission or a validator
#[derive(Debug, Clone)]
pub struct SubmissionFile {
    /// File name, without path information
    pub name: String,
    /// The path on the server, relative to the owning folder
    pub relative_path: String,
    content: Content,
    content_type: String,
    encoding: Option<&'static Encoding>,
}

impl SubmissionFile {
    /// Create a file from in-memory data.
    ///
    /// A declared content type wins; otherwise the content is probed for an
    /// archive signature before guessing from the name.
    pub fn from_local_data(
        name: impl Into<String>,
        content: impl Into<Content>,
        content_type: Option<&str>,
    ) -> Self {
        let name = name.into();
        let content = content.into();
        let content_type = resolve_content_type(&name, content.as_bytes(), content_type);

        Self {
            name,
            relative_path: String::new(),
            content,
            content_type,
            encoding: None,
        }
    }

    /// Read a file from disk
    pub fn from_local_file(path: &Path, content_type: Option<&str>) -> anyhow::Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("Not a file path: {:?}", path))?;
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;

        Ok(Self::from_local_data(name, bytes, content_type))
    }

    /// Set the character encoding detected for this content (e.g. from an HTTP header)
    pub fn with_encoding(mut self, label: &str) -> Self {
        self.encoding = Encoding::for_label(label.trim().as_bytes());
        if self.encoding.is_none() {
            warn!("Unknown encoding '{}' for {}, decoding as Latin-1", label, self.name);
        }
        self
    }

    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = relative_path.into();
        self
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn bytes(&self) -> &[u8] {
        self.content.as_bytes()
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn encoding(&self) -> Option<&'static Encoding> {
        self.encoding
    }

    /// Content is held as bytes rather than decoded text
    pub fn is_binary(&self) -> bool {
        matches!(self.content, Content::Bytes(_))
    }

    pub fn is_zip(&self) -> bool {
        ZIP_CONTENT.iter().any(|t| self.content_type.contains(t))
    }

    pub fn is_tar(&self) -> bool {
        TAR_CONTENT.contains(&self.content_type.as_str())
    }

    pub fn is_archive(&self) -> bool {
        self.is_zip() || self.is_tar()
    }

    pub fn is_pdf(&self) -> bool {
        self.content_type.contains("application/pdf")
    }

    pub fn is_html(&self) -> bool {
        self.content_type.contains("text/html")
    }

    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }

    /// The content as printable text.
    ///
    /// Byte content is decoded with the detected encoding; without one it is
    /// read as Latin-1, which accepts every byte.
    pub fn as_text(&self) -> String {
        match &self.content {
            Content::Text(text) => text.clone(),
            Content::Bytes(bytes) => match self.encoding {
                Some(encoding) => encoding.decode_without_bom_handling(bytes).0.into_owned(),
                None => decode_latin1(bytes),
            },
        }
    }

    /// Write the raw content to `dir/name`
    pub fn save_as(&self, dir: &Path, name: &str) -> std::io::Result<()> {
        std::fs::write(dir.join(name), self.bytes())
    }
}

impl fmt::Display for SubmissionFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.relative_path, self.name)
    }
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Determine the content type of a file
fn resolve_content_type(name: &str, bytes: &[u8], declared: Option<&str>) -> String {
    if let Some(declared) = declared.map(str::trim).filter(|d| !d.is_empty()) {
        return declared.to_string();
    }

    if let Some(kind) = archive::probe(bytes) {
        return kind.content_type().to_string();
    }

    // Meta files of macOS archivers
    if name.starts_with("__MACOSX") {
        return "text/plain".to_string();
    }

    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or(FALLBACK_CONTENT_TYPE)
        .to_string()
}
