//! Core data types shared across the relay.
//!
//! A [`Document`] is what a connector reports; a [`ConversionResult`] is what
//! a converter produces; an [`OutputArtifact`] is what a sink writes. Ledger
//! records live in [`crate::ledger`].

use chrono::{DateTime, Utc};

/// A source document as listed by a connector.
///
/// `id` is opaque and stable across listings: it is the ledger key. The
/// `source_ref` is whatever the connector needs to fetch the bytes again
/// (a drive file id, an absolute local path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub size: Option<u64>,
    pub modified_time: Option<DateTime<Utc>>,
    pub source_ref: String,
}

/// What kind of file a converted document becomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArtifactFormat {
    #[default]
    Markdown,
    /// FreeMind XML.
    MindMap,
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Markdown => "md",
            ArtifactFormat::MindMap => "mm",
        }
    }
}

/// Output of a conversion backend.
#[derive(Debug, Clone, Default)]
pub struct ConversionResult {
    /// Markdown, or FreeMind XML when `format` is [`ArtifactFormat::MindMap`].
    pub text: String,
    /// Encoded page images, if the backend rendered any.
    pub page_images: Vec<Vec<u8>>,
    pub format: ArtifactFormat,
}

impl ConversionResult {
    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn mind_map(xml: impl Into<String>) -> Self {
        Self {
            text: xml.into(),
            page_images: Vec::new(),
            format: ArtifactFormat::MindMap,
        }
    }
}

/// Everything a sink needs to materialize one processed document.
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    pub document_id: String,
    pub title: String,
    /// `<sanitized-title>-<YYYYMMDDHHMMSS>`, shared by the output file and its assets.
    pub stem: String,
    pub format: ArtifactFormat,
    pub body: String,
    /// Original source bytes, kept for asset modes that copy or rasterize the PDF.
    pub source: Option<Vec<u8>>,
    pub page_images: Vec<Vec<u8>>,
}

impl OutputArtifact {
    /// `<stem>.md` or `<stem>.mm`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.stem, self.format.extension())
    }
}
