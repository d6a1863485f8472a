//! Capability traits for the three pluggable stages of the relay.
//!
//! The orchestrator only ever holds `Box<dyn Connector>`,
//! `Box<dyn Converter>` and `Box<dyn Sink>`, so a new storage provider,
//! conversion backend or destination is one trait impl away.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//! │  Connector  │──▶│  Converter  │──▶│    Sink     │
//! │ Drive/Local │   │ Simple/LLM  │   │  Dir / Git  │
//! └─────────────┘   └─────────────┘   └──────┬──────┘
//!                                            ▼
//!                                      Ledger (JSON)
//! ```
//!
//! # Usage
//!
//! ```rust
//! use async_trait::async_trait;
//! use anyhow::Result;
//! use pdf_relay::models::Document;
//! use pdf_relay::traits::Connector;
//!
//! pub struct InboxConnector;
//!
//! #[async_trait]
//! impl Connector for InboxConnector {
//!     fn name(&self) -> &str { "inbox" }
//!
//!     async fn list_pending(&self) -> Result<Vec<Document>> {
//!         Ok(vec![])
//!     }
//!
//!     async fn fetch(&self, document: &Document) -> Result<Vec<u8>> {
//!         anyhow::bail!("nothing to fetch for {}", document.id)
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

use crate::error::SinkError;
use crate::models::{ArtifactFormat, ConversionResult, Document, OutputArtifact};

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

/// A storage location that documents appear in.
///
/// # Contract
///
/// - [`list_pending`](Connector::list_pending) returns a complete snapshot
///   of candidate documents. Calling it twice without external change
///   yields the same set; it never consumes or moves anything.
/// - [`fetch`](Connector::fetch) is idempotent and side-effect free on the
///   source.
///
/// Authentication failures should be returned as (or wrap)
/// [`crate::error::AuthError`]; the orchestrator downcasts for it to tell
/// them apart from ordinary listing failures.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Short label used in logs (e.g. `"google_drive"`, `"local"`).
    fn name(&self) -> &str;

    /// Make sure credentials are usable before a cycle starts.
    ///
    /// Connectors without credentials keep the default no-op.
    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<Document>>;

    async fn fetch(&self, document: &Document) -> Result<Vec<u8>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Converter Trait
// ═══════════════════════════════════════════════════════════════════════

/// Turns raw document bytes into Markdown or a FreeMind mind map; the
/// result's `format` says which.
///
/// Failures are per-document: the orchestrator logs them and moves on to
/// the next document.
#[async_trait]
pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    async fn convert(&self, bytes: &[u8], filename: &str) -> Result<ConversionResult>;
}

/// Decides which format a document should be converted to.
///
/// An error is not fatal: the router falls back to Markdown.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, bytes: &[u8], filename: &str) -> Result<ArtifactFormat>;
}

// ═══════════════════════════════════════════════════════════════════════
// Sink Trait
// ═══════════════════════════════════════════════════════════════════════

/// A destination for converted artifacts.
///
/// Writes are deterministic: the same artifact always lands at the same
/// path, so a retry after a crash overwrites rather than duplicates.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Persist `artifact` and return the sink-relative path of the written
    /// document.
    fn write(&self, artifact: &OutputArtifact) -> Result<String, SinkError>;
}
