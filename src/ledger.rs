//! Processing ledger: the durable record of which documents are done.
//!
//! The ledger is a single JSON file keyed by document id. It is the only
//! thing that makes the relay exactly-once across restarts, so it is
//! strict about two things:
//!
//! - **Corruption is fatal.** A file that exists but does not parse is an
//!   error, never an empty ledger. Treating it as empty would reprocess and
//!   duplicate every document.
//! - **Writes are atomic.** Every mutation rewrites the whole file through
//!   [`crate::atomic`], so a crash leaves the previous version intact.
//!
//! Fields the relay does not know about, at the top level or on a record,
//! are carried through a read-modify-write unchanged.
//!
//! # Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "documents": {
//!     "1AbC": {
//!       "processed_at": "2024-09-18T10:30:00Z",
//!       "output_path": "notes/Report-20240918103000.md",
//!       "status": "success",
//!       "title": "Report"
//!     }
//!   }
//! }
//! ```
//!
//! Files in the older `{"processed": {id: {name, timestamp}}}` layout are
//! migrated on load; every entry there was a success.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::atomic;
use crate::error::LedgerError;

/// Highest ledger format version this build understands.
pub const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Success,
    Failed,
}

/// One document's processing outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub output_path: String,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    documents: BTreeMap<String, ProcessingRecord>,
    #[serde(default, skip_serializing)]
    processed: Option<BTreeMap<String, LegacyEntry>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    #[serde(default)]
    name: Option<String>,
    timestamp: DateTime<Utc>,
}

/// In-memory view of the ledger file, persisted after every mutation.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    file: LedgerFile,
}

impl Ledger {
    /// Load the ledger at `path`. A missing file is an empty ledger; an
    /// unreadable or malformed one is [`LedgerError::Corrupt`].
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    path: path.to_path_buf(),
                    file: LedgerFile {
                        version: LEDGER_VERSION,
                        ..LedgerFile::default()
                    },
                });
            }
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut file: LedgerFile =
            serde_json::from_slice(&raw).map_err(|e| LedgerError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if file.version > LEDGER_VERSION {
            return Err(LedgerError::Corrupt {
                path: path.to_path_buf(),
                reason: format!(
                    "format version {} is newer than supported version {}",
                    file.version, LEDGER_VERSION
                ),
            });
        }

        if let Some(legacy) = file.processed.take() {
            tracing::info!(
                path = %path.display(),
                entries = legacy.len(),
                "migrating legacy ledger format"
            );
            for (id, entry) in legacy {
                file.documents
                    .entry(id)
                    .or_insert_with(|| ProcessingRecord {
                        processed_at: entry.timestamp,
                        output_path: String::new(),
                        status: RecordStatus::Success,
                        title: entry.name,
                        error: None,
                        extra: Map::new(),
                    });
            }
        }
        file.version = LEDGER_VERSION;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True only when the document has a `success` record.
    pub fn is_processed(&self, document_id: &str) -> bool {
        self.file
            .documents
            .get(document_id)
            .is_some_and(|r| r.status == RecordStatus::Success)
    }

    pub fn record(&self, document_id: &str) -> Option<&ProcessingRecord> {
        self.file.documents.get(document_id)
    }

    /// All records, ordered by document id.
    pub fn records(&self) -> impl Iterator<Item = (&str, &ProcessingRecord)> {
        self.file.documents.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.file.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.documents.is_empty()
    }

    /// Record a permanent success and persist.
    pub fn mark_success(
        &mut self,
        document_id: &str,
        title: &str,
        output_path: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let extra = self.take_extra(document_id);
        self.file.documents.insert(
            document_id.to_string(),
            ProcessingRecord {
                processed_at: timestamp,
                output_path: output_path.to_string(),
                status: RecordStatus::Success,
                title: Some(title.to_string()),
                error: None,
                extra,
            },
        );
        self.persist()
    }

    /// Record a failed attempt and persist. A failed record never blocks a
    /// retry, and never replaces an existing success.
    pub fn mark_failure(
        &mut self,
        document_id: &str,
        title: &str,
        reason: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if self.is_processed(document_id) {
            return Ok(());
        }
        let extra = self.take_extra(document_id);
        self.file.documents.insert(
            document_id.to_string(),
            ProcessingRecord {
                processed_at: timestamp,
                output_path: String::new(),
                status: RecordStatus::Failed,
                title: Some(title.to_string()),
                error: Some(reason.to_string()),
                extra,
            },
        );
        self.persist()
    }

    /// Serialize and atomically replace the ledger file.
    pub fn persist(&self) -> Result<(), LedgerError> {
        let staged = self.stage()?;
        self.commit(staged)
    }

    /// First half of [`Ledger::persist`]: the new contents sit in a temp file
    /// beside the ledger, which itself is untouched.
    pub fn stage(&self) -> Result<NamedTempFile, LedgerError> {
        let mut bytes = serde_json::to_vec_pretty(&self.file)?;
        bytes.push(b'\n');
        atomic::stage(&self.path, &bytes).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Second half of [`Ledger::persist`]: rename the staged file into place.
    pub fn commit(&self, staged: NamedTempFile) -> Result<(), LedgerError> {
        atomic::commit(staged, &self.path).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn take_extra(&mut self, document_id: &str) -> Map<String, Value> {
        self.file
            .documents
            .get_mut(document_id)
            .map(|r| std::mem::take(&mut r.extra))
            .unwrap_or_default()
    }
}
