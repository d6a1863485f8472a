//! Error taxonomy.
//!
//! Each concern gets its own enum; [`PipelineError`] is what aborts a cycle.
//! Per-document failures never become a `PipelineError`: the orchestrator
//! turns them into [`crate::pipeline::DocumentFailure`] and moves on.

use std::path::PathBuf;
use thiserror::Error;

/// OAuth credential lifecycle failures. Fatal for the cycle that hits them.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Cannot read client secrets {path}: {reason}")]
    Secrets { path: PathBuf, reason: String },

    #[error("Credential cache {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("Token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Access token rejected by the API ({status})")]
    Rejected { status: u16 },

    #[error("Authorization was not completed: {0}")]
    Declined(String),

    #[error("Timed out waiting for the authorization redirect")]
    Timeout,
}

/// Failures loading or persisting the processing ledger.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Ledger I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures writing an artifact to a sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The repository has tracked changes the relay did not make.
    #[error("Repository has uncommitted changes: {}", .paths.join(", "))]
    Dirty { paths: Vec<String> },

    /// Local and remote histories have both moved on.
    #[error("Branch '{branch}' has diverged from {remote}; refusing to merge")]
    Diverged { remote: String, branch: String },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Rendering page assets failed: {0}")]
    Render(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SinkError {
    /// True when the sink refused to touch a repository it could not sync.
    pub fn is_sync_conflict(&self) -> bool {
        matches!(self, SinkError::Dirty { .. } | SinkError::Diverged { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SinkError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors that abort a whole cycle.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("Listing documents failed: {0:#}")]
    Discovery(anyhow::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
