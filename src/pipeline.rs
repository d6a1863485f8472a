//! Cycle orchestration.
//!
//! One cycle is: authenticate → list → drop documents the ledger already
//! marks as successful → for each remaining document fetch, convert, write
//! and record. Documents are processed one at a time.
//!
//! Failure handling follows one rule: nothing that goes wrong with a single
//! document stops the others. Fetch, conversion and sink errors become a
//! [`DocumentFailure`] in the [`CycleReport`] (and optionally a `failed`
//! ledger record, which never blocks a retry). Only three things abort a
//! cycle:
//!
//! - authentication failures, anywhere in the cycle;
//! - listing failures;
//! - ledger persistence failures. Continuing without a durable record
//!   would reprocess the document next cycle.
//!
//! Success is recorded immediately after the sink returns, so the window in
//! which a crash could cause a duplicate is one document wide and the sink's
//! deterministic naming makes that duplicate an overwrite.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::{Config, OutputProvider, SourceProvider};
use crate::connector_drive::{AuthOptions, DriveConnector};
use crate::connector_local::LocalConnector;
use crate::convert;
use crate::error::{AuthError, PipelineError};
use crate::ledger::Ledger;
use crate::models::{Document, OutputArtifact};
use crate::naming::artifact_stem;
use crate::progress::{CycleProgressEvent, NoProgress, ProgressReporter};
use crate::sink_fs::DirectorySink;
use crate::sink_git::GitSink;
use crate::traits::{Connector, Converter, Sink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Convert,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Fetch => "fetch",
            Stage::Convert => "convert",
            Stage::Write => "write",
        })
    }
}

/// A document that could not be processed this cycle.
#[derive(Debug, Clone)]
pub struct DocumentFailure {
    pub document_id: String,
    pub title: String,
    pub stage: Stage,
    pub message: String,
    /// The repository sink refused to write because it could not sync.
    pub sync_conflict: bool,
}

#[derive(Debug, Clone)]
pub struct WrittenDocument {
    pub document_id: String,
    pub title: String,
    pub output_path: String,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub discovered: usize,
    pub skipped: usize,
    pub written: Vec<WrittenDocument>,
    pub failed: Vec<DocumentFailure>,
}

enum Outcome {
    Written(String),
    Failed(DocumentFailure),
}

pub struct Pipeline {
    connector: Box<dyn Connector>,
    converter: Box<dyn Converter>,
    sink: Box<dyn Sink>,
    ledger: Ledger,
    record_failures: bool,
    progress: Box<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(
        connector: Box<dyn Connector>,
        converter: Box<dyn Converter>,
        sink: Box<dyn Sink>,
        ledger: Ledger,
    ) -> Self {
        Self {
            connector,
            converter,
            sink,
            ledger,
            record_failures: true,
            progress: Box::new(NoProgress),
        }
    }

    /// Wire the connector, converter, sink and ledger named in `config`.
    ///
    /// Fails fast on a corrupt ledger or an unusable sink; credentials are
    /// not touched until the first cycle.
    pub fn from_config(config: &Config, auth: AuthOptions) -> Result<Self> {
        let ledger = Ledger::load(&config.state.path)?;

        let connector: Box<dyn Connector> = match config.source.provider {
            SourceProvider::GoogleDrive => {
                let drive = config
                    .source
                    .google_drive
                    .as_ref()
                    .context("[source.google_drive] is not configured")?;
                Box::new(DriveConnector::from_config(drive, auth)?)
            }
            SourceProvider::Local => {
                let local = config
                    .source
                    .local
                    .as_ref()
                    .context("[source.local] is not configured")?;
                Box::new(LocalConnector::new(local)?)
            }
        };

        let converter = convert::from_config(&config.converter)?;

        let sink: Box<dyn Sink> = match config.output.provider {
            OutputProvider::Filesystem => Box::new(DirectorySink::from_config(&config.output)),
            OutputProvider::Git => Box::new(GitSink::from_config(&config.output)?),
        };

        Ok(Self::new(connector, converter, sink, ledger)
            .with_failure_records(config.state.record_failures))
    }

    pub fn with_failure_records(mut self, record: bool) -> Self {
        self.record_failures = record;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Make sure the connector's credentials are usable without running a cycle.
    pub async fn authenticate(&self) -> Result<(), PipelineError> {
        self.connector
            .authenticate()
            .await
            .map_err(classify_cycle_error)
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport, PipelineError> {
        self.authenticate().await?;

        self.progress.report(CycleProgressEvent::Discovering {
            connector: self.connector.name().to_string(),
        });
        let listed = self
            .connector
            .list_pending()
            .await
            .map_err(classify_cycle_error)?;

        let mut report = CycleReport {
            discovered: listed.len(),
            ..CycleReport::default()
        };

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for document in listed {
            if !seen.insert(document.id.clone()) {
                continue;
            }
            if self.ledger.is_processed(&document.id) {
                tracing::debug!(document_id = %document.id, "already processed");
                report.skipped += 1;
                continue;
            }
            pending.push(document);
        }

        tracing::info!(
            connector = self.connector.name(),
            discovered = report.discovered,
            pending = pending.len(),
            "starting cycle"
        );

        let total = pending.len() as u64;
        for (i, document) in pending.iter().enumerate() {
            self.progress.report(CycleProgressEvent::Processing {
                n: i as u64 + 1,
                total,
                title: document.title.clone(),
            });

            match self.process(document).await? {
                Outcome::Written(output_path) => {
                    self.ledger
                        .mark_success(&document.id, &document.title, &output_path, Utc::now())?;
                    tracing::info!(
                        document_id = %document.id,
                        title = %document.title,
                        output_path = %output_path,
                        "processed"
                    );
                    report.written.push(WrittenDocument {
                        document_id: document.id.clone(),
                        title: document.title.clone(),
                        output_path,
                    });
                }
                Outcome::Failed(failure) => {
                    tracing::error!(
                        document_id = %failure.document_id,
                        title = %failure.title,
                        stage = %failure.stage,
                        sync_conflict = failure.sync_conflict,
                        error = %failure.message,
                        "document failed; will retry next cycle"
                    );
                    self.progress.report(CycleProgressEvent::DocumentFailed {
                        title: failure.title.clone(),
                        stage: failure.stage.to_string(),
                    });
                    if self.record_failures {
                        self.ledger.mark_failure(
                            &failure.document_id,
                            &failure.title,
                            &format!("{}: {}", failure.stage, failure.message),
                            Utc::now(),
                        )?;
                    }
                    report.failed.push(failure);
                }
            }
        }

        self.progress.report(CycleProgressEvent::Finished {
            written: report.written.len() as u64,
            failed: report.failed.len() as u64,
            skipped: report.skipped as u64,
        });
        Ok(report)
    }

    /// Fetch, convert and write one document. Only authentication errors
    /// escape as `Err`.
    async fn process(&self, document: &Document) -> Result<Outcome, PipelineError> {
        let failed = |stage: Stage, message: String, sync_conflict: bool| {
            Outcome::Failed(DocumentFailure {
                document_id: document.id.clone(),
                title: document.title.clone(),
                stage,
                message,
                sync_conflict,
            })
        };

        let bytes = match self.connector.fetch(document).await {
            Ok(bytes) => bytes,
            Err(e) => match e.downcast::<AuthError>() {
                Ok(auth) => return Err(PipelineError::Authentication(auth)),
                Err(e) => return Ok(failed(Stage::Fetch, format!("{:#}", e), false)),
            },
        };

        let converted = match self.converter.convert(&bytes, &document.title).await {
            Ok(converted) => converted,
            Err(e) => return Ok(failed(Stage::Convert, format!("{:#}", e), false)),
        };

        let timestamp = document.modified_time.unwrap_or_else(Utc::now);
        let artifact = OutputArtifact {
            document_id: document.id.clone(),
            title: document.title.clone(),
            stem: artifact_stem(&document.title, timestamp),
            format: converted.format,
            body: converted.text,
            source: Some(bytes),
            page_images: converted.page_images,
        };

        match self.sink.write(&artifact) {
            Ok(path) => Ok(Outcome::Written(path)),
            Err(e) => Ok(failed(Stage::Write, e.to_string(), e.is_sync_conflict())),
        }
    }

    /// Run cycles separated by `interval` until `shutdown` turns true.
    ///
    /// Authentication and listing failures are logged and retried next
    /// cycle; ledger failures stop the loop. Shutdown is only observed
    /// between cycles, never in the middle of a document.
    pub async fn run_forever(
        &mut self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64, PipelineError> {
        tracing::info!(interval_secs = interval.as_secs(), "starting continuous loop");
        let mut cycles = 0u64;
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(report) => tracing::info!(
                    written = report.written.len(),
                    failed = report.failed.len(),
                    skipped = report.skipped,
                    "cycle complete"
                ),
                Err(PipelineError::Ledger(e)) => return Err(PipelineError::Ledger(e)),
                Err(e) => tracing::error!(error = %e, "cycle aborted"),
            }
            cycles += 1;

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Nobody can signal shutdown any more; keep polling.
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
        tracing::info!(cycles, "shutdown requested; stopping");
        Ok(cycles)
    }
}

fn classify_cycle_error(err: anyhow::Error) -> PipelineError {
    match err.downcast::<AuthError>() {
        Ok(auth) => PipelineError::Authentication(auth),
        Err(other) => PipelineError::Discovery(other),
    }
}

/// A receiver that turns true on Ctrl-C or SIGTERM.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received; finishing current cycle");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
