use anyhow::{bail, Result};

use crate::config::Config;
use crate::ledger::{Ledger, ProcessingRecord, RecordStatus};

/// Print the ledger: one line per document, or the full record for one id.
pub fn run_status(config: &Config, document_id: Option<&str>) -> Result<()> {
    let ledger = Ledger::load(&config.state.path)?;

    if let Some(id) = document_id {
        let Some(record) = ledger.record(id) else {
            bail!("no ledger record for document: {}", id);
        };
        print_record(id, record);
        return Ok(());
    }

    if ledger.is_empty() {
        println!("No documents recorded in {}.", ledger.path().display());
        return Ok(());
    }

    let succeeded = ledger
        .records()
        .filter(|(_, r)| r.status == RecordStatus::Success)
        .count();

    println!("{:<8} {:<20} {:<36} OUTPUT", "STATUS", "PROCESSED", "DOCUMENT");
    for (id, record) in ledger.records() {
        let output = match record.status {
            RecordStatus::Success => record.output_path.as_str(),
            RecordStatus::Failed => record.error.as_deref().unwrap_or(""),
        };
        println!(
            "{:<8} {:<20} {:<36} {}",
            status_label(record.status),
            record.processed_at.format("%Y-%m-%d %H:%M:%S"),
            id,
            output
        );
    }
    println!();
    println!(
        "{} documents, {} processed, {} pending retry",
        ledger.len(),
        succeeded,
        ledger.len() - succeeded
    );
    Ok(())
}

fn status_label(status: RecordStatus) -> &'static str {
    match status {
        RecordStatus::Success => "success",
        RecordStatus::Failed => "failed",
    }
}

fn print_record(id: &str, record: &ProcessingRecord) {
    println!("--- Document ---");
    println!("id:           {}", id);
    if let Some(title) = &record.title {
        println!("title:        {}", title);
    }
    println!("status:       {}", status_label(record.status));
    println!("processed_at: {}", record.processed_at.to_rfc3339());
    if !record.output_path.is_empty() {
        println!("output:       {}", record.output_path);
    }
    if let Some(error) = &record.error {
        println!("error:        {}", error);
    }
    for (key, value) in &record.extra {
        println!("{}: {}", key, value);
    }
}
