//! Cycle progress on stderr.
//!
//! The cycle summary is printed on stdout; progress lines go to stderr so
//! scripts can keep one and drop the other.

use serde::Serialize;
use std::io::Write;

/// Something an operator watching the terminal wants to see.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CycleProgressEvent {
    /// Listing the source; the total is not known yet.
    Discovering { connector: String },
    /// Starting document `n` of `total` pending documents.
    Processing { n: u64, total: u64, title: String },
    /// The document just attempted will be retried next cycle.
    DocumentFailed { title: String, stage: String },
    Finished {
        written: u64,
        failed: u64,
        skipped: u64,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: CycleProgressEvent);
}

/// `relay  3/12  Scan.pdf` style lines.
pub struct HumanProgress;

impl ProgressReporter for HumanProgress {
    fn report(&self, event: CycleProgressEvent) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", human_line(&event));
        let _ = stderr.flush();
    }
}

fn human_line(event: &CycleProgressEvent) -> String {
    match event {
        CycleProgressEvent::Discovering { connector } => {
            format!("relay  listing {}...", connector)
        }
        CycleProgressEvent::Processing { n, total, title } => {
            let width = total.to_string().len();
            format!("relay  {:>width$}/{}  {}", n, total, title, width = width)
        }
        CycleProgressEvent::DocumentFailed { title, stage } => {
            format!("relay  failed at {}: {}", stage, title)
        }
        CycleProgressEvent::Finished {
            written,
            failed,
            skipped,
        } => format!(
            "relay  done: {} written, {} failed, {} already processed",
            written, failed, skipped
        ),
    }
}

/// One JSON object per line: `{"event":"progress","phase":...}`.
pub struct JsonProgress;

#[derive(Serialize)]
struct JsonLine<'a> {
    event: &'static str,
    #[serde(flatten)]
    progress: &'a CycleProgressEvent,
}

impl ProgressReporter for JsonProgress {
    fn report(&self, event: CycleProgressEvent) {
        let line = JsonLine {
            event: "progress",
            progress: &event,
        };
        if let Ok(json) = serde_json::to_string(&line) {
            let _ = writeln!(std::io::stderr().lock(), "{}", json);
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: CycleProgressEvent) {}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human lines on an interactive stderr, nothing when redirected.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(HumanProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
