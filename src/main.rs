//! # PDF Relay CLI (`pdf-relay`)
//!
//! ## Usage
//!
//! ```bash
//! pdf-relay --config ./config/relay.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pdf-relay run` | Poll the source and process new PDFs until interrupted |
//! | `pdf-relay run --once` | Run a single cycle and exit |
//! | `pdf-relay auth` | Obtain or refresh the Google Drive credential |
//! | `pdf-relay status [ID]` | Show ledger records |
//!
//! Logs go to stderr and honour `RUST_LOG`; cycle summaries go to stdout.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use pdf_relay::config::{self, SourceProvider};
use pdf_relay::connector_drive::{AuthOptions, DriveConnector};
use pdf_relay::pipeline::{self, CycleReport, Pipeline};
use pdf_relay::progress::ProgressMode;
use pdf_relay::status;
use pdf_relay::traits::Connector;

/// PDF Relay: convert new PDFs from a watched folder into markdown notes.
#[derive(Parser)]
#[command(name = "pdf-relay", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/relay.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Progress on stderr. Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process pending documents.
    ///
    /// Without `--once`, runs a cycle every `[pipeline].poll_interval_secs`
    /// until SIGINT or SIGTERM; the current cycle always finishes first.
    Run {
        /// Run exactly one cycle and exit.
        #[arg(long)]
        once: bool,

        /// Never open a browser; paste the authorization code instead.
        #[arg(long)]
        headless: bool,

        /// Discard the cached credential and authorize again.
        #[arg(long)]
        force_reauth: bool,
    },

    /// Authorize access to the source without processing anything.
    Auth {
        /// Never open a browser; paste the authorization code instead.
        #[arg(long)]
        headless: bool,

        /// Discard the cached credential and authorize again.
        #[arg(long)]
        force_reauth: bool,
    },

    /// Show what the ledger knows.
    Status {
        /// Show the full record for one document.
        document_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Run {
            once,
            headless,
            force_reauth,
        } => {
            let auth = AuthOptions {
                headless,
                force_reauth,
            };
            let mut relay = Pipeline::from_config(&cfg, auth)?.with_progress(progress.reporter());
            if once {
                let report = relay.run_cycle().await?;
                print_report(&report);
            } else {
                let interval = Duration::from_secs(cfg.pipeline.poll_interval_secs);
                let cycles = relay
                    .run_forever(interval, pipeline::shutdown_signal())
                    .await?;
                println!("stopped after {} cycles", cycles);
            }
        }
        Commands::Auth {
            headless,
            force_reauth,
        } => match (&cfg.source.provider, &cfg.source.google_drive) {
            (SourceProvider::GoogleDrive, Some(drive)) => {
                let auth = AuthOptions {
                    headless,
                    force_reauth,
                };
                DriveConnector::from_config(drive, auth)?
                    .authenticate()
                    .await?;
                println!(
                    "Authorized. Credential cached at {}",
                    drive.token_cache_path().display()
                );
            }
            _ => println!("The configured source needs no authorization."),
        },
        Commands::Status { document_id } => {
            status::run_status(&cfg, document_id.as_deref())?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "pdf_relay=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_report(report: &CycleReport) {
    println!("cycle");
    println!("  discovered: {} documents", report.discovered);
    println!("  already processed: {}", report.skipped);
    println!("  written: {}", report.written.len());
    for written in &report.written {
        println!("    {} -> {}", written.title, written.output_path);
    }
    println!("  failed: {}", report.failed.len());
    for failure in &report.failed {
        println!(
            "    {} ({}): {}",
            failure.title, failure.stage, failure.message
        );
    }
    println!("ok");
}
