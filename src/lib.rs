//! # PDF Relay
//!
//! Watches a document source for PDFs, converts each one to markdown (or a
//! FreeMind mind map) once, and delivers the result to a notes directory or
//! a git repository.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌──────────────┐
//! │  Connector   │──▶│ Converter  │──▶│     Sink     │
//! │ Drive/Local  │   │ Text/Gemini│   │ Dir/Git repo │
//! └──────┬───────┘   └────────────┘   └──────┬───────┘
//!        │                                   │
//!        └────────────▶ Ledger ◀─────────────┘
//!                    (ledger.json)
//! ```
//!
//! The [`ledger`] is the only state: a document with a `success` record is
//! never handed to the converter again.
//!
//! ## Quick Start
//!
//! ```bash
//! pdf-relay auth                  # one-time Google Drive consent
//! pdf-relay run --once            # process everything pending, then exit
//! pdf-relay run                   # poll every [pipeline].poll_interval_secs
//! pdf-relay status                # show the ledger
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`traits`] | Connector, converter and sink seams |
//! | [`oauth`] | OAuth tokens, PKCE and consent prompts |
//! | [`connector_drive`] | Google Drive folder connector |
//! | [`connector_local`] | Local directory connector |
//! | [`convert`] | Text-extraction and Gemini converters |
//! | [`mindmap`] | Mind-map tree, validation and FreeMind output |
//! | [`routing`] | Hashtag / classifier choice between markdown and mind map |
//! | [`render`] | Companion assets: source PDF or page images |
//! | [`sink_fs`] | Directory sink |
//! | [`sink_git`] | Git repository sink |
//! | [`ledger`] | Idempotency ledger |
//! | [`pipeline`] | Cycle orchestration |

pub mod atomic;
pub mod config;
pub mod connector_drive;
pub mod connector_local;
pub mod convert;
pub mod error;
pub mod ledger;
pub mod mindmap;
pub mod models;
pub mod naming;
pub mod oauth;
pub mod pipeline;
pub mod progress;
pub mod render;
pub mod routing;
pub mod sink_fs;
pub mod sink_git;
pub mod status;
pub mod traits;
