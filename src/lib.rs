//! # SumFlow
//!
//! Upload client for a document OCR and summarization pipeline.
//!
//! SumFlow queues local files (expanding ZIP archives), uploads them with
//! bounded concurrency, follows each server-side task through a single
//! batched status poll, shows smoothed progress with a finish-time estimate,
//! and commits every finished document exactly once.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   effects   ┌──────────────┐
//! │  Queue   │──▶│   Session    │────────────▶│    Driver    │
//! │ zip/scan │   │  (reducer)   │◀────────────│ upload/poll/ │
//! └──────────┘   └──────┬───────┘   events    │ fetch/commit │
//!                       │                     └──────┬───────┘
//!                       ▼                            ▼
//!                ┌──────────────┐             ┌──────────────┐
//!                │  Estimator   │             │ DocumentApi  │
//!                │ percent+ETA  │             │  (HTTP)      │
//!                └──────────────┘             └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sumflow init                          # write ./config/sumflow.toml
//! sumflow scan ./reports                # preview what would be uploaded
//! sumflow upload ./reports --export results.zip
//! sumflow status <task_id>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors at library seams |
//! | [`archive`] | ZIP expansion |
//! | [`queue`] | Item queue, validation, dedup, directory scan |
//! | [`api`] | Backend contract and its HTTP implementation |
//! | [`uploader`] | Single transfers and the bounded start-all pool |
//! | [`poller`] | Batched task-status polling |
//! | [`estimator`] | Smoothed percent and finish-time estimates |
//! | [`committer`] | Result extraction and commit payloads |
//! | [`session`] | The reducer that owns every item |
//! | [`driver`] | Event loop executing the session's effects |
//! | [`progress`] | Progress reporting on stderr |
//! | [`export`] | Results ZIP export |
//! | [`commands`] | CLI command implementations |

pub mod api;
pub mod archive;
pub mod commands;
pub mod committer;
pub mod config;
pub mod driver;
pub mod error;
pub mod estimator;
pub mod export;
pub mod models;
pub mod poller;
pub mod progress;
pub mod queue;
pub mod session;
pub mod uploader;
