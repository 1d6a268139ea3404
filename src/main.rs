//! # SumFlow CLI (`sumflow`)
//!
//! Uploads documents to the OCR/summarization server, follows each task to
//! completion and commits the results.
//!
//! ## Usage
//!
//! ```bash
//! sumflow --config ./config/sumflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sumflow init` | Write an example configuration file |
//! | `sumflow scan <paths>` | Show what would be uploaded, without network access |
//! | `sumflow upload <paths>` | Upload, wait for processing, commit |
//! | `sumflow status <task_id>...` | Query task status once |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`
//! (default `sumflow=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use sumflow::commands::{self, UploadOptions};
use sumflow::config;

/// SumFlow CLI: queued document uploads with batched progress tracking.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Run `sumflow init` to create one.
#[derive(Parser)]
#[command(
    name = "sumflow",
    about = "SumFlow: upload documents for OCR and summarization, track progress, commit results",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/sumflow.toml`.
    #[arg(long, global = true, default_value = "./config/sumflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Write an example configuration file to the `--config` path.
    Init,

    /// Build the upload queue and print it without uploading.
    ///
    /// Directories are walked recursively; ZIP archives are expanded.
    /// Files that would be rejected are listed with the reason.
    Scan {
        /// Files or directories to scan.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Upload files and follow them through processing.
    ///
    /// Exits non-zero if any file ends in error.
    Upload {
        /// Files or directories to upload.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Maximum simultaneous transfers (overrides `upload.max_concurrency`).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Progress output: `human`, `json` or `off`. Defaults to `human` on a TTY.
        #[arg(long)]
        progress: Option<String>,

        /// Return once every file is uploaded instead of waiting for processing.
        #[arg(long)]
        no_wait: bool,

        /// Write summaries, tags and raw results of finished files to this ZIP.
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Print the current status of one or more tasks.
    Status {
        /// Task ids returned by the upload endpoint.
        #[arg(required = true)]
        task_ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sumflow=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    match &cli.command {
        Commands::Init => {
            commands::run_init(&cli.config)?;
            return Ok(());
        }
        Commands::Scan { paths } => {
            // Use config if available, otherwise a minimal default
            let cfg = if cli.config.exists() {
                config::load_config(&cli.config)?
            } else {
                config::Config::minimal()
            };
            commands::run_scan(&cfg, paths)?;
            return Ok(());
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Upload {
            paths,
            concurrency,
            progress,
            no_wait,
            export,
        } => {
            let opts = UploadOptions {
                concurrency,
                progress,
                wait: !no_wait,
                export,
            };
            commands::run_upload(&cfg, &paths, opts).await?;
        }
        Commands::Status { task_ids } => {
            commands::run_status(&cfg, &task_ids).await?;
        }
        Commands::Init | Commands::Scan { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
