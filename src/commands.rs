//! CLI command implementations.
//!
//! Results go to stdout; progress and logs go to stderr.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::api::{DocumentApi, HttpApi};
use crate::config::{Config, EXAMPLE_CONFIG};
use crate::driver::Driver;
use crate::export;
use crate::models::{pretty_bytes, ItemStatus, UploadItem};
use crate::poller;
use crate::progress::ProgressMode;
use crate::queue;
use crate::session::UploadSession;

/// Builds the queue without touching the network and prints it.
pub fn run_scan(config: &Config, paths: &[PathBuf]) -> Result<()> {
    let files = queue::scan_paths(paths, &config.upload)?;
    let mut session = UploadSession::new(config.upload.clone(), config.estimator.clone());
    session.add_files(files);

    for item in session.items() {
        println!("{}", scan_line(item));
    }
    let stats = session.stats();
    eprintln!(
        "{} files ({}), {} ready, {} rejected",
        stats.total,
        pretty_bytes(stats.total_bytes),
        stats.idle,
        stats.error
    );
    Ok(())
}

fn scan_line(item: &UploadItem) -> String {
    let path = if item.file.relative_path.is_empty() {
        item.file.name.as_str()
    } else {
        item.file.relative_path.as_str()
    };
    let mut line = format!(
        "{:<6} {:<14} {:<24} {:>10}  {}",
        item.status.as_str(),
        item.category_name,
        item.title,
        pretty_bytes(item.file.size),
        path
    );
    if let Some(err) = &item.error {
        line.push_str(&format!("  ({})", err));
    }
    line
}

pub struct UploadOptions {
    pub concurrency: Option<usize>,
    pub progress: Option<String>,
    pub wait: bool,
    pub export: Option<PathBuf>,
}

/// Queues, uploads and (unless `wait` is off) follows every file to commit.
pub async fn run_upload(config: &Config, paths: &[PathBuf], opts: UploadOptions) -> Result<()> {
    let mut config = config.clone();
    if let Some(n) = opts.concurrency {
        if n == 0 {
            bail!("--concurrency must be >= 1");
        }
        config.upload.max_concurrency = n;
    }
    let mode = match opts.progress.as_deref() {
        None => ProgressMode::default_for_tty(),
        Some("human") => ProgressMode::Human,
        Some("json") => ProgressMode::Json,
        Some("off") => ProgressMode::Off,
        Some(other) => bail!("unknown progress mode '{}': expected human, json or off", other),
    };

    let scan_config = config.upload.clone();
    let scan_roots = paths.to_vec();
    let files = tokio::task::spawn_blocking(move || queue::scan_paths(&scan_roots, &scan_config)).await??;
    let api: Arc<dyn DocumentApi> = Arc::new(HttpApi::new(&config.server, &config.upload.params)?);
    let mut driver = Driver::new(api, &config, mode.reporter());
    driver.add_files(files).await;

    if driver.session().idle_ids().is_empty() {
        eprintln!("Nothing to upload.");
    } else {
        driver.start_all();
        tokio::select! {
            _ = driver.run(opts.wait) => {}
            _ = tokio::signal::ctrl_c() => bail!("interrupted; in-flight uploads abandoned"),
        }
    }

    let session = driver.into_session();
    for item in session.items() {
        println!("{}", result_line(item));
    }

    if let Some(path) = &opts.export {
        let n = export::export_results(session.items(), path)?;
        eprintln!("Exported {} results to {}", n, path.display());
    }

    let stats = session.stats();
    if stats.error > 0 {
        bail!("{} of {} files failed", stats.error, stats.total);
    }
    Ok(())
}

fn result_line(item: &UploadItem) -> String {
    let mut line = format!("{:<10} {}", item.status.as_str(), item.file.name);
    match item.status {
        ItemStatus::Done => {
            if let Some(result) = &item.result {
                line.push_str(&format!("  [{}]", result.category));
            }
            match &item.document_id {
                Some(doc) => line.push_str(&format!("  document {}", doc)),
                None => line.push_str("  (not committed)"),
            }
        }
        ItemStatus::Processing => {
            if let Some(task) = &item.task_id {
                line.push_str(&format!("  task {}", task));
            }
        }
        ItemStatus::Error => {
            if let Some(err) = &item.error {
                line.push_str(&format!("  {}", err));
            }
        }
        _ => {}
    }
    line
}

/// One status request for the given tasks, printed one per line.
pub async fn run_status(config: &Config, task_ids: &[String]) -> Result<()> {
    let api = HttpApi::new(&config.server, &config.upload.params)?;
    let statuses = poller::fetch_statuses(&api, task_ids)
        .await
        .context("status request failed")?;

    for id in task_ids {
        match statuses.get(id) {
            Some(status) => {
                let mut line = format!("{}  {}", id, status.stage.label());
                if let Some(p) = status.percent {
                    line.push_str(&format!("  {:.0}%", p));
                }
                if let Some(at) = status.finish_at {
                    line.push_str(&format!("  finish {}", at.to_rfc3339()));
                }
                if let Some(err) = &status.error {
                    line.push_str(&format!("  {}", err));
                }
                println!("{}", line);
            }
            None => println!("{}  unknown", id),
        }
    }
    Ok(())
}

/// Writes the example config unless one already exists.
pub fn run_init(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    std::fs::write(path, EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}
