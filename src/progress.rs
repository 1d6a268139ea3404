//! Upload progress reporting.
//!
//! Reports per-file progress during `sumflow upload` so users see what is
//! transferring, what the server is doing with it, and roughly when it will
//! finish. Progress is emitted on **stderr** so stdout remains parseable for
//! scripts.

use std::io::Write;

use crate::models::{ItemStatus, SessionStats};
use crate::session::ItemView;

/// A single progress event for an upload run.
#[derive(Clone, Debug)]
pub enum UploadProgressEvent {
    /// An item changed status or percent.
    Item(ItemView),
    /// Aggregate counts, emitted when the run settles.
    Summary(SessionStats),
}

/// Reports upload progress. Implementations write to stderr (human or JSON).
pub trait UploadProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the driver loop.
    fn report(&self, event: UploadProgressEvent);
}

/// Human-friendly progress on stderr:
/// `upload docs/report.pdf  summarizing  64%  ~12s`.
pub struct StderrProgress;

impl UploadProgressReporter for StderrProgress {
    fn report(&self, event: UploadProgressEvent) {
        let line = match &event {
            UploadProgressEvent::Item(view) => format!("upload {}\n", item_line(view)),
            UploadProgressEvent::Summary(stats) => format!(
                "upload done  {} files  {} done, {} committed, {} failed  {}\n",
                stats.total,
                stats.done,
                stats.committed,
                stats.error,
                crate::models::pretty_bytes(stats.total_bytes)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

fn item_line(view: &ItemView) -> String {
    let name = if view.relative_path.is_empty() {
        view.name.as_str()
    } else {
        view.relative_path.as_str()
    };
    let phase = match (view.status, view.stage) {
        (ItemStatus::Processing, Some(stage)) => stage.label(),
        (status, _) => status.as_str(),
    };
    let mut line = format!("{}  {}", name, phase);
    match view.status {
        ItemStatus::Uploading | ItemStatus::Processing => {
            line.push_str(&format!("  {}%", view.percent));
            if let Some(eta) = view.eta_secs {
                line.push_str(&format!("  ~{}", format_eta(eta)));
            }
        }
        ItemStatus::Done if view.committed => line.push_str("  committed"),
        ItemStatus::Error => {
            if let Some(err) = &view.error {
                line.push_str(&format!("  {}", err));
            }
        }
        _ => {}
    }
    line
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl UploadProgressReporter for JsonProgress {
    fn report(&self, event: UploadProgressEvent) {
        let obj = match &event {
            UploadProgressEvent::Item(view) => serde_json::json!({
                "event": "progress",
                "item": view,
            }),
            UploadProgressEvent::Summary(stats) => serde_json::json!({
                "event": "summary",
                "stats": stats,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl UploadProgressReporter for NoProgress {
    fn report(&self, _event: UploadProgressEvent) {}
}

/// `75` → `"1m 15s"`, `9` → `"9s"`.
pub fn format_eta(secs: u64) -> String {
    let m = secs / 60;
    let s = secs % 60;
    if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn UploadProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
