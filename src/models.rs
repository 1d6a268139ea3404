//! Core data models used throughout SumFlow.
//!
//! These types represent the files a user selected, the per-file upload
//! records the session tracks, and the job-status payloads the server
//! reports back while processing them.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

/// Where a file's bytes come from.
#[derive(Debug, Clone)]
pub enum FilePayload {
    /// A file on local disk, streamed when the upload starts.
    Path(PathBuf),
    /// Bytes already in memory (ZIP entries).
    Memory(Bytes),
}

/// A file selected for upload, before it becomes an [`UploadItem`].
#[derive(Debug, Clone)]
pub struct FileSource {
    pub name: String,
    pub size: u64,
    /// Path relative to the selection root; empty for a single loose file.
    pub relative_path: String,
    /// Milliseconds since the Unix epoch.
    pub last_modified: i64,
    pub payload: FilePayload,
}

/// Identity used for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
    pub relative_path: String,
    pub name: String,
    pub size: u64,
    pub last_modified: i64,
}

impl FileSource {
    pub fn from_path(path: &Path, relative_path: &str) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified = metadata
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        let last_modified = modified
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Self {
            name,
            size: metadata.len(),
            relative_path: relative_path.to_string(),
            last_modified,
            payload: FilePayload::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: &str, relative_path: &str, bytes: Bytes, last_modified: i64) -> Self {
        Self {
            name: name.to_string(),
            size: bytes.len() as u64,
            relative_path: relative_path.to_string(),
            last_modified,
            payload: FilePayload::Memory(bytes),
        }
    }

    pub fn key(&self) -> FileKey {
        FileKey {
            relative_path: self.relative_path.clone(),
            name: self.name.clone(),
            size: self.size,
            last_modified: self.last_modified,
        }
    }

    /// Lowercased extension including the dot (`".pdf"`), or `""`.
    pub fn extension(&self) -> String {
        extension_of(&self.name)
    }

}

pub fn extension_of(name: &str) -> String {
    match name.rfind('.') {
        Some(i) if i + 1 < name.len() => name[i..].to_lowercase(),
        _ => String::new(),
    }
}

/// Filename without its final extension. A leading dot is kept.
pub fn stem_of(name: &str) -> String {
    match name.rfind('.') {
        Some(i) if i > 0 => name[..i].to_string(),
        _ => name.to_string(),
    }
}

/// Client-side lifecycle of one upload item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Idle,
    Uploading,
    Processing,
    Done,
    Error,
}

impl ItemStatus {
    /// `Idle → Uploading → Processing → Done`, `any → Error`,
    /// and `Uploading → Idle` for a cancel.
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Idle, Uploading)
                | (Uploading, Processing)
                | (Processing, Done)
                | (Uploading, Idle)
                | (_, Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Done | ItemStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Idle => "idle",
            ItemStatus::Uploading => "uploading",
            ItemStatus::Processing => "processing",
            ItemStatus::Done => "done",
            ItemStatus::Error => "error",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final OCR/summary outcome attached to a finished item.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentResult {
    pub summary: String,
    /// Always two segments, `main/sub`.
    pub category: String,
    pub tags: Vec<String>,
    pub server_file_id: Option<String>,
    pub raw: Value,
}

/// One selected (or archive-expanded) file tracked by the session.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub id: String,
    pub file: FileSource,
    pub status: ItemStatus,
    pub progress: u8,
    pub task_id: Option<String>,
    pub batch_id: Option<String>,
    pub category_name: String,
    pub title: String,
    pub error: Option<String>,
    pub result: Option<DocumentResult>,
    /// Success has been observed and the committer owns this task.
    pub finalizing: bool,
    pub committed: bool,
    pub document_id: Option<String>,
}

impl UploadItem {
    pub fn new(file: FileSource, category_name: String, title: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file,
            status: ItemStatus::Idle,
            progress: 0,
            task_id: None,
            batch_id: None,
            category_name,
            title,
            error: None,
            result: None,
            finalizing: false,
            committed: false,
            document_id: None,
        }
    }

    pub fn rejected(file: FileSource, category_name: String, title: String, error: String) -> Self {
        let mut item = Self::new(file, category_name, title);
        item.status = ItemStatus::Error;
        item.error = Some(error);
        item
    }
}

/// Server acknowledgment of an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub task_id: String,
    pub batch_id: Option<String>,
}

/// Coarse server-side processing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Queued,
    Ocr,
    OcrDone,
    Summarizing,
    Categorizing,
    Success,
    Failed,
    Unknown,
}

impl Stage {
    pub fn parse(raw: &str) -> Stage {
        match raw.trim().to_uppercase().as_str() {
            "QUEUED" | "PENDING" => Stage::Queued,
            "RECEIVED" | "STARTED" | "INGEST" | "OCR" | "PROGRESS" => Stage::Ocr,
            "OCR_DONE" => Stage::OcrDone,
            "LLM" => Stage::Summarizing,
            "CATEGORY" => Stage::Categorizing,
            "SUCCESS" | "DONE" => Stage::Success,
            "FAILURE" | "FAILED" | "REVOKED" => Stage::Failed,
            _ => Stage::Unknown,
        }
    }

    /// Expected percent once this stage is reached.
    pub fn milestone(self) -> Option<f64> {
        match self {
            Stage::Queued => Some(0.0),
            Stage::Ocr => Some(30.0),
            Stage::OcrDone => Some(50.0),
            Stage::Summarizing => Some(70.0),
            Stage::Categorizing => Some(85.0),
            Stage::Success => Some(100.0),
            Stage::Failed | Stage::Unknown => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Success | Stage::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Ocr => "extracting text",
            Stage::OcrDone => "preparing summary",
            Stage::Summarizing => "summarizing",
            Stage::Categorizing => "categorizing",
            Stage::Success => "done",
            Stage::Failed => "failed",
            Stage::Unknown => "processing",
        }
    }
}

/// One entry of a (batched) job-status response.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub task_id: Option<String>,
    pub stage: Stage,
    pub percent: Option<f64>,
    pub finish_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl TaskStatus {
    pub fn from_json(v: &Value) -> TaskStatus {
        let raw_stage = ["stage", "state", "status"]
            .iter()
            .find_map(|k| v.get(*k).and_then(|s| s.as_str()))
            .unwrap_or("");
        let stage = Stage::parse(raw_stage);

        let percent = ["client_percent", "percent"]
            .iter()
            .find_map(|k| v.get(*k).and_then(|p| p.as_f64()))
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0));

        let finish_at = ["finish_at", "client_finish_at"]
            .iter()
            .find_map(|k| v.get(*k).and_then(parse_finish_at));

        let result = v.get("result").filter(|r| !r.is_null()).cloned();

        let error = v
            .get("error")
            .and_then(|e| e.as_str())
            .map(|s| s.to_string())
            .or_else(|| {
                if stage == Stage::Failed {
                    result
                        .as_ref()
                        .and_then(|r| r.get("error"))
                        .and_then(|e| e.as_str())
                        .map(|s| s.to_string())
                } else {
                    None
                }
            });

        TaskStatus {
            task_id: v
                .get("task_id")
                .and_then(|t| t.as_str())
                .map(|s| s.to_string()),
            stage,
            percent,
            finish_at,
            error,
            result,
        }
    }
}

/// Accepts epoch seconds, epoch milliseconds (> 1e12) or RFC 3339.
pub fn parse_finish_at(v: &Value) -> Option<DateTime<Utc>> {
    let from_number = |n: f64| -> Option<DateTime<Utc>> {
        if !n.is_finite() || n <= 0.0 {
            return None;
        }
        let ms = if n > 1e12 { n } else { n * 1000.0 };
        Utc.timestamp_millis_opt(ms as i64).single()
    };
    match v {
        Value::Number(n) => n.as_f64().and_then(from_number),
        Value::String(s) => {
            if let Ok(n) = s.trim().parse::<f64>() {
                return from_number(n);
            }
            DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|d| d.with_timezone(&Utc))
        }
        _ => None,
    }
}

/// Payload of the commit call that persists a finished document.
#[derive(Debug, Clone, Serialize)]
pub struct CommitRequest {
    pub batch_id: Option<String>,
    pub task_id: String,
    pub original_filename: String,
    pub changed_filename: String,
    pub file_size_bytes: u64,
    pub title: String,
}

/// Aggregate view over the session's items.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub idle: usize,
    pub uploading: usize,
    pub processing: usize,
    pub done: usize,
    pub error: usize,
    pub committed: usize,
    pub total_bytes: u64,
    pub average_progress: f64,
}

/// Human-readable size, e.g. `"1.5 MB"`.
pub fn pretty_bytes(n: u64) -> String {
    if n == 0 {
        return "0 B".to_string();
    }
    const SIZES: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = n as f64;
    let mut i = 0;
    while value >= 1024.0 && i < SIZES.len() - 1 {
        value /= 1024.0;
        i += 1;
    }
    format!("{:.1} {}", value, SIZES[i])
}
