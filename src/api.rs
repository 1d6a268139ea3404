//! Backend contract consumed by the upload client.
//!
//! [`DocumentApi`] is the seam between the session and the network. The
//! production implementation, [`HttpApi`], talks to the ingestion server
//! with `reqwest`; tests substitute an in-memory fake.
//!
//! # Endpoints
//!
//! | Method | Path (configurable) | Purpose |
//! |--------|---------------------|---------|
//! | `POST` | `/upload` | multipart file + metadata, returns `task_id` |
//! | `GET`  | `/task/status/{id}` | one task's stage and result |
//! | `POST` | `/task/status/batch` | stages for many task ids at once |
//! | `POST` | `/commit` | persist a finished document, returns `document_id` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::config::{ProcessingParams, ServerConfig};
use crate::error::{UploadError, UploadResult};
use crate::models::{CommitRequest, FilePayload, TaskStatus, UploadReceipt};
use crate::uploader::{memory_chunks, progress_body, CHUNK_BYTES};

/// Byte-progress callback: `(percent 0..=100, sampled at)`.
pub type ProgressFn = Arc<dyn Fn(u8, DateTime<Utc>) + Send + Sync>;

/// Everything the ingestion endpoint needs for one file.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub relative_path: String,
    pub category_name: String,
    pub title: String,
    /// Disk payloads are streamed, never loaded whole.
    pub payload: FilePayload,
}

#[async_trait]
pub trait DocumentApi: Send + Sync {
    /// Transfers one file. Must stop promptly once `cancel` fires.
    async fn upload(
        &self,
        request: UploadRequest,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> UploadResult<UploadReceipt>;

    /// Status for many tasks in a single request.
    async fn batch_status(&self, task_ids: &[String]) -> UploadResult<HashMap<String, TaskStatus>>;

    /// Status (and, once finished, the full result) of one task.
    async fn task_status(&self, task_id: &str) -> UploadResult<TaskStatus>;

    /// Persists a finished document; returns its document id.
    async fn commit(&self, request: &CommitRequest) -> UploadResult<String>;
}

pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    upload_path: String,
    status_path: String,
    batch_status_path: String,
    commit_path: String,
    params: ProcessingParams,
}

impl HttpApi {
    pub fn new(server: &ServerConfig, params: &ProcessingParams) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(server.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: server.base_url.trim_end_matches('/').to_string(),
            token: server.resolved_token(),
            upload_path: server.upload_path.clone(),
            status_path: server.status_path.clone(),
            batch_status_path: server.batch_status_path.clone(),
            commit_path: server.commit_path.clone(),
            params: params.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("Accept", "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_json(&self, builder: reqwest::RequestBuilder) -> UploadResult<Value> {
        let response = self.authorized(builder).send().await?;
        read_json(response).await
    }
}

#[async_trait]
impl DocumentApi for HttpApi {
    async fn upload(
        &self,
        request: UploadRequest,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> UploadResult<UploadReceipt> {
        let (body, len) = match request.payload {
            FilePayload::Memory(data) => {
                let len = data.len() as u64;
                (progress_body(memory_chunks(data), len, on_progress, cancel.clone()), len)
            }
            FilePayload::Path(path) => {
                let file = tokio::fs::File::open(&path).await?;
                let len = file.metadata().await?.len();
                let chunks = ReaderStream::with_capacity(file, CHUNK_BYTES);
                (progress_body(chunks, len, on_progress, cancel.clone()), len)
            }
        };
        let part = reqwest::multipart::Part::stream_with_length(body, len)
            .file_name(request.file_name.clone())
            .mime_str("application/octet-stream")?;

        let mut form = reqwest::multipart::Form::new().part("file", part);
        if !request.relative_path.is_empty() {
            form = form.text("relpath", request.relative_path.clone());
        }
        for (key, value) in self.params.form_fields() {
            form = form.text(key, value);
        }
        form = form
            .text("category_name", request.category_name.clone())
            .text("title_override", request.title.clone());

        let send = self.send_json(self.client.post(self.url(&self.upload_path)).multipart(form));
        let json = tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            res = send => res,
        };
        match json {
            Ok(v) => parse_upload_receipt(&v),
            Err(_) if cancel.is_cancelled() => Err(UploadError::Cancelled),
            Err(e) => Err(e),
        }
    }

    async fn batch_status(&self, task_ids: &[String]) -> UploadResult<HashMap<String, TaskStatus>> {
        let body = serde_json::json!({ "task_ids": task_ids });
        let json = self
            .send_json(self.client.post(self.url(&self.batch_status_path)).json(&body))
            .await?;
        Ok(parse_batch_status(&json))
    }

    async fn task_status(&self, task_id: &str) -> UploadResult<TaskStatus> {
        let path = format!("{}/{}", self.status_path.trim_end_matches('/'), task_id);
        let json = self
            .send_json(self.client.get(self.url(&path)).header("Cache-Control", "no-store"))
            .await?;
        let mut status = TaskStatus::from_json(&json);
        if status.task_id.is_none() {
            status.task_id = Some(task_id.to_string());
        }
        Ok(status)
    }

    async fn commit(&self, request: &CommitRequest) -> UploadResult<String> {
        let json = self
            .send_json(self.client.post(self.url(&self.commit_path)).json(request))
            .await?;
        parse_commit_response(&json)
    }
}

async fn read_json(response: reqwest::Response) -> UploadResult<Value> {
    let status = response.status();
    let text = response.text().await?;
    let json: Value = serde_json::from_str(&text).unwrap_or_else(|_| serde_json::json!({ "raw": text }));

    if status.is_success() {
        return Ok(json);
    }

    let message = ["detail", "error", "message"]
        .iter()
        .find_map(|k| json.get(*k).and_then(|v| v.as_str()))
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("HTTP {}", status));
    Err(UploadError::Http {
        status: status.as_u16(),
        message,
    })
}

/// Accepts `{task_id, batch_id?}` or `{batch_id, tasks: [{task_id}]}`.
pub fn parse_upload_receipt(v: &Value) -> UploadResult<UploadReceipt> {
    let task_id = v
        .get("task_id")
        .and_then(value_as_id)
        .or_else(|| {
            v.get("tasks")
                .and_then(|t| t.as_array())
                .and_then(|t| t.first())
                .and_then(|t| t.get("task_id"))
                .and_then(value_as_id)
        })
        .ok_or_else(|| UploadError::Protocol("upload response has no task_id".to_string()))?;

    Ok(UploadReceipt {
        task_id,
        batch_id: v.get("batch_id").and_then(value_as_id),
    })
}

/// Accepts `{results: {id: status}}`, `{results: [status]}`, a bare
/// `{id: status}` map, or a bare array of statuses carrying `task_id`.
pub fn parse_batch_status(v: &Value) -> HashMap<String, TaskStatus> {
    let body = v.get("results").unwrap_or(v);
    let mut out = HashMap::new();
    match body {
        Value::Object(map) => {
            for (id, entry) in map {
                if !entry.is_object() {
                    continue;
                }
                let mut status = TaskStatus::from_json(entry);
                status.task_id = Some(id.clone());
                out.insert(id.clone(), status);
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                let status = TaskStatus::from_json(entry);
                if let Some(id) = status.task_id.clone() {
                    out.insert(id, status);
                }
            }
        }
        _ => {}
    }
    out
}

pub fn parse_commit_response(v: &Value) -> UploadResult<String> {
    if v.get("ok").and_then(|ok| ok.as_bool()) == Some(false) {
        let msg = v
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("commit rejected");
        return Err(UploadError::Protocol(msg.to_string()));
    }
    v.get("document_id")
        .and_then(value_as_id)
        .ok_or_else(|| UploadError::Protocol("commit response has no document_id".to_string()))
}

fn value_as_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;
    use serde_json::json;

    #[test]
    fn receipt_from_flat_response() {
        let r = parse_upload_receipt(&json!({"task_id": "t1", "batch_id": "b1"})).unwrap();
        assert_eq!(r.task_id, "t1");
        assert_eq!(r.batch_id.as_deref(), Some("b1"));
    }

    #[test]
    fn receipt_from_tasks_array() {
        let r = parse_upload_receipt(&json!({
            "batch_id": "abcd",
            "tasks": [{"task_id": "t9", "filename": "a.pdf"}]
        }))
        .unwrap();
        assert_eq!(r.task_id, "t9");
        assert_eq!(r.batch_id.as_deref(), Some("abcd"));
    }

    #[test]
    fn receipt_without_task_is_protocol_error() {
        let err = parse_upload_receipt(&json!({"ok": true})).unwrap_err();
        assert!(matches!(err, UploadError::Protocol(_)));
    }

    #[test]
    fn batch_status_map_and_array_forms() {
        let map = parse_batch_status(&json!({
            "results": {"a": {"stage": "OCR"}, "b": {"state": "SUCCESS"}}
        }));
        assert_eq!(map["a"].stage, Stage::Ocr);
        assert_eq!(map["b"].stage, Stage::Success);
        assert_eq!(map["b"].task_id.as_deref(), Some("b"));

        let arr = parse_batch_status(&json!([
            {"task_id": "c", "stage": "LLM", "percent": 64.0},
            {"stage": "OCR"}
        ]));
        assert_eq!(arr.len(), 1);
        assert_eq!(arr["c"].percent, Some(64.0));
    }

    #[test]
    fn commit_response_numeric_id() {
        assert_eq!(parse_commit_response(&json!({"ok": true, "document_id": 42})).unwrap(), "42");
        assert!(parse_commit_response(&json!({"ok": false})).is_err());
        assert!(parse_commit_response(&json!({"ok": true})).is_err());
    }
}
