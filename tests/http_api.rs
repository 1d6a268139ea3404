//! `HttpApi` against a local axum server speaking the ingestion protocol.

use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use sumflow::api::{DocumentApi, HttpApi, ProgressFn, UploadRequest};
use sumflow::config::{Config, ProcessingParams};
use sumflow::error::UploadError;
use sumflow::models::{CommitRequest, FilePayload, Stage};
use sumflow::poller;

#[derive(Clone, Default)]
struct Recorded {
    fields: Arc<Mutex<Vec<(String, usize)>>>,
    commits: Arc<Mutex<Vec<Value>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        == Some("Bearer secret")
}

async fn handle_upload(
    State(rec): State<Recorded>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "invalid token"})),
        );
    }
    let mut file_name = String::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            file_name = field.file_name().unwrap_or_default().to_string();
        }
        let data = field.bytes().await.unwrap();
        rec.fields.lock().unwrap().push((name, data.len()));
    }
    (
        StatusCode::OK,
        Json(json!({
            "batch_id": "b-1",
            "tasks": [{"task_id": "t-1", "filename": file_name}]
        })),
    )
}

async fn handle_batch(Json(body): Json<Value>) -> Json<Value> {
    let mut results = serde_json::Map::new();
    for id in body["task_ids"].as_array().cloned().unwrap_or_default() {
        if let Some(id) = id.as_str() {
            results.insert(id.to_string(), json!({"stage": "OCR_DONE", "percent": 55.0}));
        }
    }
    Json(json!({ "results": results }))
}

async fn handle_status(Path(id): Path<String>) -> Json<Value> {
    Json(json!({
        "state": "SUCCESS",
        "result": {"llmSummary": format!("summary of {}", id)}
    }))
}

async fn handle_commit(State(rec): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
    rec.commits.lock().unwrap().push(body);
    Json(json!({"ok": true, "document_id": 77}))
}

async fn handle_broken() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "storage offline"})),
    )
}

async fn spawn_server(with_batch: bool) -> (String, Recorded) {
    let rec = Recorded::default();
    let mut app = Router::new()
        .route("/upload", post(handle_upload))
        .route("/task/status/{id}", get(handle_status))
        .route("/commit", post(handle_commit))
        .route("/broken/commit", post(handle_broken));
    if with_batch {
        app = app.route("/task/status/batch", post(handle_batch));
    }
    let app = app.with_state(rec.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), rec)
}

fn api_for(base_url: &str, token: Option<&str>) -> HttpApi {
    let mut config = Config::minimal();
    config.server.base_url = base_url.to_string();
    config.server.token = token.map(|t| t.to_string());
    HttpApi::new(&config.server, &ProcessingParams::default()).unwrap()
}

fn request(len: usize) -> UploadRequest {
    request_with(FilePayload::Memory(Bytes::from(vec![7u8; len])))
}

fn request_with(payload: FilePayload) -> UploadRequest {
    UploadRequest {
        file_name: "minutes.pdf".into(),
        relative_path: "council/minutes.pdf".into(),
        category_name: "회의록".into(),
        title: "minutes".into(),
        payload,
    }
}

fn recording_progress() -> (ProgressFn, Arc<Mutex<Vec<u8>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let f: ProgressFn = Arc::new(move |pct, _at| sink.lock().unwrap().push(pct));
    (f, seen)
}

#[tokio::test]
async fn upload_sends_file_and_metadata() {
    let (base, rec) = spawn_server(true).await;
    let api = api_for(&base, Some("secret"));
    let (on_progress, seen) = recording_progress();

    let receipt = api
        .upload(request(200 * 1024), on_progress, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(receipt.task_id, "t-1");
    assert_eq!(receipt.batch_id.as_deref(), Some("b-1"));

    let fields = rec.fields.lock().unwrap().clone();
    let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "file",
            "relpath",
            "dpi",
            "prep",
            "langs",
            "psm",
            "do_llm_summary",
            "llm_model",
            "category_name",
            "title_override"
        ]
    );
    assert_eq!(fields[0].1, 200 * 1024);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.last().copied(), Some(100));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
}

#[tokio::test]
async fn upload_streams_file_from_disk() {
    let (base, rec) = spawn_server(true).await;
    let api = api_for(&base, Some("secret"));
    let (on_progress, seen) = recording_progress();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("minutes.pdf");
    std::fs::write(&path, vec![3u8; 200 * 1024]).unwrap();

    let receipt = api
        .upload(request_with(FilePayload::Path(path)), on_progress, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(receipt.task_id, "t-1");

    let fields = rec.fields.lock().unwrap().clone();
    assert_eq!(fields[0], ("file".to_string(), 200 * 1024));

    let seen = seen.lock().unwrap().clone();
    assert!(seen.len() > 1, "{:?}", seen);
    assert_eq!(seen.last().copied(), Some(100));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
}

#[tokio::test]
async fn upload_of_missing_file_is_io_error() {
    let (base, rec) = spawn_server(true).await;
    let api = api_for(&base, Some("secret"));
    let (on_progress, _) = recording_progress();
    let dir = tempfile::tempdir().unwrap();

    let err = api
        .upload(
            request_with(FilePayload::Path(dir.path().join("gone.pdf"))),
            on_progress,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Io(_)), "{:?}", err);
    assert!(rec.fields.lock().unwrap().is_empty());
}

#[tokio::test]
async fn upload_error_uses_server_detail() {
    let (base, _rec) = spawn_server(true).await;
    let api = api_for(&base, Some("wrong"));
    let (on_progress, _) = recording_progress();

    let err = api
        .upload(request(16), on_progress, CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        UploadError::Http { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "invalid token");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn upload_cancelled_before_start() {
    let (base, _rec) = spawn_server(true).await;
    let api = api_for(&base, Some("secret"));
    let (on_progress, _) = recording_progress();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = api.upload(request(16), on_progress, cancel).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn batch_status_in_one_request() {
    let (base, _rec) = spawn_server(true).await;
    let api = api_for(&base, Some("secret"));
    let ids = vec!["t-1".to_string(), "t-2".to_string()];

    let statuses = poller::fetch_statuses(&api, &ids).await.unwrap();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses["t-2"].stage, Stage::OcrDone);
    assert_eq!(statuses["t-2"].percent, Some(55.0));
    assert_eq!(statuses["t-2"].task_id.as_deref(), Some("t-2"));
}

#[tokio::test]
async fn missing_batch_endpoint_falls_back_to_per_task() {
    let (base, _rec) = spawn_server(false).await;
    let api = api_for(&base, Some("secret"));
    let ids = vec!["t-1".to_string(), "t-2".to_string()];

    let err = api.batch_status(&ids).await.unwrap_err();
    assert!(err.is_missing_endpoint(), "{:?}", err);

    let statuses = poller::fetch_statuses(&api, &ids).await.unwrap();
    assert_eq!(statuses.len(), 2);
    let status = &statuses["t-1"];
    assert_eq!(status.stage, Stage::Success);
    assert_eq!(status.task_id.as_deref(), Some("t-1"));
    assert_eq!(
        status.result.as_ref().unwrap()["llmSummary"],
        json!("summary of t-1")
    );
}

#[tokio::test]
async fn commit_returns_document_id() {
    let (base, rec) = spawn_server(true).await;
    let api = api_for(&base, Some("secret"));
    let req = CommitRequest {
        batch_id: Some("b-1".into()),
        task_id: "t-1".into(),
        original_filename: "minutes.pdf".into(),
        changed_filename: "2024 minutes.pdf".into(),
        file_size_bytes: 2048,
        title: "2024 minutes".into(),
    };

    let doc = api.commit(&req).await.unwrap();
    assert_eq!(doc, "77");

    let commits = rec.commits.lock().unwrap().clone();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0]["task_id"], json!("t-1"));
    assert_eq!(commits[0]["changed_filename"], json!("2024 minutes.pdf"));
    assert_eq!(commits[0]["file_size_bytes"], json!(2048));
}

#[tokio::test]
async fn server_error_message_is_surfaced() {
    let (base, _rec) = spawn_server(true).await;
    let mut config = Config::minimal();
    config.server.base_url = base;
    config.server.commit_path = "/broken/commit".into();
    let api = HttpApi::new(&config.server, &ProcessingParams::default()).unwrap();
    let req = CommitRequest {
        batch_id: None,
        task_id: "t-1".into(),
        original_filename: "a.pdf".into(),
        changed_filename: "a.pdf".into(),
        file_size_bytes: 1,
        title: "a".into(),
    };

    match api.commit(&req).await.unwrap_err() {
        UploadError::Http { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "storage offline");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
