//! Error types shared by the queue, the transport layer, and the session reducer.
//!
//! Library seams return [`UploadError`]; the CLI wraps everything in
//! `anyhow::Result` with context.

use crate::models::ItemStatus;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Network-level failure (connect, reset, timeout).
    #[error("network error: {0}")]
    Transport(String),

    /// Non-2xx response. `message` is the server's `detail`/`error`/`message`
    /// field when present.
    #[error("{message}")]
    Http { status: u16, message: String },

    /// 2xx response whose body does not match the expected contract.
    #[error("unexpected response: {0}")]
    Protocol(String),

    /// The transfer was aborted by the user.
    #[error("cancelled by user")]
    Cancelled,

    #[error("invalid transition for item {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ItemStatus,
        to: ItemStatus,
    },

    /// Title and category can only change before the upload starts.
    #[error("item {id} is {status}; only idle items can be edited")]
    NotEditable { id: String, status: ItemStatus },

    #[error("unknown item: {0}")]
    UnknownItem(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }

    /// 404/405 from an endpoint that may not exist on older servers.
    pub fn is_missing_endpoint(&self) -> bool {
        matches!(self, UploadError::Http { status, .. } if *status == 404 || *status == 405)
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            UploadError::Protocol(e.to_string())
        } else {
            UploadError::Transport(e.to_string())
        }
    }
}

impl From<zip::result::ZipError> for UploadError {
    fn from(e: zip::result::ZipError) -> Self {
        UploadError::Archive(e.to_string())
    }
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
