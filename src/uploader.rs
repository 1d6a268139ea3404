//! Single-file transfer and the bounded pool used by "start all".
//!
//! [`Uploader::upload`] hands the item's payload to the [`DocumentApi`]
//! and guarantees the progress callback sees non-decreasing integer percents.
//! Cancellation is observed both here and inside the request body stream, so
//! a cancelled transfer stops reporting progress immediately.

use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::api::{DocumentApi, ProgressFn, UploadRequest};
use crate::error::{UploadError, UploadResult};
use crate::models::{UploadItem, UploadReceipt};

/// Size of each body chunk handed to the HTTP client.
pub(crate) const CHUNK_BYTES: usize = 64 * 1024;

pub struct Uploader {
    api: Arc<dyn DocumentApi>,
}

impl Uploader {
    pub fn new(api: Arc<dyn DocumentApi>) -> Self {
        Self { api }
    }

    pub async fn upload(
        &self,
        item: &UploadItem,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> UploadResult<UploadReceipt> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        let request = UploadRequest {
            file_name: item.file.name.clone(),
            relative_path: item.file.relative_path.clone(),
            category_name: item.category_name.clone(),
            title: item.title.clone(),
            payload: item.file.payload.clone(),
        };

        let guarded = monotonic(on_progress, cancel.clone());
        guarded(0, Utc::now());

        tokio::select! {
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            res = self.api.upload(request, guarded.clone(), cancel.clone()) => match res {
                Err(_) if cancel.is_cancelled() => Err(UploadError::Cancelled),
                other => other,
            },
        }
    }
}

/// Wraps a progress callback so it only fires for strictly increasing
/// percents and never after cancellation.
fn monotonic(inner: ProgressFn, cancel: CancellationToken) -> ProgressFn {
    let last = Arc::new(AtomicI16::new(-1));
    Arc::new(move |percent, at| {
        if cancel.is_cancelled() {
            return;
        }
        let p = percent.min(100) as i16;
        let prev = last.fetch_max(p, Ordering::SeqCst);
        if p > prev {
            inner(p as u8, at);
        }
    })
}

pub(crate) fn percent_of(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent.min(total) * 100) / total) as u8
}

/// Splits an in-memory payload into body-sized chunks without copying.
pub fn memory_chunks(mut data: Bytes) -> impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static {
    let mut chunks = Vec::new();
    while !data.is_empty() {
        chunks.push(Ok(data.split_to(data.len().min(CHUNK_BYTES))));
    }
    futures_util::stream::iter(chunks)
}

/// Request body that reports progress as chunks of a `total`-byte payload
/// are consumed. Once `cancel` fires the body ends with an error.
pub fn progress_body<S>(chunks: S, total: u64, on_progress: ProgressFn, cancel: CancellationToken) -> reqwest::Body
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
{
    if total == 0 {
        on_progress(100, Utc::now());
    }
    let mut sent = 0u64;
    let stream = chunks.map(move |chunk| {
        if cancel.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "upload cancelled",
            ));
        }
        let chunk = chunk?;
        sent += chunk.len() as u64;
        on_progress(percent_of(sent, total), Utc::now());
        Ok(chunk)
    });
    reqwest::Body::wrap_stream(stream)
}

/// Bounded set of active transfers with a FIFO of waiting items.
///
/// Owned by the driver; items start only as slots free up.
#[derive(Debug)]
pub struct UploadPool {
    max_active: usize,
    active: usize,
    pending: VecDeque<String>,
}

impl UploadPool {
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active: max_active.max(1),
            active: 0,
            pending: VecDeque::new(),
        }
    }

    /// Queues ids that are not already waiting.
    pub fn enqueue<I: IntoIterator<Item = String>>(&mut self, ids: I) {
        for id in ids {
            if !self.pending.contains(&id) {
                self.pending.push_back(id);
            }
        }
    }

    /// Next id to start if a slot is free; claims the slot.
    pub fn next_ready(&mut self) -> Option<String> {
        if self.active >= self.max_active {
            return None;
        }
        let id = self.pending.pop_front()?;
        self.active += 1;
        Some(id)
    }

    /// Returns a slot claimed by `next_ready` whose item did not start.
    pub fn release(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    pub fn withdraw(&mut self, id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p != id);
        before != self.pending.len()
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active == 0 && self.pending.is_empty()
    }
}
