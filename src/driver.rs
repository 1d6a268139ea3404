//! Event loop that executes the session's effects.
//!
//! The driver owns the [`UploadSession`], the [`BatchPoller`] and the
//! [`UploadPool`]. All I/O runs on spawned tasks that report back over one
//! unbounded channel; the loop applies those events to the session one at a
//! time and executes whatever effects come out.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{DocumentApi, ProgressFn};
use crate::config::Config;
use crate::error::UploadResult;
use crate::models::{FileSource, ItemStatus, SessionStats, UploadItem};
use crate::poller::BatchPoller;
use crate::progress::{UploadProgressEvent, UploadProgressReporter};
use crate::queue;
use crate::session::{Effect, UploadEvent, UploadSession};
use crate::uploader::{UploadPool, Uploader};

pub struct Driver {
    session: UploadSession,
    api: Arc<dyn DocumentApi>,
    uploader: Arc<Uploader>,
    poller: BatchPoller,
    pool: UploadPool,
    tx: UnboundedSender<UploadEvent>,
    rx: UnboundedReceiver<UploadEvent>,
    reporter: Box<dyn UploadProgressReporter>,
    reported: HashMap<String, (ItemStatus, u8, bool)>,
}

impl Driver {
    pub fn new(api: Arc<dyn DocumentApi>, config: &Config, reporter: Box<dyn UploadProgressReporter>) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            session: UploadSession::new(config.upload.clone(), config.estimator.clone()),
            uploader: Arc::new(Uploader::new(api.clone())),
            poller: BatchPoller::new(api.clone(), Duration::from_millis(config.poll.interval_ms)),
            pool: UploadPool::new(config.upload.max_concurrency),
            api,
            tx,
            rx,
            reporter,
            reported: HashMap::new(),
        }
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    /// Queues files. Archives are read and expanded on a blocking thread.
    pub async fn add_files(&mut self, files: Vec<FileSource>) -> Vec<String> {
        let config = self.session.upload_config().clone();
        let candidates = match tokio::task::spawn_blocking(move || queue::expand_all(files, &config)).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "file expansion task failed");
                return Vec::new();
            }
        };
        let ids = self.session.add_expanded(candidates);
        self.report_changes();
        ids
    }

    /// Queues every idle item; at most `max_concurrency` transfer at once.
    pub fn start_all(&mut self) {
        self.pool.enqueue(self.session.idle_ids());
        self.kick();
        self.report_changes();
    }

    pub fn start(&mut self, id: &str) {
        self.pool.enqueue([id.to_string()]);
        self.kick();
        self.report_changes();
    }

    /// Cancels a running transfer, or drops the item from the wait list.
    pub fn cancel(&mut self, id: &str) -> UploadResult<()> {
        if self.pool.withdraw(id) {
            return Ok(());
        }
        let effects = self.session.cancel(id)?;
        self.execute(effects);
        self.report_changes();
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> UploadResult<()> {
        self.pool.withdraw(id);
        let effects = self.session.remove(id)?;
        self.execute(effects);
        self.reported.remove(id);
        Ok(())
    }

    /// Applies one event and performs its effects.
    pub fn handle(&mut self, event: UploadEvent) {
        if matches!(
            event,
            UploadEvent::Accepted { .. } | UploadEvent::Failed { .. } | UploadEvent::Cancelled { .. }
        ) {
            self.pool.release();
        }
        let effects = self.session.apply(event);
        self.execute(effects);
        self.kick();
        self.report_changes();
    }

    /// Processes events until nothing is left to wait for.
    ///
    /// With `wait_for_processing` the run ends once every task has finished
    /// and its commit settled; otherwise it ends when the last transfer does.
    pub async fn run(&mut self, wait_for_processing: bool) -> SessionStats {
        loop {
            let finished = if wait_for_processing {
                self.pool.is_idle() && !self.session.has_pending_io()
            } else {
                self.pool.is_idle() && !self.session.is_uploading()
            };
            if finished {
                break;
            }
            match self.rx.recv().await {
                Some(event) => self.handle(event),
                None => break,
            }
        }
        self.poller.stop();

        let stats = self.session.stats();
        self.reporter.report(UploadProgressEvent::Summary(stats.clone()));
        stats
    }

    pub fn into_session(mut self) -> UploadSession {
        self.poller.stop();
        self.session
    }

    /// Starts waiting items while slots are free.
    fn kick(&mut self) {
        while let Some(id) = self.pool.next_ready() {
            match self.session.start(&id) {
                Ok(effects) => self.execute(effects),
                Err(e) => {
                    debug!(id = %id, error = %e, "skipping queued item");
                    self.pool.release();
                }
            }
        }
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartUpload { item, attempt, cancel } => self.spawn_transfer(item, attempt, cancel),
                Effect::Abort { id, cancel } => {
                    debug!(id = %id, "aborting transfer");
                    cancel.cancel();
                }
                Effect::Watch { task_id } => {
                    self.poller.watch(&task_id);
                    if !self.poller.is_running() {
                        let tx = self.tx.clone();
                        self.poller.start(move |statuses| {
                            let _ = tx.send(UploadEvent::Polled {
                                statuses,
                                at: Utc::now(),
                            });
                        });
                    }
                }
                Effect::Unwatch { task_id } => {
                    self.poller.unwatch(&task_id);
                    if self.poller.watched().is_empty() {
                        self.poller.stop();
                    }
                }
                Effect::FetchResult { id, task_id } => self.spawn_fetch(id, task_id),
                Effect::Commit { id, request } => {
                    let api = self.api.clone();
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let event = match api.commit(&request).await {
                            Ok(document_id) => UploadEvent::Committed { id, document_id },
                            Err(e) => UploadEvent::CommitFailed {
                                id,
                                error: e.to_string(),
                            },
                        };
                        let _ = tx.send(event);
                    });
                }
            }
        }
    }

    fn spawn_transfer(&self, item: Box<UploadItem>, attempt: u64, cancel: CancellationToken) {
        let uploader = self.uploader.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let id = item.id.clone();
            let progress_tx = tx.clone();
            let progress_id = id.clone();
            let on_progress: ProgressFn = Arc::new(move |percent, at| {
                let _ = progress_tx.send(UploadEvent::Progress {
                    id: progress_id.clone(),
                    attempt,
                    percent,
                    at,
                });
            });

            let event = match uploader.upload(&item, on_progress, cancel).await {
                Ok(receipt) => UploadEvent::Accepted { id, attempt, receipt },
                Err(e) if e.is_cancelled() => UploadEvent::Cancelled { id, attempt },
                Err(e) => UploadEvent::Failed {
                    id,
                    attempt,
                    error: e.to_string(),
                },
            };
            let _ = tx.send(event);
        });
    }

    fn spawn_fetch(&self, id: String, task_id: String) {
        let api = self.api.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let event = match api.task_status(&task_id).await {
                Ok(status) => match status.result {
                    Some(result) => UploadEvent::ResultFetched { id, result },
                    None => UploadEvent::ResultFailed {
                        id,
                        error: format!("task {} has no result", task_id),
                    },
                },
                Err(e) => UploadEvent::ResultFailed {
                    id,
                    error: e.to_string(),
                },
            };
            let _ = tx.send(event);
        });
    }

    /// Reports items whose status, percent or commit state moved since the
    /// last report.
    fn report_changes(&mut self) {
        for view in self.session.views(Utc::now()) {
            let key = (view.status, view.percent, view.committed);
            if self.reported.get(&view.id) == Some(&key) {
                continue;
            }
            self.reported.insert(view.id.clone(), key);
            self.reporter.report(UploadProgressEvent::Item(view));
        }
    }
}
