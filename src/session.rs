//! The upload session: a single reducer that owns every item.
//!
//! User commands (`start`, `cancel`, `remove`, ...) and asynchronous results
//! ([`UploadEvent`]) are folded into the queue one at a time. Each call
//! returns the side effects ([`Effect`]) the driver must perform; the session
//! itself never touches the network.
//!
//! ```text
//! Idle ──start──▶ Uploading ──Accepted──▶ Processing ──SUCCESS──▶ Done
//!   ▲                 │                        │
//!   └────cancel───────┘         any ──failure──┴──────────────▶ Error
//! ```
//!
//! The first SUCCESS observed for a task marks the item `finalizing` inside
//! the same `apply` call, so overlapping poll results can never commit twice.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::committer;
use crate::config::{EstimatorConfig, UploadConfig};
use crate::error::{UploadError, UploadResult};
use crate::estimator::ProgressEstimator;
use crate::models::{
    CommitRequest, FileSource, ItemStatus, SessionStats, Stage, TaskStatus, UploadItem, UploadReceipt,
};
use crate::queue::{Candidate, UploadQueue};

/// Asynchronous outcome delivered back to the session.
///
/// Upload events carry the attempt number from [`Effect::StartUpload`];
/// events from a superseded attempt are ignored.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    Progress {
        id: String,
        attempt: u64,
        percent: u8,
        at: DateTime<Utc>,
    },
    Accepted {
        id: String,
        attempt: u64,
        receipt: UploadReceipt,
    },
    Failed {
        id: String,
        attempt: u64,
        error: String,
    },
    Cancelled {
        id: String,
        attempt: u64,
    },
    Polled {
        statuses: HashMap<String, TaskStatus>,
        at: DateTime<Utc>,
    },
    ResultFetched {
        id: String,
        result: Value,
    },
    ResultFailed {
        id: String,
        error: String,
    },
    Committed {
        id: String,
        document_id: String,
    },
    CommitFailed {
        id: String,
        error: String,
    },
}

/// Side effect requested by the session.
#[derive(Debug, Clone)]
pub enum Effect {
    StartUpload {
        item: Box<UploadItem>,
        attempt: u64,
        cancel: CancellationToken,
    },
    Abort {
        id: String,
        cancel: CancellationToken,
    },
    Watch {
        task_id: String,
    },
    Unwatch {
        task_id: String,
    },
    FetchResult {
        id: String,
        task_id: String,
    },
    Commit {
        id: String,
        request: CommitRequest,
    },
}

/// Display snapshot of one item.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ItemView {
    pub id: String,
    pub name: String,
    pub relative_path: String,
    pub status: ItemStatus,
    pub percent: u8,
    pub stage: Option<Stage>,
    pub eta_secs: Option<u64>,
    pub error: Option<String>,
    pub committed: bool,
    pub document_id: Option<String>,
}

#[derive(Debug)]
struct Transfer {
    attempt: u64,
    cancel: CancellationToken,
}

pub struct UploadSession {
    queue: UploadQueue,
    config: UploadConfig,
    estimator: ProgressEstimator,
    transfers: HashMap<String, Transfer>,
    /// Items whose result fetch or commit is in flight.
    settling: HashSet<String>,
    next_attempt: u64,
}

fn upload_key(id: &str) -> String {
    format!("upload:{}", id)
}

fn task_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}

impl UploadSession {
    pub fn new(config: UploadConfig, estimator: EstimatorConfig) -> Self {
        Self {
            queue: UploadQueue::new(),
            config,
            estimator: ProgressEstimator::new(estimator),
            transfers: HashMap::new(),
            settling: HashSet::new(),
            next_attempt: 0,
        }
    }

    pub fn add_files(&mut self, files: Vec<FileSource>) -> Vec<String> {
        let ids = self.queue.add_files(files, &self.config);
        debug!(added = ids.len(), total = self.queue.len(), "files queued");
        ids
    }

    /// Like [`add_files`](Self::add_files) for candidates whose archives
    /// were already expanded with [`expand_all`](crate::queue::expand_all).
    pub fn add_expanded(&mut self, candidates: Vec<Candidate>) -> Vec<String> {
        let ids = self.queue.insert(candidates, &self.config);
        debug!(added = ids.len(), total = self.queue.len(), "files queued");
        ids
    }

    pub fn upload_config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn items(&self) -> &[UploadItem] {
        self.queue.items()
    }

    pub fn get(&self, id: &str) -> Option<&UploadItem> {
        self.queue.get(id)
    }

    pub fn idle_ids(&self) -> Vec<String> {
        self.queue.idle_ids()
    }

    /// `Idle → Uploading`: emits the transfer for the driver to run.
    pub fn start(&mut self, id: &str) -> UploadResult<Vec<Effect>> {
        let item = self.transition(id, ItemStatus::Uploading)?;
        item.progress = 0;
        item.error = None;
        let snapshot = Box::new(item.clone());

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let cancel = CancellationToken::new();
        self.transfers.insert(
            id.to_string(),
            Transfer {
                attempt,
                cancel: cancel.clone(),
            },
        );
        self.estimator.reset(&upload_key(id));

        Ok(vec![Effect::StartUpload {
            item: snapshot,
            attempt,
            cancel,
        }])
    }

    /// `Uploading → Idle`: aborts the transfer and forgets its progress.
    pub fn cancel(&mut self, id: &str) -> UploadResult<Vec<Effect>> {
        let item = self.transition(id, ItemStatus::Idle)?;
        item.progress = 0;
        let task_id = item.task_id.take();

        let mut effects = Vec::new();
        if let Some(transfer) = self.transfers.remove(id) {
            effects.push(Effect::Abort {
                id: id.to_string(),
                cancel: transfer.cancel,
            });
        }
        if let Some(task_id) = task_id {
            self.estimator.remove(&task_key(&task_id));
            effects.push(Effect::Unwatch { task_id });
        }
        self.estimator.remove(&upload_key(id));
        info!(id, "upload cancelled");
        Ok(effects)
    }

    /// Stops tracking an item in any state.
    pub fn remove(&mut self, id: &str) -> UploadResult<Vec<Effect>> {
        let item = self
            .queue
            .remove(id)
            .ok_or_else(|| UploadError::UnknownItem(id.to_string()))?;

        let mut effects = Vec::new();
        if let Some(transfer) = self.transfers.remove(id) {
            effects.push(Effect::Abort {
                id: id.to_string(),
                cancel: transfer.cancel,
            });
        }
        if let Some(task_id) = item.task_id {
            self.estimator.remove(&task_key(&task_id));
            if item.status == ItemStatus::Processing {
                effects.push(Effect::Unwatch { task_id });
            }
        }
        self.estimator.remove(&upload_key(id));
        self.settling.remove(id);
        Ok(effects)
    }

    pub fn rename(&mut self, id: &str, title: &str) -> UploadResult<()> {
        let item = self.editable(id)?;
        item.title = title.trim().to_string();
        Ok(())
    }

    pub fn recategorize(&mut self, id: &str, category: &str) -> UploadResult<()> {
        let item = self.editable(id)?;
        item.category_name = category.trim().to_string();
        Ok(())
    }

    fn editable(&mut self, id: &str) -> UploadResult<&mut UploadItem> {
        let item = self
            .queue
            .get_mut(id)
            .ok_or_else(|| UploadError::UnknownItem(id.to_string()))?;
        if item.status != ItemStatus::Idle {
            return Err(UploadError::NotEditable {
                id: id.to_string(),
                status: item.status,
            });
        }
        Ok(item)
    }

    fn transition(&mut self, id: &str, to: ItemStatus) -> UploadResult<&mut UploadItem> {
        let item = self
            .queue
            .get_mut(id)
            .ok_or_else(|| UploadError::UnknownItem(id.to_string()))?;
        if !item.status.can_transition_to(to) {
            return Err(UploadError::InvalidTransition {
                id: id.to_string(),
                from: item.status,
                to,
            });
        }
        item.status = to;
        Ok(item)
    }

    /// Whether `attempt` is the live transfer for `id`.
    fn is_current(&self, id: &str, attempt: u64) -> bool {
        self.transfers.get(id).is_some_and(|t| t.attempt == attempt)
    }

    /// Folds one asynchronous outcome into the session.
    pub fn apply(&mut self, event: UploadEvent) -> Vec<Effect> {
        match event {
            UploadEvent::Progress {
                id,
                attempt,
                percent,
                at,
            } => {
                if self.is_current(&id, attempt) {
                    let view = self.estimator.observe_upload(&upload_key(&id), percent, at);
                    if let Some(item) = self.queue.get_mut(&id) {
                        item.progress = item.progress.max(view.percent);
                    }
                }
                Vec::new()
            }
            UploadEvent::Accepted { id, attempt, receipt } => self.on_accepted(&id, attempt, receipt),
            UploadEvent::Failed { id, attempt, error } => {
                if self.is_current(&id, attempt) {
                    self.transfers.remove(&id);
                    self.estimator.remove(&upload_key(&id));
                    self.fail(&id, error);
                }
                Vec::new()
            }
            UploadEvent::Cancelled { id, attempt } => {
                if self.is_current(&id, attempt) {
                    return self.cancel(&id).unwrap_or_default();
                }
                Vec::new()
            }
            UploadEvent::Polled { statuses, at } => self.on_polled(statuses, at),
            UploadEvent::ResultFetched { id, result } => self.on_result(&id, result),
            UploadEvent::ResultFailed { id, error } => {
                self.settling.remove(&id);
                warn!(id = %id, error = %error, "could not fetch task result; document not committed");
                Vec::new()
            }
            UploadEvent::Committed { id, document_id } => {
                self.settling.remove(&id);
                if let Some(item) = self.queue.get_mut(&id) {
                    item.committed = true;
                    item.document_id = Some(document_id.clone());
                    info!(id = %id, name = %item.file.name, document_id = %document_id, "document committed");
                }
                Vec::new()
            }
            UploadEvent::CommitFailed { id, error } => {
                self.settling.remove(&id);
                warn!(id = %id, error = %error, "commit failed; document not committed");
                Vec::new()
            }
        }
    }

    fn on_accepted(&mut self, id: &str, attempt: u64, receipt: UploadReceipt) -> Vec<Effect> {
        if !self.is_current(id, attempt) {
            return Vec::new();
        }
        self.transfers.remove(id);
        self.estimator.remove(&upload_key(id));

        let item = match self.transition(id, ItemStatus::Processing) {
            Ok(item) => item,
            Err(e) => {
                debug!(error = %e, "ignoring upload receipt");
                return Vec::new();
            }
        };
        item.progress = 0;
        item.task_id = Some(receipt.task_id.clone());
        item.batch_id = receipt.batch_id;
        info!(id, task_id = %receipt.task_id, name = %item.file.name, "upload accepted");

        self.estimator.reset(&task_key(&receipt.task_id));
        vec![Effect::Watch {
            task_id: receipt.task_id,
        }]
    }

    fn on_polled(&mut self, statuses: HashMap<String, TaskStatus>, at: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut task_ids: Vec<&String> = statuses.keys().collect();
        task_ids.sort();

        for task_id in task_ids {
            let status = &statuses[task_id];
            let Some(id) = self.queue.find_by_task(task_id).map(|it| it.id.clone()) else {
                continue;
            };
            let Some(item) = self.queue.get_mut(&id) else {
                continue;
            };
            if item.committed || item.finalizing || item.status != ItemStatus::Processing {
                continue;
            }

            match status.stage {
                Stage::Success => {
                    item.finalizing = true;
                    item.status = ItemStatus::Done;
                    item.progress = 100;
                    info!(id = %id, task_id = %task_id, "processing finished");
                    self.estimator.remove(&task_key(task_id));
                    self.settling.insert(id.clone());
                    effects.push(Effect::Unwatch {
                        task_id: task_id.clone(),
                    });
                    effects.push(Effect::FetchResult {
                        id,
                        task_id: task_id.clone(),
                    });
                }
                Stage::Failed => {
                    let message = status
                        .error
                        .clone()
                        .unwrap_or_else(|| "processing failed".to_string());
                    self.estimator.remove(&task_key(task_id));
                    self.fail(&id, message);
                    effects.push(Effect::Unwatch {
                        task_id: task_id.clone(),
                    });
                }
                _ => {
                    let view = self.estimator.observe_status(&task_key(task_id), status, at);
                    item.progress = item.progress.max(view.percent);
                }
            }
        }
        effects
    }

    fn on_result(&mut self, id: &str, result: Value) -> Vec<Effect> {
        let Some(item) = self.queue.get_mut(id) else {
            self.settling.remove(id);
            return Vec::new();
        };
        if item.committed || !item.finalizing {
            self.settling.remove(id);
            return Vec::new();
        }

        let outcome = committer::extract_outcome(&result, &item.category_name);
        debug!(id, category = %outcome.category, tags = outcome.tags.len(), "result attached");
        item.result = Some(outcome);

        match committer::build_commit_request(item) {
            Some(request) => vec![Effect::Commit {
                id: id.to_string(),
                request,
            }],
            None => {
                self.settling.remove(id);
                warn!(id, "finished item has no task id; not committing");
                Vec::new()
            }
        }
    }

    fn fail(&mut self, id: &str, message: String) {
        if let Some(item) = self.queue.get_mut(id) {
            warn!(id, name = %item.file.name, error = %message, "upload failed");
            item.status = ItemStatus::Error;
            item.error = Some(message);
        }
    }

    /// No transfer is running and every item has reached a terminal state
    /// with its result fetch/commit settled.
    pub fn is_settled(&self) -> bool {
        self.transfers.is_empty()
            && self.settling.is_empty()
            && self.queue.items().iter().all(|it| it.status.is_terminal())
    }

    /// A transfer, a server-side task or a result fetch/commit can still
    /// produce events.
    pub fn has_pending_io(&self) -> bool {
        !self.transfers.is_empty()
            || !self.settling.is_empty()
            || self
                .queue
                .items()
                .iter()
                .any(|it| it.status == ItemStatus::Processing)
    }

    pub fn is_uploading(&self) -> bool {
        !self.transfers.is_empty()
    }

    pub fn stats(&self) -> SessionStats {
        let items = self.queue.items();
        let mut stats = SessionStats {
            total: items.len(),
            ..SessionStats::default()
        };
        let mut progress_sum = 0u64;
        for item in items {
            match item.status {
                ItemStatus::Idle => stats.idle += 1,
                ItemStatus::Uploading => stats.uploading += 1,
                ItemStatus::Processing => stats.processing += 1,
                ItemStatus::Done => stats.done += 1,
                ItemStatus::Error => stats.error += 1,
            }
            if item.committed {
                stats.committed += 1;
            }
            stats.total_bytes += item.file.size;
            progress_sum += u64::from(item.progress);
        }
        if !items.is_empty() {
            stats.average_progress = progress_sum as f64 / items.len() as f64;
        }
        stats
    }

    pub fn views(&self, now: DateTime<Utc>) -> Vec<ItemView> {
        self.queue
            .items()
            .iter()
            .map(|item| {
                let key = match (&item.status, &item.task_id) {
                    (ItemStatus::Uploading, _) => Some(upload_key(&item.id)),
                    (ItemStatus::Processing, Some(task_id)) => Some(task_key(task_id)),
                    _ => None,
                };
                let estimate = key.and_then(|k| self.estimator.view(&k, now));
                ItemView {
                    id: item.id.clone(),
                    name: item.file.name.clone(),
                    relative_path: item.file.relative_path.clone(),
                    status: item.status,
                    percent: item.progress,
                    stage: estimate.and_then(|e| e.stage),
                    eta_secs: estimate.and_then(|e| e.eta_secs),
                    error: item.error.clone(),
                    committed: item.committed,
                    document_id: item.document_id.clone(),
                }
            })
            .collect()
    }
}
