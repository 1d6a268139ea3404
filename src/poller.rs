//! Fixed-interval status polling for every watched task.
//!
//! One batched request per tick covers all watched ids. Servers without the
//! batch route (404/405) are polled task by task instead. A failed tick is
//! logged and skipped; watched ids stay registered for the next one.

use futures_util::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::DocumentApi;
use crate::error::UploadResult;
use crate::models::TaskStatus;

pub struct BatchPoller {
    api: Arc<dyn DocumentApi>,
    watched: Arc<Mutex<BTreeSet<String>>>,
    interval: Duration,
    running: Option<CancellationToken>,
}

impl BatchPoller {
    pub fn new(api: Arc<dyn DocumentApi>, interval: Duration) -> Self {
        Self {
            api,
            watched: Arc::new(Mutex::new(BTreeSet::new())),
            interval,
            running: None,
        }
    }

    pub fn watch(&self, task_id: &str) {
        lock(&self.watched).insert(task_id.to_string());
    }

    pub fn unwatch(&self, task_id: &str) {
        lock(&self.watched).remove(task_id);
    }

    pub fn watched(&self) -> Vec<String> {
        lock(&self.watched).iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Starts the interval. Each tick with at least one watched id hands its
    /// statuses to `on_tick`. Calling `start` while running is a no-op.
    pub fn start<F>(&mut self, on_tick: F)
    where
        F: Fn(HashMap<String, TaskStatus>) + Send + Sync + 'static,
    {
        if self.running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        self.running = Some(cancel.clone());

        let api = self.api.clone();
        let watched = self.watched.clone();
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let ids: Vec<String> = lock(&watched).iter().cloned().collect();
                if ids.is_empty() {
                    continue;
                }
                match fetch_statuses(api.as_ref(), &ids).await {
                    Ok(statuses) => {
                        if !cancel.is_cancelled() {
                            on_tick(statuses);
                        }
                    }
                    Err(e) => warn!(tasks = ids.len(), error = %e, "status poll failed"),
                }
            }
            debug!("poller stopped");
        });
    }

    pub fn stop(&mut self) {
        if let Some(cancel) = self.running.take() {
            cancel.cancel();
        }
    }

    /// One poll of the current watch set, outside the interval.
    pub async fn tick(&self) -> UploadResult<HashMap<String, TaskStatus>> {
        let ids = self.watched();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        fetch_statuses(self.api.as_ref(), &ids).await
    }
}

impl Drop for BatchPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(set: &Mutex<BTreeSet<String>>) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Batched status for `ids`, falling back to per-task requests when the
/// server has no batch route.
pub async fn fetch_statuses(
    api: &dyn DocumentApi,
    ids: &[String],
) -> UploadResult<HashMap<String, TaskStatus>> {
    match api.batch_status(ids).await {
        Ok(statuses) => Ok(statuses),
        Err(e) if e.is_missing_endpoint() => {
            debug!(error = %e, "batch status unavailable, polling per task");
            let results = join_all(ids.iter().map(|id| api.task_status(id))).await;
            let mut out = HashMap::new();
            for (id, res) in ids.iter().zip(results) {
                match res {
                    Ok(status) => {
                        out.insert(id.clone(), status);
                    }
                    Err(e) => warn!(task_id = %id, error = %e, "task status failed"),
                }
            }
            Ok(out)
        }
        Err(e) => Err(e),
    }
}
