//! Smoothed percent and finish-time estimates.
//!
//! Raw progress signals are coarse (stage milestones) or jumpy (byte counts),
//! so each tracked key keeps an exponentially smoothed display value and a
//! short sliding window of samples from which a completion rate is derived.
//!
//! Guarantees per key, until [`ProgressEstimator::reset`]:
//!
//! - the displayed percent never decreases, and stays at or below 99 until a
//!   terminal observation;
//! - the estimated finish time never moves later;
//! - candidates less than `min_eta_secs` away are ignored, so the estimate
//!   does not flicker near the end.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

use crate::config::EstimatorConfig;
use crate::models::{Stage, TaskStatus};

/// Ceiling for the displayed percent until the work is known to be finished.
const PRE_TERMINAL_CAP: f64 = 99.0;
/// Percent per second below which the window shows no usable rate.
const MIN_RATE: f64 = 1e-3;
/// Rate estimates further out than this are not offered.
const MAX_ETA_SECS: f64 = 24.0 * 60.0 * 60.0;

/// What a progress display should show for one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressView {
    pub percent: u8,
    pub stage: Option<Stage>,
    pub finish_at: Option<DateTime<Utc>>,
    pub eta_secs: Option<u64>,
}

#[derive(Debug, Default)]
struct Track {
    displayed: f64,
    samples: VecDeque<(DateTime<Utc>, f64)>,
    finish_at: Option<DateTime<Utc>>,
    stage: Option<Stage>,
    terminal: bool,
}

#[derive(Debug)]
pub struct ProgressEstimator {
    config: EstimatorConfig,
    tracks: HashMap<String, Track>,
}

impl ProgressEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
        }
    }

    /// Starts (or restarts) tracking `key` from zero.
    pub fn reset(&mut self, key: &str) {
        self.tracks.insert(key.to_string(), Track::default());
    }

    pub fn remove(&mut self, key: &str) {
        self.tracks.remove(key);
    }

    pub fn is_tracking(&self, key: &str) -> bool {
        self.tracks.contains_key(key)
    }

    /// Folds a server status into the track for `key`.
    ///
    /// An explicit server percent wins over the stage milestone. When the
    /// server supplies a finish time it is the candidate for this tick and
    /// no rate estimate is made.
    pub fn observe_status(&mut self, key: &str, status: &TaskStatus, now: DateTime<Utc>) -> ProgressView {
        let config = self.config.clone();
        let track = self.tracks.entry(key.to_string()).or_default();
        track.stage = Some(status.stage);

        let target = status
            .percent
            .or_else(|| status.stage.milestone())
            .unwrap_or(track.displayed);
        let estimate_rate = status.finish_at.is_none();
        advance(track, &config, target, status.stage.is_terminal(), estimate_rate, now);

        if let Some(server) = status.finish_at {
            offer(track, &config, server, now);
        }
        view_of(track, &config, now)
    }

    /// Folds a byte-upload percent into the track for `key`.
    pub fn observe_upload(&mut self, key: &str, percent: u8, now: DateTime<Utc>) -> ProgressView {
        let config = self.config.clone();
        let track = self.tracks.entry(key.to_string()).or_default();
        advance(track, &config, f64::from(percent.min(100)), false, true, now);
        view_of(track, &config, now)
    }

    /// Marks `key` finished: percent jumps to 100.
    pub fn complete(&mut self, key: &str) {
        let track = self.tracks.entry(key.to_string()).or_default();
        track.terminal = true;
        track.displayed = 100.0;
        track.finish_at = None;
    }

    pub fn view(&self, key: &str, now: DateTime<Utc>) -> Option<ProgressView> {
        self.tracks.get(key).map(|t| view_of(t, &self.config, now))
    }
}

fn advance(
    track: &mut Track,
    config: &EstimatorConfig,
    target: f64,
    terminal: bool,
    estimate_rate: bool,
    now: DateTime<Utc>,
) {
    if track.terminal {
        return;
    }
    if terminal {
        track.terminal = true;
        if target >= 100.0 {
            track.displayed = 100.0;
            track.finish_at = None;
            return;
        }
    }

    let next = track.displayed + config.alpha * (target - track.displayed);
    let cap = if track.terminal { 100.0 } else { PRE_TERMINAL_CAP };
    track.displayed = track.displayed.max(next.min(cap));

    track.samples.push_back((now, track.displayed));
    let horizon = now - secs(config.window_secs);
    while track.samples.len() > 1 && track.samples.front().is_some_and(|(t, _)| *t < horizon) {
        track.samples.pop_front();
    }

    if !estimate_rate {
        return;
    }
    if let Some(candidate) = rate_candidate(track, config, now) {
        offer(track, config, candidate, now);
    }
}

/// Finish time implied by the rate across the current window.
fn rate_candidate(track: &Track, config: &EstimatorConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if track.samples.len() < config.min_samples {
        return None;
    }
    let (t0, p0) = *track.samples.front()?;
    let (t1, p1) = *track.samples.back()?;
    let elapsed = (t1 - t0).num_milliseconds() as f64 / 1000.0;
    if elapsed < config.min_elapsed_secs {
        return None;
    }
    let rate = (p1 - p0) / elapsed;
    if !rate.is_finite() || rate < MIN_RATE {
        return None;
    }
    let remaining = (100.0 - p1).max(0.0) / rate;
    if remaining > MAX_ETA_SECS {
        return None;
    }
    now.checked_add_signed(secs(remaining))
}

/// Accepts a candidate finish time if it is far enough out and earlier than
/// the current estimate.
fn offer(track: &mut Track, config: &EstimatorConfig, candidate: DateTime<Utc>, now: DateTime<Utc>) {
    if track.terminal {
        return;
    }
    match now.checked_add_signed(secs(config.min_eta_secs)) {
        Some(floor) if candidate >= floor => {}
        _ => return,
    }
    track.finish_at = Some(match track.finish_at {
        Some(current) => current.min(candidate),
        None => candidate,
    });
}

fn view_of(track: &Track, config: &EstimatorConfig, now: DateTime<Utc>) -> ProgressView {
    let eta_secs = track.finish_at.and_then(|f| {
        let secs = (f - now).num_milliseconds() as f64 / 1000.0;
        (secs >= config.min_eta_secs).then(|| secs.round() as u64)
    });
    ProgressView {
        percent: track.displayed.round().clamp(0.0, 100.0) as u8,
        stage: track.stage,
        finish_at: track.finish_at,
        eta_secs,
    }
}

/// Whole milliseconds, clamped to `0..=MAX_ETA_SECS`.
fn secs(s: f64) -> Duration {
    let s = if s.is_finite() { s.clamp(0.0, MAX_ETA_SECS) } else { 0.0 };
    Duration::milliseconds((s * 1000.0) as i64)
}
