//! The polling loop and the per-device backup state machine.
//!
//! Each tracked key moves through
//! `Unseen -> Candidate -> BackedUp -> Absent -> Unseen`.
//! A failed mirror leaves the key a `Candidate`, so the next tick retries it
//! for as long as the device stays mounted. A failed device query changes
//! nothing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::core::classifier::Classifier;
use crate::core::mirror::MirrorEngine;
use crate::core::models::{BackupTask, DeviceKey, TargetLayout, TrackedDevice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePhase {
    /// Not mounted and not tracked.
    Unseen,
    /// Mounted, not yet backed up (or the last attempt failed).
    Candidate,
    /// Mounted and mirrored during this run.
    BackedUp,
    /// Tracked but missing from the latest snapshot; dropped at the end of the tick.
    Absent,
    /// Mounted, but failed `max_mirror_attempts` times in a row. Not retried
    /// until the device is unplugged.
    Suspended,
}

/// Everything the orchestrator remembers between ticks. Lives in memory
/// only; a restart begins empty and re-mirrors whatever is plugged in.
#[derive(Debug, Default)]
pub struct TrackerState {
    tracked: BTreeMap<DeviceKey, TrackedDevice>,
    failures: HashMap<DeviceKey, u32>,
}

impl TrackerState {
    pub fn phase(
        &self,
        key: &DeviceKey,
        candidates: &BTreeSet<DeviceKey>,
        max_attempts: Option<u32>,
    ) -> DevicePhase {
        let present = candidates.contains(key);

        match (self.tracked.contains_key(key), present) {
            (true, true) => DevicePhase::BackedUp,
            (true, false) => DevicePhase::Absent,
            (false, false) => DevicePhase::Unseen,
            (false, true) => match max_attempts {
                Some(max) if self.failures(key) >= max => DevicePhase::Suspended,
                _ => DevicePhase::Candidate,
            },
        }
    }

    pub fn is_tracked(&self, key: &DeviceKey) -> bool {
        self.tracked.contains_key(key)
    }

    pub fn tracked_keys(&self) -> BTreeSet<DeviceKey> {
        self.tracked.keys().cloned().collect()
    }

    pub fn tracked(&self) -> impl Iterator<Item = &TrackedDevice> {
        self.tracked.values()
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Consecutive failed mirrors for `key` since it was last absent or backed up.
    pub fn failures(&self, key: &DeviceKey) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    fn mark_backed_up(&mut self, key: DeviceKey, at: DateTime<Utc>) {
        self.failures.remove(&key);
        self.tracked.insert(
            key.clone(),
            TrackedDevice {
                key,
                backed_up_at: at,
            },
        );
    }

    fn record_failure(&mut self, key: DeviceKey) -> u32 {
        let count = self.failures.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// Forget every key missing from `candidates`; returns the tracked keys dropped.
    fn retain_present(&mut self, candidates: &BTreeSet<DeviceKey>) -> Vec<DeviceKey> {
        let absent: Vec<DeviceKey> = self
            .tracked
            .keys()
            .filter(|key| !candidates.contains(*key))
            .cloned()
            .collect();

        for key in &absent {
            self.tracked.remove(key);
        }
        self.failures.retain(|key, _| candidates.contains(key));

        absent
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickReport {
    /// The device tree could not be read; tracked state was left alone.
    QueryFailed(String),
    Completed(TickSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub candidates: usize,
    pub mirrored: Vec<DeviceKey>,
    pub failed: Vec<DeviceKey>,
    pub removed: Vec<DeviceKey>,
    pub suspended: Vec<DeviceKey>,
}

impl TickReport {
    pub fn summary(&self) -> Option<&TickSummary> {
        match self {
            Self::Completed(summary) => Some(summary),
            Self::QueryFailed(_) => None,
        }
    }

    fn log(&self, tracked: usize) {
        match self {
            Self::QueryFailed(error) => {
                warn!(%error, tracked, "Device query failed, tracked devices kept");
            }
            Self::Completed(s) if s.mirrored.is_empty() && s.failed.is_empty() && s.removed.is_empty() => {
                debug!(candidates = s.candidates, tracked, "Poll complete, nothing changed");
            }
            Self::Completed(s) => info!(
                candidates = s.candidates,
                mirrored = s.mirrored.len(),
                failed = s.failed.len(),
                removed = s.removed.len(),
                suspended = s.suspended.len(),
                tracked,
                "Poll complete"
            ),
        }
    }
}

pub struct Orchestrator {
    classifier: Classifier,
    engine: Arc<dyn MirrorEngine>,
    target_root: PathBuf,
    layout: TargetLayout,
    poll_interval: Duration,
    max_attempts: Option<u32>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            classifier: ctx.classifier(),
            engine: ctx.engine.clone(),
            target_root: ctx.config.backup_directory.clone(),
            layout: ctx.config.target_layout,
            poll_interval: ctx.config.poll_interval(),
            max_attempts: ctx.config.max_mirror_attempts,
        }
    }

    /// Override the sleep between ticks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Poll until `shutdown` is cancelled. Cancellation also interrupts a
    /// mirror in progress; that device is simply not tracked.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            backup_directory = %self.target_root.display(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "USB backup daemon starting"
        );

        let mut state = TrackerState::default();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                report = self.tick(&mut state) => report.log(state.len()),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(tracked = state.len(), "USB backup daemon stopped");
        Ok(())
    }

    /// One poll: classify, mirror every new candidate in turn, forget
    /// devices that went away.
    pub async fn tick(&self, state: &mut TrackerState) -> TickReport {
        let candidates = match self.classifier.enumerate_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => return TickReport::QueryFailed(e.to_string()),
        };

        let mut summary = TickSummary {
            candidates: candidates.len(),
            ..TickSummary::default()
        };

        let mut pending = Vec::new();
        for key in &candidates {
            match state.phase(key, &candidates, self.max_attempts) {
                DevicePhase::Candidate => pending.push(key),
                DevicePhase::Suspended => summary.suspended.push(key.clone()),
                _ => {}
            }
        }

        let mut occupied: HashMap<PathBuf, DeviceKey> = state
            .tracked
            .keys()
            .filter_map(|key| BackupTask::plan(key, &self.target_root, self.layout))
            .map(|task| (task.target, task.key))
            .collect();

        for key in pending {
            let Some(task) = BackupTask::plan(key, &self.target_root, self.layout) else {
                warn!(device = %key, "Mountpoint has no name to back up under, skipping");
                state.record_failure(key.clone());
                summary.failed.push(key.clone());
                continue;
            };

            if let Some(other) = occupied.insert(task.target.clone(), key.clone()) {
                if &other != key {
                    warn!(
                        device = %key,
                        other = %other,
                        target = %task.target.display(),
                        "Backup target shared with another device, its contents will be replaced"
                    );
                }
            }

            info!(device = %key, target = %task.target.display(), "Mirroring new device");

            match self.engine.mirror(&task).await {
                Ok(report) => {
                    info!(
                        device = %key,
                        bytes = report.bytes_copied,
                        files = report.files_copied,
                        removed = report.files_removed,
                        "Backup complete"
                    );
                    state.mark_backed_up(key.clone(), Utc::now());
                    summary.mirrored.push(key.clone());
                }
                Err(e) => {
                    let attempts = state.record_failure(key.clone());
                    warn!(device = %key, error = %e, attempts, "Backup failed, retrying on next poll");

                    if self.max_attempts.is_some_and(|max| attempts >= max) {
                        warn!(device = %key, attempts, "Giving up on device until it is unplugged");
                    }
                    summary.failed.push(key.clone());
                }
            }
        }

        summary.removed = state.retain_present(&candidates);
        for key in &summary.removed {
            info!(device = %key, "Device removed, it will be backed up again when re-plugged");
        }

        TickReport::Completed(summary)
    }
}
