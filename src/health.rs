//! C10: Health Monitor — tracks per-worker last-activity timestamps and
//! periodically scans for workers that have been stuck past the configured
//! threshold. See spec §4.9.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::warn;

/// Shared by every worker; each records its own heartbeat, the monitor reads
/// all of them. `AtomicI64` holds a unix millisecond timestamp so workers
/// never need to lock anything to report progress.
#[derive(Default)]
pub struct HealthTracker {
    last_activity_ms: DashMap<usize, AtomicI64>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            last_activity_ms: DashMap::new(),
        }
    }

    pub fn heartbeat(&self, worker_id: usize) {
        let now = chrono::Utc::now().timestamp_millis();
        match self.last_activity_ms.get(&worker_id) {
            Some(slot) => slot.store(now, Ordering::Relaxed),
            None => {
                self.last_activity_ms.insert(worker_id, AtomicI64::new(now));
            }
        }
    }

    pub fn register(&self, worker_id: usize) {
        self.heartbeat(worker_id);
    }

    pub fn deregister(&self, worker_id: usize) {
        self.last_activity_ms.remove(&worker_id);
    }

    /// Worker ids whose last heartbeat is older than `threshold`.
    pub fn stuck_workers(&self, threshold: Duration) -> Vec<usize> {
        let now = chrono::Utc::now().timestamp_millis();
        let threshold_ms = threshold.as_millis() as i64;
        self.last_activity_ms
            .iter()
            .filter(|entry| now - entry.value().load(Ordering::Relaxed) > threshold_ms)
            .map(|entry| *entry.key())
            .collect()
    }
}

/// Periodically scans a [`HealthTracker`] and logs any stuck workers. This
/// does not restart or kill workers — spec §4.9 scopes the monitor to
/// detection and reporting; recovery is left to the orchestrator's shutdown
/// path.
pub struct HealthMonitor {
    tracker: Arc<HealthTracker>,
    scan_interval: Duration,
    stuck_threshold: Duration,
}

impl HealthMonitor {
    pub fn new(tracker: Arc<HealthTracker>, scan_interval: Duration, stuck_threshold: Duration) -> Self {
        Self {
            tracker,
            scan_interval,
            stuck_threshold,
        }
    }

    /// Runs until `shutdown` is signalled, logging a warning for each scan
    /// that finds stuck workers.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.scan_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stuck = self.tracker.stuck_workers(self.stuck_threshold);
                    if !stuck.is_empty() {
                        warn!(?stuck, "workers exceeded stuck threshold");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_heartbeat_is_not_stuck() {
        let tracker = HealthTracker::new();
        tracker.register(0);
        assert!(tracker.stuck_workers(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn deregistered_worker_is_not_reported() {
        let tracker = HealthTracker::new();
        tracker.register(0);
        tracker.deregister(0);
        assert!(tracker.stuck_workers(Duration::from_millis(0)).is_empty());
    }

    #[test]
    fn stale_heartbeat_is_flagged_stuck() {
        let tracker = HealthTracker::new();
        tracker.last_activity_ms.insert(0, AtomicI64::new(0));
        let stuck = tracker.stuck_workers(Duration::from_secs(1));
        assert_eq!(stuck, vec![0]);
    }
}
