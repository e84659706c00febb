//! `MetricsTracker` — latency alerting + a rolling-window snapshot (§4.8).
//!
//! The four-timestamp ledger and threshold-alert contract come straight from
//! §4.8; the rolling p95 view is not in the distilled spec but mirrors the
//! teacher's `AppDiagnostics`/`PerfMetrics` counters in `dictum-app` — this
//! crate already measures every stage's latency for the alert check, so
//! keeping a short window of recent samples for a snapshot is nearly free.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::config::MetricsThresholds;
use crate::engine::events::LatencyMetrics;
use crate::session::SessionId;

/// How many recent samples each stage keeps for the p95 snapshot.
const WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageSnapshot {
    pub count: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub stt: StageSnapshot,
    pub post: StageSnapshot,
    pub injection: StageSnapshot,
    pub total: StageSnapshot,
}

#[derive(Default)]
struct RollingWindow {
    samples: VecDeque<u64>,
    count: AtomicU64,
}

impl RollingWindow {
    fn record(&mut self, ms: u64) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StageSnapshot {
        if self.samples.is_empty() {
            return StageSnapshot::default();
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        let idx = idx.saturating_sub(1).min(sorted.len() - 1);
        StageSnapshot {
            count: self.count.load(Ordering::Relaxed),
            p95_ms: sorted[idx],
            max_ms: *sorted.last().unwrap(),
        }
    }
}

/// Compares each stage's latency against `MetricsThresholds` and raises a
/// warn-level alert on overrun (§4.8). Thresholds are configurable at
/// construction but not hot-swappable — a settings change restarts the
/// tracker via the host, same as every other `ConfigRecord`-derived value.
pub struct MetricsTracker {
    thresholds: MetricsThresholds,
    stt: Mutex<RollingWindow>,
    post: Mutex<RollingWindow>,
    injection: Mutex<RollingWindow>,
    total: Mutex<RollingWindow>,
}

impl MetricsTracker {
    pub fn new(thresholds: MetricsThresholds) -> Self {
        Self {
            thresholds,
            stt: Mutex::new(RollingWindow::default()),
            post: Mutex::new(RollingWindow::default()),
            injection: Mutex::new(RollingWindow::default()),
            total: Mutex::new(RollingWindow::default()),
        }
    }

    /// Records one completed session's latency breakdown and alerts on any
    /// stage that exceeded its threshold.
    pub fn record(&self, session_id: SessionId, latency: &LatencyMetrics) {
        if let Some(ms) = latency.stt_ms {
            self.stt.lock().record(ms);
            self.alert_if_over("stt", session_id, ms, self.thresholds.stt_ms);
        }
        if let Some(ms) = latency.post_ms {
            self.post.lock().record(ms);
            self.alert_if_over("post", session_id, ms, self.thresholds.post_ms);
        }
        if let Some(ms) = latency.injection_ms {
            self.injection.lock().record(ms);
        }
        if let Some(ms) = latency.total_ms {
            self.total.lock().record(ms);
            self.alert_if_over("total", session_id, ms, self.thresholds.total_ms);
        }
    }

    fn alert_if_over(&self, name: &str, session_id: SessionId, actual_ms: u64, threshold_ms: u64) {
        if actual_ms > threshold_ms {
            warn!(
                name,
                actual_ms,
                threshold_ms,
                %session_id,
                "latency_threshold_exceeded"
            );
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            stt: self.stt.lock().snapshot(),
            post: self.post.lock().snapshot(),
            injection: self.injection.lock().snapshot(),
            total: self.total.lock().snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latency(stt: u64, post: u64, injection: u64, total: u64) -> LatencyMetrics {
        LatencyMetrics {
            stt_ms: Some(stt),
            post_ms: Some(post),
            injection_ms: Some(injection),
            total_ms: Some(total),
        }
    }

    #[test]
    fn snapshot_reports_count_and_p95_within_window() {
        let tracker = MetricsTracker::new(MetricsThresholds {
            stt_ms: 1500,
            post_ms: 250,
            total_ms: 2000,
        });
        for i in 1..=10u64 {
            tracker.record(SessionId(i), &latency(100, 50, 10, 160));
        }
        let snap = tracker.snapshot();
        assert_eq!(snap.stt.count, 10);
        assert_eq!(snap.stt.p95_ms, 100);
    }

    #[test]
    fn window_caps_at_64_samples() {
        let tracker = MetricsTracker::new(MetricsThresholds {
            stt_ms: 1500,
            post_ms: 250,
            total_ms: 2000,
        });
        for i in 1..=100u64 {
            tracker.record(SessionId(i), &latency(i, 1, 1, i));
        }
        let snap = tracker.snapshot();
        assert_eq!(snap.stt.count, 100);
        assert_eq!(snap.stt.max_ms, 100);
    }
}
