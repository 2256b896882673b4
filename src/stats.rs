//! Engine-wide stats surfaces, adapted from this codebase's own latency/
//! byte-counter telemetry: atomic counters for cheap concurrent updates, a
//! bounded sample ring for moving averages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

const MAX_DURATION_SAMPLES: usize = 60;

#[derive(Default)]
pub struct EngineStats {
    pub active_sessions: AtomicU64,
    pub total_events: AtomicU64,
    pub total_conflicts: AtomicU64,
    pub total_errors: AtomicU64,
    pub last_sync_unix_ms: AtomicI64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatsSnapshot {
    pub active_sessions: u64,
    pub total_events: u64,
    pub total_conflicts: u64,
    pub total_errors: u64,
    pub last_sync_unix_ms: i64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            total_events: self.total_events.load(Ordering::Relaxed),
            total_conflicts: self.total_conflicts.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            last_sync_unix_ms: self.last_sync_unix_ms.load(Ordering::Relaxed),
        }
    }
}

/// Bounded ring of operation-duration samples, used to surface a moving
/// average alongside the manifest manager's plain request counters.
pub struct DurationStats {
    samples: Mutex<VecDeque<u64>>,
}

impl Default for DurationStats {
    fn default() -> Self {
        DurationStats {
            samples: Mutex::new(VecDeque::with_capacity(MAX_DURATION_SAMPLES)),
        }
    }
}

impl DurationStats {
    pub fn record_ms(&self, duration_ms: u64) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() >= MAX_DURATION_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(duration_ms);
    }

    pub fn moving_average_ms(&self) -> u64 {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return 0;
        }
        let sum: u64 = samples.iter().sum();
        sum / samples.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_stats_computes_moving_average() {
        let stats = DurationStats::default();
        stats.record_ms(10);
        stats.record_ms(20);
        stats.record_ms(30);
        assert_eq!(stats.moving_average_ms(), 20);
    }

    #[test]
    fn duration_stats_caps_sample_window() {
        let stats = DurationStats::default();
        for _ in 0..100 {
            stats.record_ms(5);
        }
        assert_eq!(stats.moving_average_ms(), 5);
    }

    #[test]
    fn engine_stats_snapshot_reflects_counters() {
        let stats = EngineStats::default();
        stats.active_sessions.store(2, Ordering::Relaxed);
        stats.total_events.fetch_add(3, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.active_sessions, 2);
        assert_eq!(snap.total_events, 3);
    }
}
