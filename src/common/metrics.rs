//! Coordination metrics
//!
//! Process-wide counters for lock and quota outcomes, plus wait-time
//! histograms. Rendered as Prometheus text or as a serializable snapshot.

use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries for wait measurements (in milliseconds)
const WAIT_BUCKETS: [f64; 10] = [
    1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// A simple histogram for wait-time tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default wait buckets
    pub fn new() -> Self {
        Self::with_buckets(&WAIT_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a duration
    pub fn observe(&self, d: Duration) {
        let ms = d.as_secs_f64() * 1000.0;
        let idx = self
            .boundaries
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(self.boundaries.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(d.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative buckets, last one is +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.buckets.len());
        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }
        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));
        result
    }

    /// Sum of observations in milliseconds
    pub fn sum_ms(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for both primitives
#[derive(Debug, Default)]
pub struct CoordinationMetrics {
    pub locks_acquired: Counter,
    pub locks_stale_taken: Counter,
    pub lock_timeouts: Counter,
    pub locks_released: Counter,
    pub lock_wait: Histogram,

    pub quota_claims: Counter,
    pub quota_rejections: Counter,
    pub quota_timeouts: Counter,
    pub quota_reentrancy: Counter,
    pub quota_waits: Counter,
    pub quota_wait: Histogram,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub locks_acquired: u64,
    pub locks_stale_taken: u64,
    pub lock_timeouts: u64,
    pub locks_released: u64,
    pub quota_claims: u64,
    pub quota_rejections: u64,
    pub quota_timeouts: u64,
    pub quota_reentrancy: u64,
    pub quota_waits: u64,
}

impl CoordinationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            locks_acquired: self.locks_acquired.get(),
            locks_stale_taken: self.locks_stale_taken.get(),
            lock_timeouts: self.lock_timeouts.get(),
            locks_released: self.locks_released.get(),
            quota_claims: self.quota_claims.get(),
            quota_rejections: self.quota_rejections.get(),
            quota_timeouts: self.quota_timeouts.get(),
            quota_reentrancy: self.quota_reentrancy.get(),
            quota_waits: self.quota_waits.get(),
        }
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let counters: [(&str, &str, &Counter); 9] = [
            ("locks_acquired_total", "Locks acquired", &self.locks_acquired),
            ("locks_stale_taken_total", "Stale locks taken over", &self.locks_stale_taken),
            ("lock_timeouts_total", "Lock acquisitions that timed out", &self.lock_timeouts),
            ("locks_released_total", "Locks released", &self.locks_released),
            ("quota_claims_total", "Successful quota claims", &self.quota_claims),
            ("quota_rejections_total", "Claims rejected over quota", &self.quota_rejections),
            ("quota_timeouts_total", "Blocking claims that timed out", &self.quota_timeouts),
            ("quota_reentrancy_total", "Nested guard entries refused", &self.quota_reentrancy),
            ("quota_waits_total", "Polls spent waiting for quota", &self.quota_waits),
        ];

        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP kvguard_{} {}", name, help);
            let _ = writeln!(out, "# TYPE kvguard_{} counter", name);
            let _ = writeln!(out, "kvguard_{} {}", name, counter.get());
        }

        for (name, hist) in [("lock_wait_ms", &self.lock_wait), ("quota_wait_ms", &self.quota_wait)] {
            let _ = writeln!(out, "# TYPE kvguard_{} histogram", name);
            for (le, count) in hist.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(out, "kvguard_{}_bucket{{le=\"{}\"}} {}", name, le, count);
            }
            let _ = writeln!(out, "kvguard_{}_sum {}", name, hist.sum_ms());
            let _ = writeln!(out, "kvguard_{}_count {}", name, hist.count());
        }

        out
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<CoordinationMetrics> =
    once_cell::sync::Lazy::new(CoordinationMetrics::new);
