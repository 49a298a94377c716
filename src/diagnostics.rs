//! # Diagnostics
//!
//! Per-device health snapshot (spec §3 Diagnostics). Latency samples go
//! into an `hdrhistogram::Histogram`, the same choice and rationale
//! (coordination-omission-free percentile capture) as the teacher's
//! `metrics::MetricsCollector`; request/success/failure totals are atomic
//! counters; the last-N-errors ring buffer is mutex-protected, per spec
//! §5's shared-resource policy.

use crate::value::DeviceId;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// One entry in the recent-errors ring buffer (spec §7).
#[derive(Debug, Clone)]
pub struct RecentError {
    pub timestamp: SystemTime,
    pub kind: String,
    pub operation: String,
    pub address: String,
}

const RECENT_ERRORS_CAPACITY: usize = 64;

/// A read-only snapshot returned by `Diagnostics::snapshot()` (spec §4.6
/// `diagnostics(device)`).
#[derive(Debug, Clone)]
pub struct DiagnosticsSnapshot {
    pub healthy: bool,
    pub last_communication: Option<SystemTime>,
    pub last_response_time: Option<Duration>,
    pub error_count: u64,
    pub success_count: u64,
    pub success_rate: f64,
    pub uptime: Duration,
    pub recent_errors: Vec<RecentError>,
    pub p50_latency: Option<Duration>,
    pub p99_latency: Option<Duration>,
    pub breaker_trip_count: u64,
}

struct DiagnosticsInner {
    histogram: Histogram<u64>,
    last_communication: Option<SystemTime>,
    last_response_time: Option<Duration>,
    recent_errors: VecDeque<RecentError>,
}

/// Per-device diagnostics surface (spec §3, §4.6, §4.4 breaker-transition
/// counters).
pub struct Diagnostics {
    device_id: DeviceId,
    created_at: Instant,
    success_count: AtomicU64,
    error_count: AtomicU64,
    breaker_trips: AtomicU64,
    inner: Mutex<DiagnosticsInner>,
}

impl Diagnostics {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            created_at: Instant::now(),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            breaker_trips: AtomicU64::new(0),
            inner: Mutex::new(DiagnosticsInner {
                // sigfigs=3, max trackable value 10s in nanoseconds.
                histogram: Histogram::new_with_bounds(1, 10_000_000_000, 3).expect("valid histogram bounds"),
                last_communication: None,
                last_response_time: None,
                recent_errors: VecDeque::with_capacity(RECENT_ERRORS_CAPACITY),
            }),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let _ = inner.histogram.record(latency.as_nanos().min(u64::MAX as u128) as u64);
        inner.last_communication = Some(SystemTime::now());
        inner.last_response_time = Some(latency);
    }

    pub fn record_error(&self, kind: &str, operation: &str, address: &str) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if inner.recent_errors.len() >= RECENT_ERRORS_CAPACITY {
            inner.recent_errors.pop_front();
        }
        inner.recent_errors.push_back(RecentError {
            timestamp: SystemTime::now(),
            kind: kind.to_string(),
            operation: operation.to_string(),
            address: address.to_string(),
        });
    }

    pub fn record_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn breaker_trip_count(&self) -> u64 {
        self.breaker_trips.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let success = self.success_count.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        let total = success + errors;
        let success_rate = if total == 0 { 1.0 } else { success as f64 / total as f64 };
        let inner = self.inner.lock();
        DiagnosticsSnapshot {
            healthy: errors == 0 || success_rate >= 0.5,
            last_communication: inner.last_communication,
            last_response_time: inner.last_response_time,
            error_count: errors,
            success_count: success,
            success_rate,
            uptime: self.created_at.elapsed(),
            recent_errors: inner.recent_errors.iter().cloned().collect(),
            p50_latency: if inner.histogram.len() > 0 {
                Some(Duration::from_nanos(inner.histogram.value_at_quantile(0.5)))
            } else {
                None
            },
            p99_latency: if inner.histogram.len() > 0 {
                Some(Duration::from_nanos(inner.histogram.value_at_quantile(0.99)))
            } else {
                None
            },
            breaker_trip_count: self.breaker_trip_count(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

/// Process-global registry mapping device id to its diagnostics (spec §9).
pub struct DiagnosticsRegistry {
    entries: Mutex<HashMap<DeviceId, Arc<Diagnostics>>>,
}

impl DiagnosticsRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_device(&self, device_id: &DeviceId) -> Arc<Diagnostics> {
        let mut entries = self.entries.lock();
        entries
            .entry(device_id.clone())
            .or_insert_with(|| Arc::new(Diagnostics::new(device_id.clone())))
            .clone()
    }
}

impl Default for DiagnosticsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_is_successful_over_total() {
        let d = Diagnostics::new(DeviceId::from("dev-1"));
        d.record_success(Duration::from_micros(100));
        d.record_success(Duration::from_micros(100));
        d.record_error("timeout", "read", "40001");
        let snap = d.snapshot();
        assert_eq!(snap.success_count, 2);
        assert_eq!(snap.error_count, 1);
        assert!((snap.success_rate - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn recent_errors_ring_buffer_evicts_oldest() {
        let d = Diagnostics::new(DeviceId::from("dev-1"));
        for i in 0..(RECENT_ERRORS_CAPACITY + 5) {
            d.record_error("timeout", "read", &format!("4000{}", i));
        }
        let snap = d.snapshot();
        assert_eq!(snap.recent_errors.len(), RECENT_ERRORS_CAPACITY);
        assert_eq!(snap.recent_errors[0].address, "40005");
    }

    #[test]
    fn breaker_trip_count_is_surfaced_in_snapshot() {
        let d = Diagnostics::new(DeviceId::from("dev-1"));
        d.record_breaker_trip();
        d.record_breaker_trip();
        assert_eq!(d.snapshot().breaker_trip_count, 2);
    }

    #[test]
    fn fresh_device_with_no_operations_has_perfect_success_rate() {
        let d = Diagnostics::new(DeviceId::from("dev-1"));
        let snap = d.snapshot();
        assert_eq!(snap.success_rate, 1.0);
        assert!(snap.healthy);
    }
}
