//! Counters and latency percentiles for the resolver
//!
//! Recording is lock-free for counters and O(1) for latency samples; the
//! percentiles are only computed when a snapshot is taken.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of most recent check latencies kept for percentiles
const LATENCY_WINDOW: usize = 4_096;

/// Resolver metrics snapshot
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    /// Permission, API and admin checks answered
    pub total_checks: u64,
    pub allowed_checks: u64,
    pub denied_checks: u64,

    /// Resolutions served from the cache
    pub cache_hits: u64,

    /// Resolutions that went to the stores
    pub cache_misses: u64,

    /// Cache entries dropped by admin mutations and explicit flushes
    pub invalidations: u64,

    /// Store failures surfaced to callers
    pub store_errors: u64,

    /// Over the latency window
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub avg_latency_ms: f64,
}

impl EngineMetrics {
    pub fn cache_hit_rate(&self) -> f64 {
        ratio(self.cache_hits, self.cache_hits + self.cache_misses)
    }

    pub fn allow_rate(&self) -> f64 {
        ratio(self.allowed_checks, self.allowed_checks + self.denied_checks)
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[derive(Default)]
struct Counters {
    total_checks: AtomicU64,
    allowed_checks: AtomicU64,
    denied_checks: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    invalidations: AtomicU64,
    store_errors: AtomicU64,
}

impl Counters {
    fn all(&self) -> [&AtomicU64; 7] {
        [
            &self.total_checks,
            &self.allowed_checks,
            &self.denied_checks,
            &self.cache_hits,
            &self.cache_misses,
            &self.invalidations,
            &self.store_errors,
        ]
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Metrics collector shared by the engine's operations
#[derive(Default)]
pub struct MetricsCollector {
    counters: Counters,

    /// Check latencies in microseconds, oldest first
    latencies: Mutex<VecDeque<u64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: Counters::default(),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }

    pub fn record_cache_hit(&self) {
        bump(&self.counters.cache_hits, 1);
    }

    pub fn record_cache_miss(&self) {
        bump(&self.counters.cache_misses, 1);
    }

    /// Record the outcome and latency of a check
    pub fn record_check(&self, allowed: bool, latency: Duration) {
        bump(&self.counters.total_checks, 1);
        if allowed {
            bump(&self.counters.allowed_checks, 1);
        } else {
            bump(&self.counters.denied_checks, 1);
        }

        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let mut window = self.latencies.lock();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(micros);
    }

    pub fn record_invalidations(&self, count: u64) {
        bump(&self.counters.invalidations, count);
    }

    pub fn record_store_error(&self) {
        bump(&self.counters.store_errors, 1);
    }

    /// Current snapshot; sorts a copy of the latency window
    pub fn get_metrics(&self) -> EngineMetrics {
        let mut samples: Vec<u64> = self.latencies.lock().iter().copied().collect();
        samples.sort_unstable();

        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let c = &self.counters;
        EngineMetrics {
            total_checks: load(&c.total_checks),
            allowed_checks: load(&c.allowed_checks),
            denied_checks: load(&c.denied_checks),
            cache_hits: load(&c.cache_hits),
            cache_misses: load(&c.cache_misses),
            invalidations: load(&c.invalidations),
            store_errors: load(&c.store_errors),
            latency_p50_ms: percentile_ms(&samples, 0.50),
            latency_p99_ms: percentile_ms(&samples, 0.99),
            avg_latency_ms: if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<u64>() as f64 / samples.len() as f64 / 1000.0
            },
        }
    }

    pub fn reset(&self) {
        for counter in self.counters.all() {
            counter.store(0, Ordering::Relaxed);
        }
        self.latencies.lock().clear();
    }

    /// Prometheus text exposition of the current snapshot
    pub fn export_prometheus(&self) -> String {
        let m = self.get_metrics();
        let counters = [
            ("authz_checks_total", "Authorization checks answered", m.total_checks),
            ("authz_allowed_total", "Checks answered true", m.allowed_checks),
            ("authz_denied_total", "Checks answered false", m.denied_checks),
            ("authz_cache_hits_total", "Resolutions served from cache", m.cache_hits),
            ("authz_cache_misses_total", "Resolutions loaded from the stores", m.cache_misses),
            ("authz_invalidations_total", "Cache entries invalidated", m.invalidations),
            ("authz_store_errors_total", "Store failures", m.store_errors),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}");
        }
        let _ = writeln!(
            out,
            "# HELP authz_check_latency_seconds Check latency over the last {} checks\n\
             # TYPE authz_check_latency_seconds summary\n\
             authz_check_latency_seconds{{quantile=\"0.5\"}} {}\n\
             authz_check_latency_seconds{{quantile=\"0.99\"}} {}",
            LATENCY_WINDOW,
            m.latency_p50_ms / 1000.0,
            m.latency_p99_ms / 1000.0,
        );
        out
    }
}

fn percentile_ms(sorted: &[u64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        len => {
            let idx = ((len as f64) * p) as usize;
            sorted[idx.min(len - 1)] as f64 / 1000.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_checks() {
        let collector = MetricsCollector::new();

        collector.record_check(true, Duration::ZERO);
        collector.record_check(false, Duration::ZERO);
        collector.record_check(true, Duration::ZERO);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.total_checks, 3);
        assert_eq!(metrics.allowed_checks, 2);
        assert_eq!(metrics.denied_checks, 1);
        assert!((metrics.allow_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_record_cache() {
        let collector = MetricsCollector::new();

        collector.record_cache_hit();
        collector.record_cache_hit();
        collector.record_cache_miss();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.cache_hits, 2);
        assert_eq!(metrics.cache_misses, 1);
        assert!((metrics.cache_hit_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_latency_percentiles() {
        let collector = MetricsCollector::new();

        for ms in [5, 10, 15] {
            collector.record_check(true, Duration::from_millis(ms));
        }

        let metrics = collector.get_metrics();
        assert!((metrics.avg_latency_ms - 10.0).abs() < 0.001);
        assert!((metrics.latency_p50_ms - 10.0).abs() < 0.001);
        assert!((metrics.latency_p99_ms - 15.0).abs() < 0.001);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let collector = MetricsCollector::new();

        collector.record_check(true, Duration::from_secs(10));
        for _ in 0..LATENCY_WINDOW {
            collector.record_check(true, Duration::from_millis(1));
        }

        // The slow sample fell out of the window; the counters did not
        assert_eq!(collector.latencies.lock().len(), LATENCY_WINDOW);
        let metrics = collector.get_metrics();
        assert!((metrics.latency_p99_ms - 1.0).abs() < 0.001);
        assert_eq!(metrics.total_checks, LATENCY_WINDOW as u64 + 1);
    }

    #[test]
    fn test_concurrent_recording() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        collector.record_check(i % 2 == 0, Duration::from_micros(i));
                        collector.record_cache_hit();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.total_checks, 4_000);
        assert_eq!(metrics.allowed_checks, 2_000);
        assert_eq!(metrics.cache_hits, 4_000);
    }

    #[test]
    fn test_prometheus_export_and_reset() {
        let collector = MetricsCollector::new();

        collector.record_check(true, Duration::from_millis(2));
        collector.record_invalidations(4);

        let prometheus = collector.export_prometheus();
        assert!(prometheus.contains("# TYPE authz_checks_total counter"));
        assert!(prometheus.contains("authz_checks_total 1\n"));
        assert!(prometheus.contains("authz_invalidations_total 4\n"));
        assert!(prometheus.contains("authz_check_latency_seconds{quantile=\"0.5\"} 0.002"));

        collector.reset();
        let metrics = collector.get_metrics();
        assert_eq!(metrics.total_checks, 0);
        assert_eq!(metrics.avg_latency_ms, 0.0);
    }
}
