//! Prefetch hit/miss accounting and transfer timing
//!
//! Counters are monotonic until an explicit [`MetricsCollector::reset`].
//! One collector belongs to one orchestrator; readers get a [`MetricsSnapshot`].
//!
//! Definitions:
//! - `attempts = hits + misses`
//! - `hit_rate = hits / attempts`
//! - `avg_transfer_ms` = copy time averaged over every completed copy
//!   (blocking copies on a miss and finished prefetches)
//! - `avg_wait_ms` = time blocked on a prefetch token, averaged over those waits

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free counters updated by the orchestrator after each decision
pub struct MetricsCollector {
    start_time: Instant,
    hits: AtomicU64,
    misses: AtomicU64,
    prefetch_hits: AtomicU64,
    resident_hits: AtomicU64,
    resident_reuse: AtomicU64,
    prefetches_issued: AtomicU64,
    prefetches_skipped: AtomicU64,
    prefetch_failures: AtomicU64,
    evictions: AtomicU64,
    transfers: AtomicU64,
    transfer_time_us: AtomicU64,
    waits: AtomicU64,
    wait_time_us: AtomicU64,
    bytes_copied: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            prefetch_hits: AtomicU64::new(0),
            resident_hits: AtomicU64::new(0),
            resident_reuse: AtomicU64::new(0),
            prefetches_issued: AtomicU64::new(0),
            prefetches_skipped: AtomicU64::new(0),
            prefetch_failures: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            transfer_time_us: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            wait_time_us: AtomicU64::new(0),
            bytes_copied: AtomicU64::new(0),
        }
    }

    /// Required adapter resolved by waiting on its prefetch token
    pub fn record_prefetch_wait_hit(&self, waited: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.prefetch_hits.fetch_add(1, Ordering::Relaxed);
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.wait_time_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    /// Required adapter already landed by a prefetch whose token was reaped earlier
    pub fn record_prefetch_ready_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.prefetch_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Required adapter still resident from an earlier batch
    pub fn record_resident_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.resident_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Resident reuse with prefetch disabled; not an attempt
    pub fn record_resident_reuse(&self) {
        self.resident_reuse.fetch_add(1, Ordering::Relaxed);
    }

    /// Required adapter that needed a blocking copy
    pub fn record_miss(&self, copy_time: Duration, bytes: usize) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.record_transfer(copy_time, bytes);
    }

    /// A prefetch copy finished on the transfer queue
    pub fn record_transfer(&self, copy_time: Duration, bytes: usize) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.transfer_time_us
            .fetch_add(copy_time.as_micros() as u64, Ordering::Relaxed);
        self.bytes_copied.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_prefetch_issued(&self) {
        self.prefetches_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_skipped(&self) {
        self.prefetches_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_failure(&self) {
        self.prefetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.prefetch_hits,
            &self.resident_hits,
            &self.resident_reuse,
            &self.prefetches_issued,
            &self.prefetches_skipped,
            &self.prefetch_failures,
            &self.evictions,
            &self.transfers,
            &self.transfer_time_us,
            &self.waits,
            &self.wait_time_us,
            &self.bytes_copied,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let attempts = hits + misses;
        let transfers = self.transfers.load(Ordering::Relaxed);
        let waits = self.waits.load(Ordering::Relaxed);

        MetricsSnapshot {
            hit_rate: ratio(hits, attempts),
            avg_transfer_ms: ratio(self.transfer_time_us.load(Ordering::Relaxed), transfers) / 1000.0,
            avg_wait_ms: ratio(self.wait_time_us.load(Ordering::Relaxed), waits) / 1000.0,
            attempts,
            hits,
            misses,
            prefetch_hits: self.prefetch_hits.load(Ordering::Relaxed),
            resident_hits: self.resident_hits.load(Ordering::Relaxed),
            resident_reuse: self.resident_reuse.load(Ordering::Relaxed),
            prefetches_issued: self.prefetches_issued.load(Ordering::Relaxed),
            prefetches_skipped: self.prefetches_skipped.load(Ordering::Relaxed),
            prefetch_failures: self.prefetch_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            transfers,
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition of the counters
    pub fn prometheus_text(&self, pool_name: &str) -> String {
        let s = self.snapshot();
        let uptime = self.start_time.elapsed().as_secs();

        let mut out = String::new();
        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            out.push_str(&format!("# HELP adapter_prefetch_{} {}\n", name, help));
            out.push_str(&format!("# TYPE adapter_prefetch_{} {}\n", name, kind));
            out.push_str(&format!(
                "adapter_prefetch_{}{{pool=\"{}\"}} {}\n",
                name, pool_name, value
            ));
        };

        metric("uptime_seconds", "gauge", "Collector uptime in seconds", uptime.to_string());
        metric("attempts_total", "counter", "Required adapter resolutions", s.attempts.to_string());
        metric("hits_total", "counter", "Required adapters served without a blocking copy", s.hits.to_string());
        metric("misses_total", "counter", "Required adapters that needed a blocking copy", s.misses.to_string());
        metric("hit_rate", "gauge", "hits / attempts", format!("{:.4}", s.hit_rate));
        metric("prefetches_issued_total", "counter", "Asynchronous prefetches submitted", s.prefetches_issued.to_string());
        metric("prefetches_skipped_total", "counter", "Prefetches skipped for lack of an empty slot", s.prefetches_skipped.to_string());
        metric("prefetch_failures_total", "counter", "Prefetches that failed and were discarded", s.prefetch_failures.to_string());
        metric("evictions_total", "counter", "Adapters evicted on external request", s.evictions.to_string());
        metric("avg_transfer_ms", "gauge", "Average host to device copy time", format!("{:.3}", s.avg_transfer_ms));
        metric("avg_wait_ms", "gauge", "Average time blocked on a prefetch token", format!("{:.3}", s.avg_wait_ms));
        metric("bytes_copied_total", "counter", "Bytes copied host to device", s.bytes_copied.to_string());
        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Read-only view of the collector at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub hit_rate: f64,
    pub avg_transfer_ms: f64,
    pub avg_wait_ms: f64,
    pub attempts: u64,
    pub hits: u64,
    pub misses: u64,
    pub prefetch_hits: u64,
    pub resident_hits: u64,
    pub resident_reuse: u64,
    pub prefetches_issued: u64,
    pub prefetches_skipped: u64,
    pub prefetch_failures: u64,
    pub evictions: u64,
    pub transfers: u64,
    pub bytes_copied: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "hit_rate": self.hit_rate,
            "avg_transfer_ms": self.avg_transfer_ms,
            "avg_wait_ms": self.avg_wait_ms,
            "attempts": self.attempts,
            "hits": {
                "total": self.hits,
                "prefetch": self.prefetch_hits,
                "resident": self.resident_hits,
            },
            "misses": self.misses,
            "resident_reuse": self.resident_reuse,
            "prefetch": {
                "issued": self.prefetches_issued,
                "skipped": self.prefetches_skipped,
                "failed": self.prefetch_failures,
            },
            "evictions": self.evictions,
            "transfers": self.transfers,
            "bytes_copied": self.bytes_copied,
        })
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "hit rate {:.1}% ({}/{} attempts, {} prefetch, {} resident) | avg transfer {:.2}ms | avg wait {:.2}ms | prefetch {} issued/{} skipped/{} failed",
            self.hit_rate * 100.0,
            self.hits,
            self.attempts,
            self.prefetch_hits,
            self.resident_hits,
            self.avg_transfer_ms,
            self.avg_wait_ms,
            self.prefetches_issued,
            self.prefetches_skipped,
            self.prefetch_failures,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let m = MetricsCollector::new();
        let s = m.snapshot();
        assert_eq!(s.attempts, 0);
        assert_eq!(s.hit_rate, 0.0);
        assert_eq!(s.avg_transfer_ms, 0.0);
        assert_eq!(s.avg_wait_ms, 0.0);
    }

    #[test]
    fn test_hit_rate_and_averages() {
        let m = MetricsCollector::new();
        m.record_miss(Duration::from_millis(4), 100);
        m.record_transfer(Duration::from_millis(2), 100);
        m.record_prefetch_wait_hit(Duration::from_millis(1));
        m.record_prefetch_ready_hit();
        m.record_resident_hit();

        let s = m.snapshot();
        assert_eq!(s.attempts, 4);
        assert_eq!(s.hits, 3);
        assert_eq!(s.prefetch_hits, 2);
        assert_eq!(s.resident_hits, 1);
        assert!((s.hit_rate - 0.75).abs() < 1e-9);
        assert!((s.avg_transfer_ms - 3.0).abs() < 1e-9);
        assert!((s.avg_wait_ms - 1.0).abs() < 1e-9);
        assert_eq!(s.bytes_copied, 200);
    }

    #[test]
    fn test_resident_reuse_is_not_an_attempt() {
        let m = MetricsCollector::new();
        m.record_resident_reuse();
        let s = m.snapshot();
        assert_eq!(s.attempts, 0);
        assert_eq!(s.resident_reuse, 1);
    }

    #[test]
    fn test_reset() {
        let m = MetricsCollector::new();
        m.record_miss(Duration::from_millis(1), 10);
        m.record_prefetch_issued();
        m.record_eviction();
        m.reset();
        let s = m.snapshot();
        assert_eq!(s.attempts, 0);
        assert_eq!(s.prefetches_issued, 0);
        assert_eq!(s.evictions, 0);
        assert_eq!(s.bytes_copied, 0);
    }

    #[test]
    fn test_json() {
        let m = MetricsCollector::new();
        m.record_resident_hit();
        m.record_prefetch_skipped();
        let json = m.snapshot().to_json();
        assert_eq!(json["attempts"], 1);
        assert_eq!(json["hits"]["resident"], 1);
        assert_eq!(json["prefetch"]["skipped"], 1);
        assert_eq!(json["hit_rate"], 1.0);
    }

    #[test]
    fn test_prometheus() {
        let m = MetricsCollector::new();
        m.record_miss(Duration::from_millis(1), 10);
        let prom = m.prometheus_text("test");
        assert!(prom.contains("adapter_prefetch_misses_total{pool=\"test\"} 1"));
        assert!(prom.contains("# TYPE adapter_prefetch_hit_rate gauge"));
    }

    #[test]
    fn test_display() {
        let m = MetricsCollector::new();
        m.record_resident_hit();
        m.record_miss(Duration::from_millis(1), 10);
        let line = m.snapshot().to_string();
        assert!(line.starts_with("hit rate 50.0% (1/2 attempts"));
    }
}
