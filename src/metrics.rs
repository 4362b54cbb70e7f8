//! Metrics/tracing collaborator interface.
//!
//! A small counter/gauge/timer trait lets the cache, bus, lock, queue, and
//! job runner emit named metrics without depending on a concrete backend;
//! wiring a real OTLP/Prometheus exporter is left to the embedding
//! application.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

pub trait MetricsSink: Send + Sync + 'static {
    fn counter(&self, name: &str, value: u64);
    fn gauge(&self, name: &str, value: i64);
    fn timer(&self, name: &str, elapsed: Duration);
}

/// Discards everything. Used as the default when the caller doesn't wire a
/// real sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter(&self, _name: &str, _value: u64) {}
    fn gauge(&self, _name: &str, _value: i64) {}
    fn timer(&self, _name: &str, _elapsed: Duration) {}
}

/// Accumulates counters/gauges/timer samples in memory, for assertions in
/// tests (e.g. "did `queue.deadlettered` increment exactly once").
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    timer_samples: DashMap<String, Vec<Duration>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> i64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn timer_samples(&self, name: &str) -> Vec<Duration> {
        self.timer_samples.get(name).map(|v| v.clone()).unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn counter(&self, name: &str, value: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    fn gauge(&self, name: &str, value: i64) {
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    fn timer(&self, name: &str, elapsed: Duration) {
        self.timer_samples.entry(name.to_string()).or_default().push(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = InMemoryMetrics::new();
        m.counter("queue.enqueued", 1);
        m.counter("queue.enqueued", 2);
        assert_eq!(m.counter_value("queue.enqueued"), 3);
    }

    #[test]
    fn gauge_overwrites() {
        let m = InMemoryMetrics::new();
        m.gauge("queue.working", 5);
        m.gauge("queue.working", 2);
        assert_eq!(m.gauge_value("queue.working"), 2);
    }
}
