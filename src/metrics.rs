//! Telemetry sink interface and the in-process default implementation
//!
//! Concrete network sinks (statsd and friends) are external collaborators;
//! the proxy only depends on the `Statser` trait. `AtomicStats` is the
//! thread-safe default used in production and inspected by tests.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Telemetry sink.
pub trait Statser: Send + Sync {
    fn increment(&self, name: &str) {
        self.count(name, 1);
    }
    fn count(&self, name: &str, n: u64);
    fn gauge(&self, name: &str, value: u64);
    fn timing(&self, name: &str, elapsed: Duration);

    /// Start a timing measurement; finish it with [`Timer::send`].
    fn new_timing(&self) -> Timer {
        Timer::new()
    }
}

/// Elapsed-time measurement started by [`Statser::new_timing`].
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Timer { start: Instant::now() }
    }

    /// Record the elapsed time under `name`.
    pub fn send(self, statser: &dyn Statser, name: &str) {
        statser.timing(name, self.start.elapsed());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NoopStats;

impl Statser for NoopStats {
    fn count(&self, _name: &str, _n: u64) {}
    fn gauge(&self, _name: &str, _value: u64) {}
    fn timing(&self, _name: &str, _elapsed: Duration) {}
}

/// Thread-safe in-process metrics store.
///
/// Metric names are dynamic (`request.code.404`), so counters live in maps
/// rather than fixed fields. Timings accumulate (count, total microseconds).
#[derive(Debug, Default)]
pub struct AtomicStats {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, u64>,
    timings: DashMap<String, (u64, u64)>,
}

impl AtomicStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, zero if never incremented.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    /// Last recorded value of a gauge.
    pub fn gauge_value(&self, name: &str) -> u64 {
        self.gauges.get(name).map(|v| *v).unwrap_or(0)
    }

    /// Number of timing samples recorded under `name`.
    pub fn timing_count(&self, name: &str) -> u64 {
        self.timings.get(name).map(|v| v.0).unwrap_or(0)
    }
}

impl Statser for AtomicStats {
    fn count(&self, name: &str, n: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += n;
    }

    fn gauge(&self, name: &str, value: u64) {
        self.gauges.insert(name.to_string(), value);
    }

    fn timing(&self, name: &str, elapsed: Duration) {
        let mut entry = self.timings.entry(name.to_string()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += elapsed.as_micros() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = AtomicStats::new();
        stats.increment("request.count.total");
        stats.increment("request.count.total");
        stats.count("request.count.total", 3);
        assert_eq!(stats.counter("request.count.total"), 5);
        assert_eq!(stats.counter("never.seen"), 0);
    }

    #[test]
    fn test_gauges_overwrite() {
        let stats = AtomicStats::new();
        stats.gauge("concurrency", 3);
        stats.gauge("concurrency", 7);
        assert_eq!(stats.gauge_value("concurrency"), 7);
    }

    #[test]
    fn test_timing() {
        let stats = AtomicStats::new();
        let timer = stats.new_timing();
        timer.send(&stats, "request.time");
        assert_eq!(stats.timing_count("request.time"), 1);
    }
}
