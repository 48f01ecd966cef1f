//! Metrics sink — synchronous counters and duration accumulators updated on
//! the router's critical path, snapshotted over the API.

use std::collections::BTreeMap;

use parking_lot::RwLock;

#[derive(Default)]
struct DurationStat {
    count: u64,
    total_ms: u64,
    max_ms: u64,
}

#[derive(Default)]
pub struct MetricsSink {
    counters: RwLock<BTreeMap<String, u64>>,
    durations: RwLock<BTreeMap<String, DurationStat>>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    pub fn incr_by(&self, name: &str, by: u64) {
        let mut counters = self.counters.write();
        *counters.entry(name.to_owned()).or_insert(0) += by;
    }

    pub fn record_duration_ms(&self, name: &str, ms: u64) {
        let mut durations = self.durations.write();
        let stat = durations.entry(name.to_owned()).or_default();
        stat.count += 1;
        stat.total_ms += ms;
        stat.max_ms = stat.max_ms.max(ms);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    /// Flat snapshot for the metrics endpoint: counters plus
    /// `{name}.count/.total_ms/.max_ms` per duration series.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let mut out = self.counters.read().clone();
        for (name, stat) in self.durations.read().iter() {
            out.insert(format!("{name}.count"), stat.count);
            out.insert(format!("{name}.total_ms"), stat.total_ms);
            out.insert(format!("{name}.max_ms"), stat.max_ms);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = MetricsSink::new();
        m.incr("turn.completed");
        m.incr("turn.completed");
        m.incr_by("router.drop", 3);
        assert_eq!(m.counter("turn.completed"), 2);
        assert_eq!(m.counter("router.drop"), 3);
        assert_eq!(m.counter("missing"), 0);
    }

    #[test]
    fn durations_snapshot() {
        let m = MetricsSink::new();
        m.record_duration_ms("turn.duration", 120);
        m.record_duration_ms("turn.duration", 80);
        let snap = m.snapshot();
        assert_eq!(snap["turn.duration.count"], 2);
        assert_eq!(snap["turn.duration.total_ms"], 200);
        assert_eq!(snap["turn.duration.max_ms"], 120);
    }
}
