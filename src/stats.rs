//! Per-operation latency accounting for the benchmark front-end.

use std::fmt;
use std::time::Duration;

/// Collects per-op latencies on one thread; recorders merge at the end of
/// a run.
#[derive(Default)]
pub struct LatencyRecorder {
    samples: Vec<u64>,
}

impl LatencyRecorder {
    pub fn new() -> LatencyRecorder {
        LatencyRecorder::default()
    }

    pub fn record(&mut self, latency: Duration) {
        self.samples.push(latency.as_nanos() as u64);
    }

    pub fn merge(&mut self, other: LatencyRecorder) {
        self.samples.extend(other.samples);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn summarize(mut self) -> LatencySummary {
        self.samples.sort_unstable();
        let count = self.samples.len();
        let avg = if count == 0 {
            0
        } else {
            self.samples.iter().sum::<u64>() / count as u64
        };
        LatencySummary {
            count,
            avg_ns: avg,
            p50_ns: percentile(&self.samples, 50.0),
            p90_ns: percentile(&self.samples, 90.0),
            p99_ns: percentile(&self.samples, 99.0),
            p999_ns: percentile(&self.samples, 99.9),
        }
    }
}

fn percentile(sorted: &[u64], percent: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((percent / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Clone, Copy, Debug)]
pub struct LatencySummary {
    pub count: usize,
    pub avg_ns: u64,
    pub p50_ns: u64,
    pub p90_ns: u64,
    pub p99_ns: u64,
    pub p999_ns: u64,
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ops, avg {}ns, p50 {}ns, p90 {}ns, p99 {}ns, p999 {}ns",
            self.count, self.avg_ns, self.p50_ns, self.p90_ns, self.p99_ns, self.p999_ns
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_of_uniform_samples() {
        let mut rec = LatencyRecorder::new();
        for i in 1..=100u64 {
            rec.record(Duration::from_nanos(i));
        }
        let s = rec.summarize();
        assert_eq!(s.count, 100);
        assert_eq!(s.p50_ns, 50);
        assert_eq!(s.p90_ns, 90);
        assert_eq!(s.p99_ns, 99);
        assert_eq!(s.avg_ns, 50);
    }

    #[test]
    fn merge_combines_threads() {
        let mut a = LatencyRecorder::new();
        let mut b = LatencyRecorder::new();
        a.record(Duration::from_nanos(10));
        b.record(Duration::from_nanos(20));
        a.merge(b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn empty_recorder_is_quiet() {
        let s = LatencyRecorder::new().summarize();
        assert_eq!(s.count, 0);
        assert_eq!(s.p99_ns, 0);
    }
}
