//! Per-bucket counters.

use crate::config::RT_DROP_VALVE_MS;
use crate::stat::ring::RingBucket;
use std::sync::atomic::{AtomicU64, Ordering};

/// Countable events inside one window bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    Pass,
    Block,
    Exception,
    Success,
    /// Sum of response times; divided by `Success` for the average.
    Rt,
    /// Admissions that consumed quota borrowed from a future window.
    OccupiedPass,
}

const EVENT_COUNT: usize = 6;

/// One bucket of a sliding metric. All counters are monotone within the
/// bucket's lifetime; `reset` happens only under the owning ring's rotation
/// lock.
#[derive(Debug)]
pub struct MetricBucket {
    counters: [AtomicU64; EVENT_COUNT],
    min_rt: AtomicU64,
}

impl MetricBucket {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            min_rt: AtomicU64::new(RT_DROP_VALVE_MS),
        }
    }

    pub fn add(&self, event: MetricEvent, count: u64) {
        self.counters[event as usize].fetch_add(count, Ordering::Relaxed);
    }

    pub fn get(&self, event: MetricEvent) -> u64 {
        self.counters[event as usize].load(Ordering::Relaxed)
    }

    pub fn add_rt(&self, rt_ms: u64) {
        self.add(MetricEvent::Rt, rt_ms);
        self.min_rt.fetch_min(rt_ms, Ordering::Relaxed);
    }

    pub fn min_rt(&self) -> u64 {
        self.min_rt.load(Ordering::Relaxed)
    }
}

impl Default for MetricBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBucket for MetricBucket {
    fn new_empty() -> Self {
        Self::new()
    }

    fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        self.min_rt.store(RT_DROP_VALVE_MS, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let bucket = MetricBucket::new();
        bucket.add(MetricEvent::Pass, 3);
        bucket.add(MetricEvent::Block, 1);
        bucket.add_rt(20);
        bucket.add_rt(7);

        assert_eq!(bucket.get(MetricEvent::Pass), 3);
        assert_eq!(bucket.get(MetricEvent::Block), 1);
        assert_eq!(bucket.get(MetricEvent::Rt), 27);
        assert_eq!(bucket.min_rt(), 7);
    }

    #[test]
    fn reset_restores_the_rt_floor() {
        let bucket = MetricBucket::new();
        bucket.add(MetricEvent::Pass, 5);
        bucket.add_rt(3);
        bucket.reset();

        assert_eq!(bucket.get(MetricEvent::Pass), 0);
        assert_eq!(bucket.min_rt(), RT_DROP_VALVE_MS);
    }
}
