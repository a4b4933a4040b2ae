//! Aggregate queries over a bucket ring, with optional future occupancy.

use crate::config::RT_DROP_VALVE_MS;
use crate::stat::bucket::{MetricBucket, MetricEvent};
use crate::stat::ring::{BucketRing, WindowBucket};
use std::sync::Arc;

/// One per-second row of a metric, for display and totals inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricSample {
    pub window_start_ms: u64,
    pub pass: u64,
    pub block: u64,
    pub success: u64,
    pub exception: u64,
    pub rt_sum: u64,
    pub min_rt: u64,
    pub occupied_pass: u64,
}

/// A sliding metric over [`MetricBucket`]s.
///
/// With occupancy enabled, a companion ring of the same geometry records
/// borrows against windows that have not arrived yet; when the main ring
/// rotates into such a window the borrowed count becomes real pass count.
#[derive(Debug)]
pub struct SlidingMetric {
    ring: BucketRing<MetricBucket>,
    future: Option<BucketRing<MetricBucket>>,
}

impl SlidingMetric {
    pub fn new(sample_count: usize, interval_ms: u64) -> Self {
        Self {
            ring: BucketRing::new(sample_count, interval_ms),
            future: None,
        }
    }

    pub fn with_occupancy(sample_count: usize, interval_ms: u64) -> Self {
        Self {
            ring: BucketRing::new(sample_count, interval_ms),
            future: Some(BucketRing::new(sample_count, interval_ms)),
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.ring.interval_ms()
    }

    pub fn interval_sec(&self) -> f64 {
        self.ring.interval_sec()
    }

    pub fn window_ms(&self) -> u64 {
        self.ring.window_ms()
    }

    pub fn sample_count(&self) -> usize {
        self.ring.sample_count()
    }

    fn current(&self, now_ms: u64) -> Arc<WindowBucket<MetricBucket>> {
        self.ring.current_bucket_with(now_ms, |bucket, start| {
            if let Some(future) = &self.future {
                // The borrowed quota for this window becomes real passes.
                if let Some(borrowed) = future.bucket_at(start) {
                    bucket.add(MetricEvent::Pass, borrowed.value().get(MetricEvent::Pass));
                }
            }
        })
    }

    pub fn add(&self, now_ms: u64, event: MetricEvent, count: u64) {
        self.current(now_ms).value().add(event, count);
    }

    pub fn add_rt(&self, now_ms: u64, rt_ms: u64) {
        self.current(now_ms).value().add_rt(rt_ms);
    }

    /// Sum of `event` across non-stale buckets.
    pub fn sum(&self, now_ms: u64, event: MetricEvent) -> u64 {
        self.current(now_ms);
        let mut total = 0;
        self.ring
            .for_each_valid(now_ms, |bucket| total += bucket.get(event));
        total
    }

    /// `event` count in the window containing `time_ms`, if still held.
    pub fn window_sum(&self, time_ms: u64, event: MetricEvent) -> u64 {
        self.ring
            .bucket_at(time_ms)
            .map(|bucket| bucket.value().get(event))
            .unwrap_or(0)
    }

    /// `event` count of the window immediately before `now_ms`.
    pub fn previous_window_sum(&self, now_ms: u64, event: MetricEvent) -> u64 {
        self.ring
            .previous_bucket(now_ms)
            .map(|bucket| bucket.value().get(event))
            .unwrap_or(0)
    }

    /// Per-second rate of `event` over the live portion of the interval.
    ///
    /// Slots still holding data from lapsed windows shrink the divisor: the
    /// interval they cover contributed no live data. The divisor never drops
    /// below one bucket width.
    pub fn rate(&self, now_ms: u64, event: MetricEvent) -> f64 {
        let total = self.sum(now_ms, event);
        total as f64 / self.effective_interval_sec(now_ms)
    }

    fn effective_interval_sec(&self, now_ms: u64) -> f64 {
        let window_sec = self.ring.window_ms() as f64 / 1000.0;
        let stale_sec = self.ring.stale_count(now_ms) as f64 * window_sec;
        (self.ring.interval_sec() - stale_sec).max(window_sec)
    }

    /// Smallest response time observed in a non-stale bucket.
    pub fn min_rt(&self, now_ms: u64) -> u64 {
        self.current(now_ms);
        let mut min = RT_DROP_VALVE_MS;
        self.ring
            .for_each_valid(now_ms, |bucket| min = min.min(bucket.min_rt()));
        min
    }

    /// Largest single-bucket success count among non-stale buckets.
    pub fn max_window_success(&self, now_ms: u64) -> u64 {
        self.current(now_ms);
        let mut max = 0;
        self.ring
            .for_each_valid(now_ms, |bucket| max = max.max(bucket.get(MetricEvent::Success)));
        max
    }

    /// Register a borrow against the window containing `future_ms`.
    /// No-op unless occupancy is enabled.
    pub fn add_waiting(&self, future_ms: u64, count: u64) {
        if let Some(future) = &self.future {
            future
                .current_bucket(future_ms)
                .value()
                .add(MetricEvent::Pass, count);
        }
    }

    /// Total borrowed quota still waiting on windows after `now_ms`.
    pub fn waiting(&self, now_ms: u64) -> u64 {
        let Some(future) = &self.future else {
            return 0;
        };
        let mut total = 0;
        future.for_each_present(|start, bucket| {
            if start > now_ms {
                total += bucket.get(MetricEvent::Pass);
            }
        });
        total
    }

    /// Non-stale per-window rows, oldest first.
    pub fn samples(&self, now_ms: u64) -> Vec<MetricSample> {
        self.current(now_ms);
        let mut rows = Vec::with_capacity(self.ring.sample_count());
        self.ring.for_each_present(|start, bucket| {
            if now_ms.saturating_sub(start) <= self.ring.interval_ms() && start <= now_ms {
                rows.push(MetricSample {
                    window_start_ms: start,
                    pass: bucket.get(MetricEvent::Pass),
                    block: bucket.get(MetricEvent::Block),
                    success: bucket.get(MetricEvent::Success),
                    exception: bucket.get(MetricEvent::Exception),
                    rt_sum: bucket.get(MetricEvent::Rt),
                    min_rt: bucket.min_rt(),
                    occupied_pass: bucket.get(MetricEvent::OccupiedPass),
                });
            }
        });
        rows.sort_by_key(|row| row.window_start_ms);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_exclude_stale_buckets() {
        let metric = SlidingMetric::new(2, 1000);
        metric.add(100, MetricEvent::Pass, 6);
        metric.add(600, MetricEvent::Pass, 4);

        assert_eq!(metric.sum(900, MetricEvent::Pass), 10);
        // Two seconds later both windows have lapsed.
        assert_eq!(metric.sum(2900, MetricEvent::Pass), 0);
    }

    #[test]
    fn continuous_load_keeps_the_advertised_bounds() {
        // Feed exactly 10 events per 100 ms for 2 intervals, then check the
        // windowed sum stays within [r*T*(1-1/s), r*T].
        let metric = SlidingMetric::new(4, 1000);
        for tick in 0..20 {
            metric.add(tick * 100, MetricEvent::Pass, 10);
        }
        let now = 1999;
        let sum = metric.sum(now, MetricEvent::Pass);
        assert!(sum <= 100, "sum {sum} exceeds r*T");
        assert!(sum >= 75, "sum {sum} below r*T*(1-1/s)");
    }

    #[test]
    fn rate_uses_live_portion_of_interval() {
        let metric = SlidingMetric::new(2, 1000);
        metric.add(100, MetricEvent::Pass, 10);
        // Nothing is stale yet: divisor is the full interval.
        assert!((metric.rate(200, MetricEvent::Pass) - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn borrowed_quota_lands_in_its_window() {
        let metric = SlidingMetric::with_occupancy(2, 1000);
        metric.add(100, MetricEvent::Pass, 1);

        // Borrow 3 from the window starting at 1000.
        metric.add_waiting(1000, 3);
        assert_eq!(metric.waiting(900), 3);

        // Once that window arrives the borrow is no longer "waiting" and
        // shows up as pass count.
        assert_eq!(metric.waiting(1000), 0);
        assert_eq!(metric.window_sum(1050, MetricEvent::Pass), 0); // not rotated yet
        metric.add(1050, MetricEvent::Pass, 0); // force rotation
        assert_eq!(metric.window_sum(1050, MetricEvent::Pass), 3);
    }

    #[test]
    fn previous_window_sum_reads_the_adjacent_bucket() {
        let metric = SlidingMetric::new(2, 1000);
        metric.add(400, MetricEvent::Pass, 8);
        assert_eq!(metric.previous_window_sum(900, MetricEvent::Pass), 8);
    }

    #[test]
    fn samples_list_live_windows_in_order() {
        let metric = SlidingMetric::new(4, 2000);
        metric.add(100, MetricEvent::Pass, 1);
        metric.add(600, MetricEvent::Pass, 2);
        metric.add_rt(600, 30);

        let rows = metric.samples(700);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].window_start_ms, 0);
        assert_eq!(rows[1].pass, 2);
        assert_eq!(rows[1].rt_sum, 30);
    }
}
