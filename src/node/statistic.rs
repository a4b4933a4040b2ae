use crate::clock::now_ms;
use crate::config::{
    occupy_timeout_ms, MINUTE_SAMPLE_COUNT, MINUTE_WINDOW_MS, SECOND_SAMPLE_COUNT,
    SECOND_WINDOW_MS,
};
use crate::stat::{MetricEvent, MetricSample, SlidingMetric};
use std::sync::atomic::{AtomicI64, Ordering};

/// The primitive statistics holder: a second-resolution metric for
/// real-time decisions, a minute-resolution metric for totals and display,
/// and a live thread counter.
#[derive(Debug)]
pub struct StatisticNode {
    second: SlidingMetric,
    minute: SlidingMetric,
    cur_thread_num: AtomicI64,
}

impl StatisticNode {
    pub fn new() -> Self {
        Self {
            second: SlidingMetric::with_occupancy(SECOND_SAMPLE_COUNT, SECOND_WINDOW_MS),
            minute: SlidingMetric::new(MINUTE_SAMPLE_COUNT, MINUTE_WINDOW_MS),
            cur_thread_num: AtomicI64::new(0),
        }
    }

    pub fn add_pass(&self, count: u64) {
        let now = now_ms();
        self.second.add(now, MetricEvent::Pass, count);
        self.minute.add(now, MetricEvent::Pass, count);
    }

    pub fn add_rt_and_success(&self, rt_ms: u64, success_count: u64) {
        let now = now_ms();
        self.second.add(now, MetricEvent::Success, success_count);
        self.second.add_rt(now, rt_ms);
        self.minute.add(now, MetricEvent::Success, success_count);
        self.minute.add_rt(now, rt_ms);
    }

    pub fn add_block(&self, count: u64) {
        let now = now_ms();
        self.second.add(now, MetricEvent::Block, count);
        self.minute.add(now, MetricEvent::Block, count);
    }

    pub fn add_exception(&self, count: u64) {
        let now = now_ms();
        self.second.add(now, MetricEvent::Exception, count);
        self.minute.add(now, MetricEvent::Exception, count);
    }

    /// Settle a borrow granted by the priority-occupy path: the admission
    /// is counted toward totals as an occupied pass.
    pub fn add_occupied_pass(&self, count: u64) {
        let now = now_ms();
        self.minute.add(now, MetricEvent::OccupiedPass, count);
        self.minute.add(now, MetricEvent::Pass, count);
    }

    pub fn add_waiting(&self, future_ms: u64, count: u64) {
        self.second.add_waiting(future_ms, count);
    }

    pub fn inc_thread(&self) {
        self.cur_thread_num.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_thread(&self) {
        self.cur_thread_num.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn cur_thread_num(&self) -> i64 {
        self.cur_thread_num.load(Ordering::Relaxed)
    }

    pub fn pass_qps(&self) -> f64 {
        self.second.rate(now_ms(), MetricEvent::Pass)
    }

    pub fn block_qps(&self) -> f64 {
        self.second.rate(now_ms(), MetricEvent::Block)
    }

    pub fn total_qps(&self) -> f64 {
        self.pass_qps() + self.block_qps()
    }

    pub fn success_qps(&self) -> f64 {
        self.second.rate(now_ms(), MetricEvent::Success)
    }

    pub fn exception_qps(&self) -> f64 {
        self.second.rate(now_ms(), MetricEvent::Exception)
    }

    pub fn occupied_pass_qps(&self) -> f64 {
        self.minute.rate(now_ms(), MetricEvent::OccupiedPass)
    }

    /// Average response time of successful calls in the live second window.
    pub fn avg_rt(&self) -> f64 {
        let now = now_ms();
        let success = self.second.sum(now, MetricEvent::Success);
        if success == 0 {
            return 0.0;
        }
        self.second.sum(now, MetricEvent::Rt) as f64 / success as f64
    }

    pub fn min_rt(&self) -> u64 {
        self.second.min_rt(now_ms())
    }

    /// Peak single-bucket success extrapolated to a per-second figure.
    pub fn max_success_qps(&self) -> f64 {
        self.second.max_window_success(now_ms()) as f64 * self.second.sample_count() as f64
    }

    pub fn total_pass(&self) -> u64 {
        self.minute.sum(now_ms(), MetricEvent::Pass)
    }

    pub fn total_block(&self) -> u64 {
        self.minute.sum(now_ms(), MetricEvent::Block)
    }

    pub fn total_request(&self) -> u64 {
        let now = now_ms();
        self.minute.sum(now, MetricEvent::Pass) + self.minute.sum(now, MetricEvent::Block)
    }

    pub fn total_success(&self) -> u64 {
        self.minute.sum(now_ms(), MetricEvent::Success)
    }

    pub fn total_exception(&self) -> u64 {
        self.minute.sum(now_ms(), MetricEvent::Exception)
    }

    /// Pass count of the lapsed minute-metric window, i.e. last second's QPS.
    pub fn previous_pass_qps(&self) -> f64 {
        self.minute.previous_window_sum(now_ms(), MetricEvent::Pass) as f64
    }

    pub fn previous_block_qps(&self) -> f64 {
        self.minute.previous_window_sum(now_ms(), MetricEvent::Block) as f64
    }

    /// Borrowed quota still waiting on future windows.
    pub fn waiting(&self) -> u64 {
        self.second.waiting(now_ms())
    }

    /// How long a prioritized request must wait for `acquire` tokens to fit
    /// under `threshold`, scanning window by window. Returns the occupy
    /// timeout when no future window inside the deadline has room.
    pub fn try_occupy_next(&self, now: u64, acquire: u64, threshold: f64) -> u64 {
        let timeout = occupy_timeout_ms();
        let max_count = threshold * self.second.interval_sec();
        let borrowed = self.second.waiting(now) as f64;
        if borrowed >= max_count {
            return timeout;
        }

        let window_ms = self.second.window_ms();
        let interval_ms = self.second.interval_ms() as i64;
        // The pass total may lag under contention; an over-borrow here is a
        // statistical error the windows absorb, not a correctness issue.
        let mut current_pass = self.second.sum(now, MetricEvent::Pass) as f64;
        let mut earliest = (now - now % window_ms + window_ms) as i64 - interval_ms;
        let mut idx: u64 = 0;
        while earliest < now as i64 {
            let wait = idx * window_ms + window_ms - now % window_ms;
            if wait >= timeout {
                break;
            }
            let expiring = if earliest >= 0 {
                self.second.window_sum(earliest as u64, MetricEvent::Pass) as f64
            } else {
                0.0
            };
            if current_pass + borrowed + acquire as f64 - expiring <= max_count {
                return wait;
            }
            earliest += window_ms as i64;
            current_pass -= expiring;
            idx += 1;
        }
        timeout
    }

    /// Per-second rows from the minute metric, oldest first.
    pub fn metric_samples(&self) -> Vec<MetricSample> {
        self.minute.samples(now_ms())
    }
}

impl Default for StatisticNode {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_counts_flow_into_both_resolutions() {
        let node = StatisticNode::new();
        node.add_pass(3);
        assert!(node.pass_qps() >= 3.0);
        assert_eq!(node.total_pass(), 3);
    }

    #[test]
    fn avg_rt_divides_by_successes() {
        let node = StatisticNode::new();
        node.add_rt_and_success(30, 1);
        node.add_rt_and_success(10, 1);
        assert!((node.avg_rt() - 20.0).abs() < f64::EPSILON);
        assert_eq!(node.min_rt(), 10);
    }

    #[test]
    fn thread_counter_tracks_live_calls() {
        let node = StatisticNode::new();
        node.inc_thread();
        node.inc_thread();
        node.dec_thread();
        assert_eq!(node.cur_thread_num(), 1);
    }

    #[test]
    fn occupy_scan_grants_the_nearest_free_window() {
        let node = StatisticNode::new();
        // An odd timestamp keeps the probe off a window boundary, where
        // the wait would round up to a full bucket.
        let now = now_ms() | 1;
        // Nothing passed yet: the very next window has room.
        let wait = node.try_occupy_next(now, 1, 10.0);
        assert!(wait < occupy_timeout_ms());
    }

    #[test]
    fn saturated_borrow_hits_the_timeout() {
        let node = StatisticNode::new();
        let now = now_ms();
        // Borrow the whole threshold ahead of time.
        node.add_waiting(now + SECOND_WINDOW_MS, 10);
        assert_eq!(node.try_occupy_next(now, 1, 10.0), occupy_timeout_ms());
    }
}
