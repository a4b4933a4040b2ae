//! Shaping controllers: how a flow rule turns "over threshold" into
//! reject, queue, or warm-up behaviour.

use crate::clock::{now_ms, sleep_ms};
use crate::config::{occupy_timeout_ms, DEFAULT_COLD_FACTOR};
use crate::node::StatisticNode;
use crate::slots::flow::{ControlBehavior, FlowGrade, FlowRule};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Verdict of one controller check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControllerVerdict {
    Pass,
    Block,
    /// The prioritized request borrowed a future window and already slept.
    PriorityWait { wait_ms: u64 },
}

/// Immediate reject, with the priority-occupy escape hatch for QPS rules.
#[derive(Debug)]
pub(crate) struct RejectController {
    count: f64,
    grade: FlowGrade,
}

impl RejectController {
    pub(crate) fn new(count: f64, grade: FlowGrade) -> Self {
        Self { count, grade }
    }

    pub(crate) fn can_pass(
        &self,
        node: &StatisticNode,
        acquire: u32,
        prioritized: bool,
    ) -> ControllerVerdict {
        let used = match self.grade {
            FlowGrade::Thread => node.cur_thread_num() as f64,
            FlowGrade::Qps => node.pass_qps() as i64 as f64,
        };
        if used + acquire as f64 <= self.count {
            return ControllerVerdict::Pass;
        }
        if prioritized && self.grade == FlowGrade::Qps {
            let now = now_ms();
            let wait_ms = node.try_occupy_next(now, acquire as u64, self.count);
            if wait_ms < occupy_timeout_ms() {
                node.add_waiting(now + wait_ms, acquire as u64);
                node.add_occupied_pass(acquire as u64);
                sleep_ms(wait_ms);
                return ControllerVerdict::PriorityWait { wait_ms };
            }
        }
        ControllerVerdict::Block
    }
}

/// Leaky bucket: spread admissions `1000/count` ms apart, queueing up to
/// `max_queueing_ms` and rejecting beyond that.
#[derive(Debug)]
pub(crate) struct ThrottleController {
    count: f64,
    max_queueing_ms: i64,
    latest_passed_ms: AtomicI64,
}

impl ThrottleController {
    pub(crate) fn new(count: f64, max_queueing_ms: u64) -> Self {
        Self {
            count,
            max_queueing_ms: max_queueing_ms as i64,
            latest_passed_ms: AtomicI64::new(-1),
        }
    }

    pub(crate) fn can_pass(&self, acquire: u32) -> bool {
        self.can_pass_at_rate(acquire, self.count)
    }

    /// The warm-up + throttle combination feeds the moment's allowed rate
    /// in here instead of the static threshold.
    fn can_pass_at_rate(&self, acquire: u32, rate: f64) -> bool {
        if acquire == 0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        let now = now_ms() as i64;
        let cost_ms = ((acquire as f64 / rate) * 1000.0).round() as i64;
        // First admission ever: nothing to pace against.
        if self
            .latest_passed_ms
            .compare_exchange(-1, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }
        let expected = cost_ms + self.latest_passed_ms.load(Ordering::Acquire);
        if expected <= now {
            self.latest_passed_ms.store(now, Ordering::Release);
            return true;
        }

        let wait = cost_ms + self.latest_passed_ms.load(Ordering::Acquire) - now_ms() as i64;
        if wait > self.max_queueing_ms {
            return false;
        }
        // Claim a departure instant; concurrent claims stack strictly after
        // one another, so their sleeps never collide.
        let scheduled = self.latest_passed_ms.fetch_add(cost_ms, Ordering::AcqRel) + cost_ms;
        let wait = scheduled - now_ms() as i64;
        if wait > self.max_queueing_ms {
            // The queue grew past the cap while claiming: give the slot back.
            self.latest_passed_ms.fetch_add(-cost_ms, Ordering::AcqRel);
            return false;
        }
        if wait > 0 {
            sleep_ms(wait as u64);
        }
        true
    }
}

/// Token-bucket warm-up curve shared by the two warm-up behaviours.
///
/// The bucket starts full (coldest). While `stored >= warning_token` the
/// permitted QPS follows `1/((stored-warning)·slope + 1/count)`, rising
/// from `count/cold_factor` to `count` as load drains the bucket over the
/// warm-up period; below the warning line the stable rate applies.
#[derive(Debug)]
pub(crate) struct WarmUpCore {
    count: f64,
    cold_factor: u32,
    warning_token: u64,
    max_token: u64,
    slope: f64,
    stored_tokens: AtomicU64,
    last_filled_ms: AtomicU64,
}

impl WarmUpCore {
    pub(crate) fn new(count: f64, warm_up_period_sec: u32, cold_factor: u32) -> Self {
        // A factor of 1 would make the curve flat; clamp to the first
        // meaningful value.
        let cold_factor = cold_factor.max(2);
        let warning_token =
            ((warm_up_period_sec as f64 * count) / (cold_factor as f64 - 1.0)) as u64;
        let max_token = (warning_token
            + (2.0 * warm_up_period_sec as f64 * count / (1.0 + cold_factor as f64)) as u64)
            .max(warning_token + 1);
        let slope = (cold_factor as f64 - 1.0) / count / (max_token - warning_token) as f64;
        Self {
            count,
            cold_factor,
            warning_token,
            max_token,
            slope,
            stored_tokens: AtomicU64::new(max_token),
            last_filled_ms: AtomicU64::new(0),
        }
    }

    /// Refill from elapsed time, then drain the previous window's
    /// throughput. Runs at most once per second-aligned tick.
    pub(crate) fn sync(&self, previous_pass_qps: u64) {
        let now = now_ms();
        let now = now - now % 1000;
        let last = self.last_filled_ms.load(Ordering::Acquire);
        if now <= last {
            return;
        }
        let old = self.stored_tokens.load(Ordering::Acquire);
        let refilled = self.cool_down(now, last, old, previous_pass_qps);
        if self
            .stored_tokens
            .compare_exchange(old, refilled, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self
                .stored_tokens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                    Some(tokens.saturating_sub(previous_pass_qps))
                });
            self.last_filled_ms.store(now, Ordering::Release);
        }
    }

    fn cool_down(&self, now: u64, last: u64, old: u64, previous_pass_qps: u64) -> u64 {
        let refill = ((now - last) as f64 * self.count / 1000.0) as u64;
        let cold_rate = self.count / self.cold_factor as f64;
        let refilled = if old < self.warning_token {
            old + refill
        } else if old > self.warning_token && (previous_pass_qps as f64) < cold_rate {
            // Still colder than the system can have been serving: keep
            // topping up so an idle system stays cold.
            old + refill
        } else {
            old
        };
        refilled.min(self.max_token)
    }

    pub(crate) fn allowed_qps(&self) -> f64 {
        let stored = self.stored_tokens.load(Ordering::Acquire);
        if stored >= self.warning_token {
            let above = (stored - self.warning_token) as f64;
            1.0 / (above * self.slope + 1.0 / self.count)
        } else {
            self.count
        }
    }

    #[cfg(test)]
    pub(crate) fn stored_tokens(&self) -> u64 {
        self.stored_tokens.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn warning_token(&self) -> u64 {
        self.warning_token
    }
}

#[derive(Debug)]
pub(crate) struct WarmUpController {
    core: WarmUpCore,
}

impl WarmUpController {
    pub(crate) fn new(count: f64, warm_up_period_sec: u32, cold_factor: u32) -> Self {
        Self {
            core: WarmUpCore::new(count, warm_up_period_sec, cold_factor),
        }
    }

    pub(crate) fn can_pass(&self, node: &StatisticNode, acquire: u32) -> bool {
        let pass_qps = node.pass_qps() as i64 as f64;
        self.core.sync(node.previous_pass_qps() as u64);
        pass_qps + acquire as f64 <= self.core.allowed_qps()
    }
}

/// Warm-up curve feeding a leaky bucket: admissions space out at the
/// moment's permitted rate instead of the stable threshold.
#[derive(Debug)]
pub(crate) struct WarmUpThrottleController {
    core: WarmUpCore,
    throttle: ThrottleController,
}

impl WarmUpThrottleController {
    pub(crate) fn new(
        count: f64,
        warm_up_period_sec: u32,
        cold_factor: u32,
        max_queueing_ms: u64,
    ) -> Self {
        Self {
            core: WarmUpCore::new(count, warm_up_period_sec, cold_factor),
            throttle: ThrottleController::new(count, max_queueing_ms),
        }
    }

    pub(crate) fn can_pass(&self, node: &StatisticNode, acquire: u32) -> bool {
        self.core.sync(node.previous_pass_qps() as u64);
        self.throttle.can_pass_at_rate(acquire, self.core.allowed_qps())
    }
}

/// The four behaviours as one variant, built once per loaded rule.
#[derive(Debug)]
pub(crate) enum TrafficController {
    Reject(RejectController),
    Throttle(ThrottleController),
    WarmUp(WarmUpController),
    WarmUpThrottle(WarmUpThrottleController),
}

impl TrafficController {
    pub(crate) fn for_rule(rule: &FlowRule) -> Self {
        // Queueing and warm-up only make sense for QPS thresholds; thread
        // rules always reject immediately.
        if rule.grade == FlowGrade::Thread {
            return Self::Reject(RejectController::new(rule.count, rule.grade));
        }
        match rule.control_behavior {
            ControlBehavior::Reject => Self::Reject(RejectController::new(rule.count, rule.grade)),
            ControlBehavior::Throttle => Self::Throttle(ThrottleController::new(
                rule.count,
                rule.max_queueing_time_ms as u64,
            )),
            ControlBehavior::WarmUp => Self::WarmUp(WarmUpController::new(
                rule.count,
                rule.warm_up_period_sec,
                DEFAULT_COLD_FACTOR,
            )),
            ControlBehavior::WarmUpThrottle => Self::WarmUpThrottle(WarmUpThrottleController::new(
                rule.count,
                rule.warm_up_period_sec,
                DEFAULT_COLD_FACTOR,
                rule.max_queueing_time_ms as u64,
            )),
        }
    }

    pub(crate) fn can_pass(
        &self,
        node: &StatisticNode,
        acquire: u32,
        prioritized: bool,
    ) -> ControllerVerdict {
        match self {
            Self::Reject(c) => c.can_pass(node, acquire, prioritized),
            Self::Throttle(c) => {
                if c.can_pass(acquire) {
                    ControllerVerdict::Pass
                } else {
                    ControllerVerdict::Block
                }
            }
            Self::WarmUp(c) => {
                if c.can_pass(node, acquire) {
                    ControllerVerdict::Pass
                } else {
                    ControllerVerdict::Block
                }
            }
            Self::WarmUpThrottle(c) => {
                if c.can_pass(node, acquire) {
                    ControllerVerdict::Pass
                } else {
                    ControllerVerdict::Block
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_controller_counts_threads() {
        let node = StatisticNode::new();
        let controller = RejectController::new(2.0, FlowGrade::Thread);
        node.inc_thread();
        node.inc_thread();
        assert_eq!(
            controller.can_pass(&node, 1, false),
            ControllerVerdict::Block
        );
        node.dec_thread();
        assert_eq!(controller.can_pass(&node, 1, false), ControllerVerdict::Pass);
    }

    #[test]
    fn throttle_spreads_admissions() {
        let controller = ThrottleController::new(10.0, 1000);
        let start = now_ms();
        for _ in 0..4 {
            assert!(controller.can_pass(1));
        }
        // Four admissions at 10/s cost at least ~300 ms of queueing.
        assert!(now_ms() - start >= 250);
    }

    #[test]
    fn throttle_rejects_past_the_queue_cap() {
        let controller = ThrottleController::new(1.0, 100);
        assert!(controller.can_pass(1));
        let before = controller.latest_passed_ms.load(Ordering::Acquire);
        // The next slot is a second away, far past the 100 ms cap.
        assert!(!controller.can_pass(1));
        // A rejected request must not advance the schedule.
        assert_eq!(before, controller.latest_passed_ms.load(Ordering::Acquire));
    }

    #[test]
    fn warm_up_starts_at_the_cold_rate() {
        let node = StatisticNode::new();
        let controller = WarmUpController::new(9.0, 10, 3);
        // Full bucket: permitted QPS is count/cold_factor = 3.
        assert!(controller.can_pass(&node, 3));
        assert!(!controller.can_pass(&node, 4));
    }

    #[test]
    fn warm_up_curve_reaches_stable_rate_when_drained() {
        let core = WarmUpCore::new(10.0, 10, 3);
        assert!(core.stored_tokens() > core.warning_token());
        assert!((core.allowed_qps() - 10.0 / 3.0).abs() < 0.5);

        // Drain below the warning line by hand: stable rate applies.
        core.stored_tokens.store(0, Ordering::Release);
        assert!((core.allowed_qps() - 10.0).abs() < f64::EPSILON);
    }
}
