//! Per-value admission checks.

use crate::clock::{now_ms, sleep_ms};
use crate::cluster;
use crate::error::BlockError;
use crate::resource::ResourceId;
use crate::slots::flow::FlowGrade;
use crate::slots::param_flow::{
    self, metric, ActiveParamRule, ParamControlBehavior,
};
use crate::slots::{SlotResult, SlotSignal};
use crate::value::ParamValue;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub(crate) fn check_param_flow(
    resource: &ResourceId,
    count: u32,
    args: &[ParamValue],
) -> SlotResult {
    if args.is_empty() {
        return Ok(());
    }
    let Some(rules) = param_flow::active_rules_of(resource.name()) else {
        return Ok(());
    };
    for active in rules.iter() {
        // A negative index resolves against this call's argument count; an
        // index that lands outside the list disables the rule for the call
        // without touching rule state.
        let Some(index) = resolve_index(active.rule.param_idx, args.len()) else {
            continue;
        };
        let value = &args[index];
        if value.is_null() {
            continue;
        }
        if active.rule.grade == FlowGrade::Thread {
            metric::ensure_thread_map(resource.name(), index);
        }
        if !pass_check(resource, active, count, index, value) {
            return Err(SlotSignal::Block(BlockError::ParamFlow {
                resource: resource.name().to_owned(),
                rule: active.rule.clone(),
                param: Some(value.clone()),
            }));
        }
    }
    Ok(())
}

pub(crate) fn resolve_index(param_idx: i32, argc: usize) -> Option<usize> {
    if param_idx >= 0 {
        let index = param_idx as usize;
        (index < argc).then_some(index)
    } else {
        let index = argc as i64 + param_idx as i64;
        (0..argc as i64).contains(&index).then(|| index as usize)
    }
}

fn pass_check(
    resource: &ResourceId,
    active: &ActiveParamRule,
    count: u32,
    index: usize,
    value: &ParamValue,
) -> bool {
    if active.rule.cluster_mode && active.rule.grade == FlowGrade::Qps {
        return pass_cluster_check(resource, active, count, index, value);
    }
    pass_local_check(resource, active, count, index, value)
}

fn pass_local_check(
    resource: &ResourceId,
    active: &ActiveParamRule,
    count: u32,
    index: usize,
    value: &ParamValue,
) -> bool {
    for element in metric::expand(value) {
        if !pass_single_value(resource, active, count, index, element) {
            return false;
        }
    }
    true
}

fn pass_single_value(
    resource: &ResourceId,
    active: &ActiveParamRule,
    count: u32,
    index: usize,
    value: &ParamValue,
) -> bool {
    match active.rule.grade {
        FlowGrade::Qps => match active.rule.control_behavior {
            ParamControlBehavior::Reject => pass_default_check(active, count, value),
            ParamControlBehavior::Throttle => pass_throttle_check(active, count, value),
        },
        FlowGrade::Thread => {
            let threshold = active.threshold_for(value) as i64;
            let live = metric::metric_of(resource.name())
                .map(|m| m.thread_count(index, value))
                .unwrap_or(0);
            live + 1 <= threshold
        }
    }
}

/// Token bucket per value: capacity `threshold + burst`, refilled by
/// elapsed full windows, drained by CAS.
pub(crate) fn pass_default_check(
    active: &ActiveParamRule,
    count: u32,
    value: &ParamValue,
) -> bool {
    let threshold = active.threshold_for(value) as i64;
    if threshold == 0 {
        return false;
    }
    let max_count = threshold + active.rule.burst_count as i64;
    let acquire = count as i64;
    if acquire > max_count {
        return false;
    }
    let window_ms = active.rule.duration_sec * 1000;

    loop {
        let now = now_ms();
        let (last_fill, created) = active
            .time_counters
            .get_or_insert_with(value, || AtomicU64::new(now));
        if created {
            // First sight of this value: fill the bucket and take our share.
            active
                .token_counters
                .get_or_insert_with(value, || AtomicI64::new(max_count - acquire));
            return true;
        }

        let pass_time = now.saturating_sub(last_fill.load(Ordering::Acquire));
        if pass_time > window_ms {
            let (tokens, created) = active
                .token_counters
                .get_or_insert_with(value, || AtomicI64::new(max_count - acquire));
            if created {
                last_fill.store(now, Ordering::Release);
                return true;
            }
            let rest = tokens.load(Ordering::Acquire);
            let refill = (pass_time as i64).saturating_mul(threshold) / window_ms as i64;
            let replenished = if refill + rest > max_count {
                max_count - acquire
            } else {
                rest + refill - acquire
            };
            if replenished < 0 {
                return false;
            }
            if tokens
                .compare_exchange(rest, replenished, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                last_fill.store(now, Ordering::Release);
                return true;
            }
            std::thread::yield_now();
        } else {
            if let Some(tokens) = active.token_counters.get(value) {
                let rest = tokens.load(Ordering::Acquire);
                if rest - acquire >= 0 {
                    if tokens
                        .compare_exchange(rest, rest - acquire, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                } else {
                    return false;
                }
            }
            std::thread::yield_now();
        }
    }
}

/// Leaky bucket per value, spreading admissions `duration/threshold`
/// apart.
fn pass_throttle_check(active: &ActiveParamRule, count: u32, value: &ParamValue) -> bool {
    let threshold = active.threshold_for(value);
    if threshold == 0 {
        return false;
    }
    let cost_ms =
        ((1000.0 * count as f64 * active.rule.duration_sec as f64) / threshold as f64).round()
            as u64;

    loop {
        let now = now_ms();
        let (recorder, created) = active
            .time_counters
            .get_or_insert_with(value, || AtomicU64::new(now));
        if created {
            return true;
        }
        let last_pass = recorder.load(Ordering::Acquire);
        let expected = last_pass + cost_ms;
        if expected <= now || expected - now < active.rule.max_queueing_time_ms as u64 {
            if recorder
                .compare_exchange(last_pass, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let wait = expected.saturating_sub(now);
                if wait > 0 {
                    recorder.store(expected, Ordering::Release);
                    sleep_ms(wait);
                }
                return true;
            }
            std::thread::yield_now();
        } else {
            return false;
        }
    }
}

fn pass_cluster_check(
    resource: &ResourceId,
    active: &ActiveParamRule,
    count: u32,
    index: usize,
    value: &ParamValue,
) -> bool {
    let Some(config) = active.rule.cluster_config.as_ref() else {
        return fallback_or_pass(resource, active, count, index, value);
    };
    let Some(service) = cluster::pick_token_service() else {
        return fallback_or_pass(resource, active, count, index, value);
    };
    let params: Vec<ParamValue> = metric::expand(value).into_iter().cloned().collect();
    match service.request_param_token(config.flow_id, count, &params) {
        Ok(result) => match result.status {
            cluster::TokenStatus::Ok => true,
            cluster::TokenStatus::Blocked => false,
            _ => fallback_or_pass(resource, active, count, index, value),
        },
        Err(err) => {
            log::warn!(
                "cluster param token request failed for flow {}: {err}",
                config.flow_id
            );
            fallback_or_pass(resource, active, count, index, value)
        }
    }
}

fn fallback_or_pass(
    resource: &ResourceId,
    active: &ActiveParamRule,
    count: u32,
    index: usize,
    value: &ParamValue,
) -> bool {
    let fallback = active
        .rule
        .cluster_config
        .as_ref()
        .map(|config| config.fallback_to_local_when_fail)
        .unwrap_or(false);
    if fallback {
        pass_local_check(resource, active, count, index, value)
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::param_flow::ParamFlowRule;

    // Tests build the active form directly so the global registry stays
    // untouched.
    fn active(rule: ParamFlowRule) -> ActiveParamRule {
        ActiveParamRule::new(rule)
    }

    #[test]
    fn index_resolution_handles_negative_offsets() {
        assert_eq!(resolve_index(0, 3), Some(0));
        assert_eq!(resolve_index(2, 3), Some(2));
        assert_eq!(resolve_index(3, 3), None);
        assert_eq!(resolve_index(-1, 3), Some(2));
        assert_eq!(resolve_index(-3, 3), Some(0));
        assert_eq!(resolve_index(-4, 3), None);
    }

    #[test]
    fn token_bucket_caps_a_single_value() {
        let active = active(ParamFlowRule::qps("param.unit.bucket", 0, 2.0));
        let value = ParamValue::from("hot");
        assert!(pass_default_check(&active, 1, &value));
        assert!(pass_default_check(&active, 1, &value));
        assert!(!pass_default_check(&active, 1, &value));
        // A different value has its own bucket.
        assert!(pass_default_check(&active, 1, &ParamValue::from("cold")));
    }

    #[test]
    fn burst_count_extends_capacity() {
        let active = active(ParamFlowRule::qps("param.unit.burst", 0, 1.0).with_burst_count(2));
        let value = ParamValue::from("k");
        for _ in 0..3 {
            assert!(pass_default_check(&active, 1, &value));
        }
        assert!(!pass_default_check(&active, 1, &value));
    }

    #[test]
    fn item_overrides_take_precedence() {
        let rule = ParamFlowRule::qps("param.unit.items", 0, 1.0)
            .with_item(ParamValue::from("vip"), 3);
        let active = active(rule);
        let vip = ParamValue::from("vip");
        for _ in 0..3 {
            assert!(pass_default_check(&active, 1, &vip));
        }
        assert!(!pass_default_check(&active, 1, &vip));

        let plain = ParamValue::from("plain");
        assert!(pass_default_check(&active, 1, &plain));
        assert!(!pass_default_check(&active, 1, &plain));
    }

    #[test]
    fn zero_threshold_rejects_outright() {
        let active = active(ParamFlowRule::qps("param.unit.zero", 0, 0.0));
        assert!(!pass_default_check(&active, 1, &ParamValue::from("any")));
    }
}
