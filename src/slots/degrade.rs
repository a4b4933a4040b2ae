//! Circuit breaking: cut a resource off while it is unstable, re-close
//! after a recovery window.

use crate::context::Context;
use crate::node::DefaultNode;
use crate::resource::ResourceId;
use crate::slots::cluster_builder;
use crate::slots::{Next, ProcessorSlot, SlotResult, SlotSignal};
use crate::timer;
use crate::value::ParamValue;
use crate::error::BlockError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Consecutive over-threshold RT observations tolerated before tripping,
/// and the minimum traffic floor for the exception-ratio grade.
const RT_EXCEED_LIMIT: u64 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradeGrade {
    /// Trip when the average RT stays at or above `count` (ms).
    #[default]
    AvgRt,
    /// Trip when exception QPS / success QPS reaches `count`.
    ExceptionRatio,
    /// Trip when the minute-window exception total reaches `count`.
    ExceptionCount,
}

fn default_limit_origin() -> String {
    super::flow::LIMIT_ORIGIN_DEFAULT.to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradeRule {
    pub resource: String,
    #[serde(default = "default_limit_origin")]
    pub limit_origin: String,
    #[serde(default)]
    pub grade: DegradeGrade,
    pub count: f64,
    /// How long the breaker stays open once tripped.
    pub time_window_sec: u32,
}

impl DegradeRule {
    pub fn avg_rt(resource: impl Into<String>, count: f64, time_window_sec: u32) -> Self {
        Self {
            resource: resource.into(),
            limit_origin: default_limit_origin(),
            grade: DegradeGrade::AvgRt,
            count,
            time_window_sec,
        }
    }

    pub fn exception_ratio(resource: impl Into<String>, ratio: f64, time_window_sec: u32) -> Self {
        Self {
            resource: resource.into(),
            limit_origin: default_limit_origin(),
            grade: DegradeGrade::ExceptionRatio,
            count: ratio,
            time_window_sec,
        }
    }

    pub fn exception_count(resource: impl Into<String>, count: f64, time_window_sec: u32) -> Self {
        Self {
            resource: resource.into(),
            limit_origin: default_limit_origin(),
            grade: DegradeGrade::ExceptionCount,
            count,
            time_window_sec,
        }
    }
}

/// A loaded rule plus its breaker state.
pub(crate) struct ActiveDegradeRule {
    pub(crate) rule: DegradeRule,
    cut: AtomicBool,
    rt_probation: AtomicU64,
}

impl ActiveDegradeRule {
    pub(crate) fn new(rule: DegradeRule) -> Self {
        Self {
            rule,
            cut: AtomicBool::new(false),
            rt_probation: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.cut.load(Ordering::Acquire)
    }

    pub(crate) fn can_pass(self: &Arc<Self>) -> bool {
        if self.is_open() {
            return false;
        }
        let Some(cluster) = cluster_builder::cluster_node(&self.rule.resource) else {
            return true;
        };
        let stats = cluster.stats();

        match self.rule.grade {
            DegradeGrade::AvgRt => {
                let rt = stats.avg_rt();
                if rt < self.rule.count {
                    self.rt_probation.store(0, Ordering::Release);
                    return true;
                }
                // Tolerate a burst: only a run of slow observations trips.
                if self.rt_probation.fetch_add(1, Ordering::AcqRel) + 1 < RT_EXCEED_LIMIT {
                    return true;
                }
            }
            DegradeGrade::ExceptionRatio => {
                let exception = stats.exception_qps();
                let success = stats.success_qps();
                let total = stats.total_qps();
                if total < RT_EXCEED_LIMIT as f64 {
                    return true;
                }
                let real_success = success - exception;
                if real_success <= 0.0 && exception < RT_EXCEED_LIMIT as f64 {
                    return true;
                }
                if exception / success < self.rule.count {
                    return true;
                }
            }
            DegradeGrade::ExceptionCount => {
                if (stats.total_exception() as f64) < self.rule.count {
                    return true;
                }
            }
        }

        self.trip();
        false
    }

    /// One CAS trips the breaker; re-trips during the open window are
    /// no-ops, so exactly one reset is scheduled per opening.
    fn trip(self: &Arc<Self>) {
        if self
            .cut
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::warn!(
                "circuit breaker opened for `{}` ({}s window)",
                self.rule.resource,
                self.rule.time_window_sec
            );
            let breaker = Arc::clone(self);
            timer::schedule_after(self.rule.time_window_sec as u64 * 1000, move || {
                breaker.rt_probation.store(0, Ordering::Release);
                breaker.cut.store(false, Ordering::Release);
                log::info!("circuit breaker closed for `{}`", breaker.rule.resource);
            });
        }
    }
}

static RULES: OnceLock<RwLock<Arc<HashMap<String, Arc<Vec<Arc<ActiveDegradeRule>>>>>>> =
    OnceLock::new();

fn rules() -> &'static RwLock<Arc<HashMap<String, Arc<Vec<Arc<ActiveDegradeRule>>>>>> {
    RULES.get_or_init(|| RwLock::new(Arc::new(HashMap::new())))
}

/// Replace the active degrade rule set. Breaker state restarts closed.
pub fn load_degrade_rules(new_rules: Vec<DegradeRule>) {
    let mut grouped: HashMap<String, Vec<Arc<ActiveDegradeRule>>> = HashMap::new();
    for rule in new_rules {
        if rule.count < 0.0 {
            log::warn!(
                "ignoring degrade rule with negative count for `{}`",
                rule.resource
            );
            continue;
        }
        grouped
            .entry(rule.resource.clone())
            .or_default()
            .push(Arc::new(ActiveDegradeRule::new(rule)));
    }
    let snapshot: HashMap<String, Arc<Vec<Arc<ActiveDegradeRule>>>> = grouped
        .into_iter()
        .map(|(resource, list)| (resource, Arc::new(list)))
        .collect();
    *rules().write() = Arc::new(snapshot);
}

pub fn degrade_rules_of_resource(resource_name: &str) -> Vec<DegradeRule> {
    rules()
        .read()
        .get(resource_name)
        .map(|list| list.iter().map(|active| active.rule.clone()).collect())
        .unwrap_or_default()
}

pub(crate) struct DegradeSlot;

impl ProcessorSlot for DegradeSlot {
    fn entry(
        &self,
        ctx: &Context,
        resource: &ResourceId,
        node: Option<Arc<DefaultNode>>,
        count: u32,
        prioritized: bool,
        args: &[ParamValue],
        next: Next<'_>,
    ) -> SlotResult {
        if let Some(list) = rules().read().get(resource.name()).cloned() {
            for active in list.iter() {
                if !active.can_pass() {
                    return Err(SlotSignal::Block(BlockError::Degrade {
                        resource: resource.name().to_owned(),
                        rule: active.rule.clone(),
                    }));
                }
            }
        }
        next.entry(ctx, resource, node, count, prioritized, args)
    }
}
