//! Hot-key limits: per-value counters over a call argument.

mod checker;
pub(crate) mod metric;

use crate::cluster::ClusterFlowConfig;
use crate::context::Context;
use crate::node::DefaultNode;
use crate::resource::ResourceId;
use crate::slots::flow::FlowGrade;
use crate::slots::statistic::{self, StatisticCallback};
use crate::slots::{Next, ProcessorSlot, SlotResult};
use crate::stat::LruCounterMap;
use crate::value::ParamValue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64};
use std::sync::{Arc, Once, OnceLock};

/// Per-value counter capacity scales with the rule window, bounded hard.
const BASE_PARAM_MAX_CAPACITY: u64 = 4000;
const TOTAL_MAX_CAPACITY: u64 = 200_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamControlBehavior {
    #[default]
    Reject,
    /// Per-value leaky bucket.
    Throttle,
}

/// Threshold override for one specific argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamFlowItem {
    pub object: ParamValue,
    pub threshold: u32,
}

fn default_limit_origin() -> String {
    super::flow::LIMIT_ORIGIN_DEFAULT.to_owned()
}

fn default_duration_sec() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamFlowRule {
    pub resource: String,
    #[serde(default = "default_limit_origin")]
    pub limit_origin: String,
    #[serde(default)]
    pub grade: FlowGrade,
    /// Which call argument carries the hot key. Negative values resolve
    /// from the end of the argument list, per call.
    pub param_idx: i32,
    pub count: f64,
    #[serde(default)]
    pub control_behavior: ParamControlBehavior,
    #[serde(default = "default_duration_sec")]
    pub duration_sec: u64,
    /// Extra tokens tolerated above the steady rate.
    #[serde(default)]
    pub burst_count: u32,
    #[serde(default)]
    pub max_queueing_time_ms: u32,
    #[serde(default)]
    pub param_flow_item_list: Vec<ParamFlowItem>,
    #[serde(default)]
    pub cluster_mode: bool,
    #[serde(default)]
    pub cluster_config: Option<ClusterFlowConfig>,
}

impl ParamFlowRule {
    pub fn qps(resource: impl Into<String>, param_idx: i32, count: f64) -> Self {
        Self {
            resource: resource.into(),
            limit_origin: default_limit_origin(),
            grade: FlowGrade::Qps,
            param_idx,
            count,
            control_behavior: ParamControlBehavior::default(),
            duration_sec: default_duration_sec(),
            burst_count: 0,
            max_queueing_time_ms: 0,
            param_flow_item_list: Vec::new(),
            cluster_mode: false,
            cluster_config: None,
        }
    }

    pub fn with_grade(mut self, grade: FlowGrade) -> Self {
        self.grade = grade;
        self
    }

    pub fn with_behavior(mut self, behavior: ParamControlBehavior) -> Self {
        self.control_behavior = behavior;
        self
    }

    pub fn with_duration_sec(mut self, duration_sec: u64) -> Self {
        self.duration_sec = duration_sec.max(1);
        self
    }

    pub fn with_burst_count(mut self, burst: u32) -> Self {
        self.burst_count = burst;
        self
    }

    pub fn with_max_queueing_time_ms(mut self, ms: u32) -> Self {
        self.max_queueing_time_ms = ms;
        self
    }

    pub fn with_item(mut self, object: ParamValue, threshold: u32) -> Self {
        self.param_flow_item_list.push(ParamFlowItem { object, threshold });
        self
    }

    pub fn with_cluster(mut self, config: ClusterFlowConfig) -> Self {
        self.cluster_mode = true;
        self.cluster_config = Some(config);
        self
    }
}

/// A loaded rule plus its per-value counter maps and parsed overrides.
pub(crate) struct ActiveParamRule {
    pub(crate) rule: ParamFlowRule,
    pub(crate) hot_items: HashMap<ParamValue, u64>,
    pub(crate) token_counters: LruCounterMap<ParamValue, AtomicI64>,
    pub(crate) time_counters: LruCounterMap<ParamValue, AtomicU64>,
}

impl ActiveParamRule {
    pub(crate) fn new(rule: ParamFlowRule) -> Self {
        let capacity = (BASE_PARAM_MAX_CAPACITY * rule.duration_sec.max(1))
            .min(TOTAL_MAX_CAPACITY) as usize;
        let hot_items = rule
            .param_flow_item_list
            .iter()
            .map(|item| (item.object.clone(), item.threshold as u64))
            .collect();
        Self {
            rule,
            hot_items,
            token_counters: LruCounterMap::new(capacity),
            time_counters: LruCounterMap::new(capacity),
        }
    }

    /// The value's own threshold, or the rule-wide one.
    pub(crate) fn threshold_for(&self, value: &ParamValue) -> u64 {
        self.hot_items
            .get(value)
            .copied()
            .unwrap_or(self.rule.count as u64)
    }
}

static RULES: OnceLock<RwLock<Arc<HashMap<String, Arc<Vec<Arc<ActiveParamRule>>>>>>> =
    OnceLock::new();

fn rules() -> &'static RwLock<Arc<HashMap<String, Arc<Vec<Arc<ActiveParamRule>>>>>> {
    RULES.get_or_init(|| RwLock::new(Arc::new(HashMap::new())))
}

struct ParamThreadHook;

impl StatisticCallback for ParamThreadHook {
    fn on_pass(&self, _ctx: &Context, resource: &ResourceId, _count: u32, args: &[ParamValue]) {
        metric::on_pass(resource, args);
    }

    fn on_exit(&self, _ctx: &Context, resource: &ResourceId, _count: u32, args: &[ParamValue]) {
        metric::on_exit(resource, args);
    }
}

fn ensure_thread_hook() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| statistic::register_callback(Arc::new(ParamThreadHook)));
}

/// Replace the active parameter-flow rule set. Per-value counters restart
/// empty.
pub fn load_param_flow_rules(new_rules: Vec<ParamFlowRule>) {
    ensure_thread_hook();
    let mut grouped: HashMap<String, Vec<Arc<ActiveParamRule>>> = HashMap::new();
    for rule in new_rules {
        if rule.count < 0.0 {
            log::warn!(
                "ignoring parameter flow rule with negative count for `{}`",
                rule.resource
            );
            continue;
        }
        let active = Arc::new(ActiveParamRule::new(rule));
        // Thread-grade rules with a fixed index can track threads from the
        // start; negative indexes join once a call resolves them.
        if active.rule.grade == FlowGrade::Thread && active.rule.param_idx >= 0 {
            metric::ensure_thread_map(&active.rule.resource, active.rule.param_idx as usize);
        }
        grouped
            .entry(active.rule.resource.clone())
            .or_default()
            .push(active);
    }
    let snapshot: HashMap<String, Arc<Vec<Arc<ActiveParamRule>>>> = grouped
        .into_iter()
        .map(|(resource, list)| (resource, Arc::new(list)))
        .collect();
    *rules().write() = Arc::new(snapshot);
}

pub fn param_flow_rules_of_resource(resource_name: &str) -> Vec<ParamFlowRule> {
    rules()
        .read()
        .get(resource_name)
        .map(|list| list.iter().map(|active| active.rule.clone()).collect())
        .unwrap_or_default()
}

pub(crate) fn active_rules_of(resource_name: &str) -> Option<Arc<Vec<Arc<ActiveParamRule>>>> {
    rules().read().get(resource_name).cloned()
}

/// Per-value token-bucket check on a loaded rule, for the embedded token
/// server's parameter path.
pub(crate) fn server_token_check(
    active: &ActiveParamRule,
    count: u32,
    value: &ParamValue,
) -> bool {
    checker::pass_default_check(active, count, value)
}

pub(crate) struct ParamFlowSlot;

impl ProcessorSlot for ParamFlowSlot {
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
        checker::check_param_flow(resource, count, args)?;
        next.entry(ctx, resource, node, count, prioritized, args)
    }
}
