//! Per-resource rate and concurrency limits.

mod checker;
pub(crate) mod controller;

use crate::cluster::ClusterFlowConfig;
use crate::context::Context;
use crate::node::DefaultNode;
use crate::resource::ResourceId;
use crate::slots::{Next, ProcessorSlot, SlotResult};
use crate::value::ParamValue;
use controller::TrafficController;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Catch-all origin selector: the rule applies to every caller.
pub const LIMIT_ORIGIN_DEFAULT: &str = "default";
/// Applies to callers not explicitly named by any other rule of the
/// resource.
pub const LIMIT_ORIGIN_OTHER: &str = "other";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowGrade {
    /// Cap live concurrent calls.
    Thread,
    /// Cap admissions per second.
    #[default]
    Qps,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStrategy {
    /// Limit by this resource's own statistics.
    #[default]
    Direct,
    /// Limit by the aggregate of `ref_resource`.
    Relate,
    /// Limit only calls arriving through the entrance named by
    /// `ref_resource`.
    Chain,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlBehavior {
    /// Immediate reject (with the priority-occupy escape for QPS rules).
    #[default]
    Reject,
    /// Ramp the permitted rate up from cold over `warm_up_period_sec`.
    WarmUp,
    /// Leaky bucket: queue up to `max_queueing_time_ms`, then reject.
    Throttle,
    /// Warm-up curve feeding the leaky bucket.
    WarmUpThrottle,
}

fn default_limit_origin() -> String {
    LIMIT_ORIGIN_DEFAULT.to_owned()
}

fn default_warm_up_period() -> u32 {
    10
}

fn default_max_queueing() -> u32 {
    500
}

/// One flow limit. Plain data: the live shaping state is rebuilt when the
/// rule set is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRule {
    pub resource: String,
    /// Which callers this rule limits: `default`, `other`, or an origin
    /// name.
    #[serde(default = "default_limit_origin")]
    pub limit_origin: String,
    #[serde(default)]
    pub grade: FlowGrade,
    pub count: f64,
    #[serde(default)]
    pub strategy: FlowStrategy,
    #[serde(default)]
    pub ref_resource: Option<String>,
    #[serde(default)]
    pub control_behavior: ControlBehavior,
    #[serde(default = "default_warm_up_period")]
    pub warm_up_period_sec: u32,
    #[serde(default = "default_max_queueing")]
    pub max_queueing_time_ms: u32,
    #[serde(default)]
    pub cluster_mode: bool,
    #[serde(default)]
    pub cluster_config: Option<ClusterFlowConfig>,
}

impl FlowRule {
    /// A QPS reject rule for every caller, the common case.
    pub fn qps(resource: impl Into<String>, count: f64) -> Self {
        Self {
            resource: resource.into(),
            limit_origin: default_limit_origin(),
            grade: FlowGrade::Qps,
            count,
            strategy: FlowStrategy::default(),
            ref_resource: None,
            control_behavior: ControlBehavior::default(),
            warm_up_period_sec: default_warm_up_period(),
            max_queueing_time_ms: default_max_queueing(),
            cluster_mode: false,
            cluster_config: None,
        }
    }

    pub fn with_grade(mut self, grade: FlowGrade) -> Self {
        self.grade = grade;
        self
    }

    pub fn with_behavior(mut self, behavior: ControlBehavior) -> Self {
        self.control_behavior = behavior;
        self
    }

    pub fn with_limit_origin(mut self, origin: impl Into<String>) -> Self {
        self.limit_origin = origin.into();
        self
    }

    pub fn with_strategy(mut self, strategy: FlowStrategy, ref_resource: impl Into<String>) -> Self {
        self.strategy = strategy;
        self.ref_resource = Some(ref_resource.into());
        self
    }

    pub fn with_max_queueing_time_ms(mut self, ms: u32) -> Self {
        self.max_queueing_time_ms = ms;
        self
    }

    pub fn with_warm_up_period_sec(mut self, sec: u32) -> Self {
        self.warm_up_period_sec = sec;
        self
    }

    pub fn with_cluster(mut self, config: ClusterFlowConfig) -> Self {
        self.cluster_mode = true;
        self.cluster_config = Some(config);
        self
    }
}

/// A loaded rule with its live shaping state.
pub(crate) struct ActiveFlowRule {
    pub(crate) rule: FlowRule,
    pub(crate) controller: TrafficController,
}

static RULES: OnceLock<RwLock<Arc<HashMap<String, Arc<Vec<Arc<ActiveFlowRule>>>>>>> =
    OnceLock::new();

fn rules() -> &'static RwLock<Arc<HashMap<String, Arc<Vec<Arc<ActiveFlowRule>>>>>> {
    RULES.get_or_init(|| RwLock::new(Arc::new(HashMap::new())))
}

/// Replace the active flow rule set. Shaping state (token buckets, queue
/// schedules) restarts fresh; in-flight checks keep the snapshot they
/// started with.
pub fn load_flow_rules(new_rules: Vec<FlowRule>) {
    let mut grouped: HashMap<String, Vec<Arc<ActiveFlowRule>>> = HashMap::new();
    for rule in new_rules {
        if rule.count < 0.0 {
            log::warn!("ignoring flow rule with negative count for `{}`", rule.resource);
            continue;
        }
        let controller = TrafficController::for_rule(&rule);
        grouped
            .entry(rule.resource.clone())
            .or_default()
            .push(Arc::new(ActiveFlowRule { rule, controller }));
    }
    let snapshot: HashMap<String, Arc<Vec<Arc<ActiveFlowRule>>>> = grouped
        .into_iter()
        .map(|(resource, list)| (resource, Arc::new(list)))
        .collect();
    *rules().write() = Arc::new(snapshot);
    log::info!("flow rules loaded for {} resources", rules().read().len());
}

/// Current rules for one resource, as plain data.
pub fn flow_rules_of_resource(resource_name: &str) -> Vec<FlowRule> {
    rules()
        .read()
        .get(resource_name)
        .map(|list| list.iter().map(|active| active.rule.clone()).collect())
        .unwrap_or_default()
}

pub(crate) fn active_rules_of(resource_name: &str) -> Option<Arc<Vec<Arc<ActiveFlowRule>>>> {
    rules().read().get(resource_name).cloned()
}

/// An origin falls under `other` when no rule of the resource names it
/// explicitly.
pub(crate) fn is_other_origin(origin: &str, resource_name: &str) -> bool {
    if origin.is_empty() {
        return false;
    }
    match rules().read().get(resource_name) {
        None => true,
        Some(list) => !list.iter().any(|active| active.rule.limit_origin == origin),
    }
}

pub(crate) struct FlowSlot;

impl ProcessorSlot for FlowSlot {
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
        checker::check_flow(ctx, resource, node.as_ref(), count, prioritized)?;
        next.entry(ctx, resource, node, count, prioritized, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_replaces_the_active_set() {
        let _guard = crate::test_support::rule_env_lock();
        load_flow_rules(vec![FlowRule::qps("flow.load.a", 5.0)]);
        assert_eq!(flow_rules_of_resource("flow.load.a").len(), 1);

        load_flow_rules(vec![FlowRule::qps("flow.load.b", 1.0)]);
        assert!(flow_rules_of_resource("flow.load.a").is_empty());
        assert_eq!(flow_rules_of_resource("flow.load.b").len(), 1);
    }

    #[test]
    fn other_origin_means_not_explicitly_named() {
        let _guard = crate::test_support::rule_env_lock();
        load_flow_rules(vec![
            FlowRule::qps("flow.other.res", 5.0).with_limit_origin("app-a")
        ]);
        assert!(!is_other_origin("app-a", "flow.other.res"));
        assert!(is_other_origin("app-b", "flow.other.res"));
        assert!(!is_other_origin("", "flow.other.res"));
    }

    #[test]
    fn rules_deserialize_with_defaults() {
        let rule: FlowRule =
            serde_json::from_str(r#"{"resource":"api.search","count":100.0}"#).unwrap();
        assert_eq!(rule.limit_origin, LIMIT_ORIGIN_DEFAULT);
        assert_eq!(rule.grade, FlowGrade::Qps);
        assert_eq!(rule.control_behavior, ControlBehavior::Reject);
        assert_eq!(rule.max_queueing_time_ms, 500);
    }
}
