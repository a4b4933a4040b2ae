//! Rule evaluation: node selection, shaping, and the cluster-token path.

use crate::clock::sleep_ms;
use crate::cluster;
use crate::cluster::{TokenResult, TokenStatus};
use crate::context::Context;
use crate::error::BlockError;
use crate::node::{DefaultNode, StatisticNode};
use crate::resource::ResourceId;
use crate::slots::cluster_builder;
use crate::slots::flow::controller::ControllerVerdict;
use crate::slots::flow::{
    self, ActiveFlowRule, FlowStrategy, LIMIT_ORIGIN_DEFAULT, LIMIT_ORIGIN_OTHER,
};
use crate::slots::{SlotResult, SlotSignal};
use std::sync::Arc;

pub(crate) fn check_flow(
    ctx: &Context,
    resource: &ResourceId,
    node: Option<&Arc<DefaultNode>>,
    count: u32,
    prioritized: bool,
) -> SlotResult {
    let Some(rules) = flow::active_rules_of(resource.name()) else {
        return Ok(());
    };
    for active in rules.iter() {
        match check_rule(active, ctx, node, count, prioritized) {
            ControllerVerdict::Pass => {}
            ControllerVerdict::PriorityWait { wait_ms } => {
                return Err(SlotSignal::PriorityWait { wait_ms });
            }
            ControllerVerdict::Block => {
                return Err(SlotSignal::Block(BlockError::Flow {
                    resource: resource.name().to_owned(),
                    rule: active.rule.clone(),
                }));
            }
        }
    }
    Ok(())
}

fn check_rule(
    active: &ActiveFlowRule,
    ctx: &Context,
    node: Option<&Arc<DefaultNode>>,
    count: u32,
    prioritized: bool,
) -> ControllerVerdict {
    if active.rule.cluster_mode {
        return check_cluster(active, ctx, node, count, prioritized);
    }
    check_local(active, ctx, node, count, prioritized)
}

fn check_local(
    active: &ActiveFlowRule,
    ctx: &Context,
    node: Option<&Arc<DefaultNode>>,
    count: u32,
    prioritized: bool,
) -> ControllerVerdict {
    let Some(selected) = select_node(active, ctx, node) else {
        return ControllerVerdict::Pass;
    };
    active.controller.can_pass(&selected, count, prioritized)
}

/// Resolve the statistics the rule measures against, from its origin
/// selector and strategy. `None` means the rule does not apply to this
/// call.
fn select_node(
    active: &ActiveFlowRule,
    ctx: &Context,
    node: Option<&Arc<DefaultNode>>,
) -> Option<Arc<StatisticNode>> {
    let rule = &active.rule;
    let origin = ctx.origin();

    if rule.limit_origin == origin && is_custom_origin(origin) {
        if rule.strategy == FlowStrategy::Direct {
            return origin_stat_node(ctx);
        }
        return select_reference_node(active, ctx, node);
    }
    if rule.limit_origin == LIMIT_ORIGIN_DEFAULT {
        if rule.strategy == FlowStrategy::Direct {
            return node.and_then(|n| n.cluster_node()).map(|c| c.stats_arc());
        }
        return select_reference_node(active, ctx, node);
    }
    if rule.limit_origin == LIMIT_ORIGIN_OTHER && flow::is_other_origin(origin, &rule.resource) {
        if rule.strategy == FlowStrategy::Direct {
            return origin_stat_node(ctx);
        }
        return select_reference_node(active, ctx, node);
    }
    None
}

fn is_custom_origin(origin: &str) -> bool {
    !origin.is_empty() && origin != LIMIT_ORIGIN_DEFAULT && origin != LIMIT_ORIGIN_OTHER
}

fn origin_stat_node(ctx: &Context) -> Option<Arc<StatisticNode>> {
    ctx.cur_entry().and_then(|entry| entry.origin_node())
}

fn select_reference_node(
    active: &ActiveFlowRule,
    ctx: &Context,
    node: Option<&Arc<DefaultNode>>,
) -> Option<Arc<StatisticNode>> {
    let rule = &active.rule;
    let ref_resource = rule.ref_resource.as_deref()?;
    if ref_resource.is_empty() {
        return None;
    }
    match rule.strategy {
        FlowStrategy::Relate => {
            cluster_builder::cluster_node(ref_resource).map(|c| c.stats_arc())
        }
        FlowStrategy::Chain => {
            if ref_resource != ctx.name() {
                return None;
            }
            node.map(|n| n.stats_arc())
        }
        FlowStrategy::Direct => None,
    }
}

fn check_cluster(
    active: &ActiveFlowRule,
    ctx: &Context,
    node: Option<&Arc<DefaultNode>>,
    count: u32,
    prioritized: bool,
) -> ControllerVerdict {
    let Some(config) = active.rule.cluster_config.as_ref() else {
        return fallback_or_pass(active, ctx, node, count, prioritized);
    };
    let Some(service) = cluster::pick_token_service() else {
        return fallback_or_pass(active, ctx, node, count, prioritized);
    };
    match service.request_token(config.flow_id, count, prioritized) {
        Ok(result) => {
            apply_token_result(result, active, ctx, node, count, prioritized)
        }
        Err(err) => {
            log::warn!(
                "cluster token request failed for flow {}: {err}",
                config.flow_id
            );
            fallback_or_pass(active, ctx, node, count, prioritized)
        }
    }
}

fn apply_token_result(
    result: TokenResult,
    active: &ActiveFlowRule,
    ctx: &Context,
    node: Option<&Arc<DefaultNode>>,
    count: u32,
    prioritized: bool,
) -> ControllerVerdict {
    match result.status {
        TokenStatus::Ok => ControllerVerdict::Pass,
        TokenStatus::ShouldWait => {
            sleep_ms(result.wait_ms);
            ControllerVerdict::Pass
        }
        TokenStatus::Blocked => ControllerVerdict::Block,
        TokenStatus::NoRuleExists
        | TokenStatus::BadRequest
        | TokenStatus::Fail
        | TokenStatus::TooManyRequests => {
            fallback_or_pass(active, ctx, node, count, prioritized)
        }
    }
}

fn fallback_or_pass(
    active: &ActiveFlowRule,
    ctx: &Context,
    node: Option<&Arc<DefaultNode>>,
    count: u32,
    prioritized: bool,
) -> ControllerVerdict {
    let fallback = active
        .rule
        .cluster_config
        .as_ref()
        .map(|config| config.fallback_to_local_when_fail)
        .unwrap_or(false);
    if fallback {
        check_local(active, ctx, node, count, prioritized)
    } else {
        ControllerVerdict::Pass
    }
}
