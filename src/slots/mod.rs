//! The per-resource processing pipeline.
//!
//! Each admission runs front-to-back through the slots below; exits run
//! back-to-front. The first three slots do bookkeeping, the rest are rule
//! checkers:
//!
//! `NodeSelector → ClusterBuilder → Statistic → Authority → System → Flow →
//! Degrade → ParamFlow`

pub mod authority;
pub mod cluster_builder;
pub mod degrade;
pub mod flow;
pub(crate) mod node_selector;
pub mod param_flow;
pub(crate) mod statistic;
pub mod system;

use crate::context::Context;
use crate::error::BlockError;
use crate::node::DefaultNode;
use crate::resource::ResourceId;
use crate::value::ParamValue;
use std::sync::Arc;

/// Outcome signal travelling backwards through the chain.
#[derive(Debug)]
pub(crate) enum SlotSignal {
    Block(BlockError),
    /// The priority-occupy path already slept and borrowed a future
    /// window; the statistic slot converts this into a pass.
    PriorityWait { wait_ms: u64 },
}

pub(crate) type SlotResult = Result<(), SlotSignal>;

/// One stage of the pipeline.
pub(crate) trait ProcessorSlot: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn entry(
        &self,
        ctx: &Context,
        resource: &ResourceId,
        node: Option<Arc<DefaultNode>>,
        count: u32,
        prioritized: bool,
        args: &[ParamValue],
        next: Next<'_>,
    ) -> SlotResult;

    fn exit(&self, _ctx: &Context, _resource: &ResourceId, _count: u32, _args: &[ParamValue]) {}
}

/// Continuation handle: a slot calls `next.entry(...)` to run the rest of
/// the chain and observe its outcome on the way back.
pub(crate) struct Next<'a> {
    chain: &'a SlotChain,
    index: usize,
}

impl Next<'_> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn entry(
        self,
        ctx: &Context,
        resource: &ResourceId,
        node: Option<Arc<DefaultNode>>,
        count: u32,
        prioritized: bool,
        args: &[ParamValue],
    ) -> SlotResult {
        self.chain
            .entry_from(self.index, ctx, resource, node, count, prioritized, args)
    }
}

/// The ordered pipeline shared by every context touching one resource.
#[derive(Debug)]
pub(crate) struct SlotChain {
    slots: Vec<Box<dyn ProcessorSlot>>,
}

impl std::fmt::Debug for dyn ProcessorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProcessorSlot")
    }
}

impl SlotChain {
    /// The default chain order. Bookkeeping first, then the rule checkers
    /// from cheapest to most specific.
    pub(crate) fn build_default() -> Self {
        Self {
            slots: vec![
                Box::new(node_selector::NodeSelectorSlot::new()),
                Box::new(cluster_builder::ClusterBuilderSlot::new()),
                Box::new(statistic::StatisticSlot::new()),
                Box::new(authority::AuthoritySlot),
                Box::new(system::SystemSlot),
                Box::new(flow::FlowSlot),
                Box::new(degrade::DegradeSlot),
                Box::new(param_flow::ParamFlowSlot),
            ],
        }
    }

    pub(crate) fn entry(
        &self,
        ctx: &Context,
        resource: &ResourceId,
        count: u32,
        prioritized: bool,
        args: &[ParamValue],
    ) -> SlotResult {
        self.entry_from(0, ctx, resource, None, count, prioritized, args)
    }

    #[allow(clippy::too_many_arguments)]
    fn entry_from(
        &self,
        index: usize,
        ctx: &Context,
        resource: &ResourceId,
        node: Option<Arc<DefaultNode>>,
        count: u32,
        prioritized: bool,
        args: &[ParamValue],
    ) -> SlotResult {
        match self.slots.get(index) {
            None => Ok(()),
            Some(slot) => slot.entry(
                ctx,
                resource,
                node,
                count,
                prioritized,
                args,
                Next {
                    chain: self,
                    index: index + 1,
                },
            ),
        }
    }

    pub(crate) fn exit(&self, ctx: &Context, resource: &ResourceId, count: u32, args: &[ParamValue]) {
        for slot in self.slots.iter().rev() {
            slot.exit(ctx, resource, count, args);
        }
    }
}
