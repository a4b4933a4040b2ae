//! The bookkeeping slot: runs the rest of the chain, then settles counters
//! by outcome.

use crate::clock::now_ms;
use crate::config::RT_DROP_VALVE_MS;
use crate::context::Context;
use crate::entry::EntryFault;
use crate::error::BlockError;
use crate::node::{global_inbound_node, DefaultNode};
use crate::resource::ResourceId;
use crate::slots::{Next, ProcessorSlot, SlotResult, SlotSignal};
use crate::value::ParamValue;
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};

/// Hooks observing settled admissions. The parameter-flow subsystem uses
/// them to maintain its per-value thread counters.
pub(crate) trait StatisticCallback: Send + Sync {
    fn on_pass(
        &self,
        _ctx: &Context,
        _resource: &ResourceId,
        _count: u32,
        _args: &[ParamValue],
    ) {
    }

    fn on_blocked(
        &self,
        _error: &BlockError,
        _ctx: &Context,
        _resource: &ResourceId,
        _count: u32,
        _args: &[ParamValue],
    ) {
    }

    fn on_exit(&self, _ctx: &Context, _resource: &ResourceId, _count: u32, _args: &[ParamValue]) {}
}

static CALLBACKS: OnceLock<RwLock<Vec<Arc<dyn StatisticCallback>>>> = OnceLock::new();

fn callbacks() -> &'static RwLock<Vec<Arc<dyn StatisticCallback>>> {
    CALLBACKS.get_or_init(|| RwLock::new(Vec::new()))
}

pub(crate) fn register_callback(callback: Arc<dyn StatisticCallback>) {
    callbacks().write().push(callback);
}

pub(crate) struct StatisticSlot;

impl StatisticSlot {
    pub(crate) fn new() -> Self {
        StatisticSlot
    }
}

impl ProcessorSlot for StatisticSlot {
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
        let outcome = next.entry(ctx, resource, node.clone(), count, prioritized, args);
        let entry = ctx.cur_entry();
        let origin_node = entry.as_ref().and_then(|e| e.origin_node());

        match outcome {
            Ok(()) => {
                if let Some(node) = &node {
                    node.inc_thread();
                    node.add_pass(count as u64);
                }
                if let Some(origin) = &origin_node {
                    origin.inc_thread();
                    origin.add_pass(count as u64);
                }
                if resource.is_inbound() {
                    let global = global_inbound_node().stats();
                    global.inc_thread();
                    global.add_pass(count as u64);
                }
                for callback in callbacks().read().iter() {
                    callback.on_pass(ctx, resource, count, args);
                }
                Ok(())
            }
            Err(SlotSignal::PriorityWait { .. }) => {
                // The sleep already consumed a future bucket; only the live
                // thread needs accounting.
                if let Some(node) = &node {
                    node.inc_thread();
                }
                if let Some(origin) = &origin_node {
                    origin.inc_thread();
                }
                if resource.is_inbound() {
                    global_inbound_node().stats().inc_thread();
                }
                for callback in callbacks().read().iter() {
                    callback.on_pass(ctx, resource, count, args);
                }
                Ok(())
            }
            Err(SlotSignal::Block(error)) => {
                if let Some(entry) = &entry {
                    entry.set_fault(EntryFault::Blocked(error.to_string()));
                }
                if let Some(node) = &node {
                    node.add_block(count as u64);
                }
                if let Some(origin) = &origin_node {
                    origin.add_block(count as u64);
                }
                if resource.is_inbound() {
                    global_inbound_node().stats().add_block(count as u64);
                }
                for callback in callbacks().read().iter() {
                    callback.on_blocked(&error, ctx, resource, count, args);
                }
                Err(SlotSignal::Block(error))
            }
        }
    }

    fn exit(&self, ctx: &Context, resource: &ResourceId, count: u32, args: &[ParamValue]) {
        let mut was_blocked = false;
        if let Some(entry) = ctx.cur_entry() {
            let node = entry.cur_node();
            let origin = entry.origin_node();
            was_blocked = matches!(entry.fault(), Some(EntryFault::Blocked(_)));
            match entry.fault() {
                None => {
                    let rt = (now_ms().saturating_sub(entry.created_ms())).min(RT_DROP_VALVE_MS);
                    if let Some(node) = &node {
                        node.add_rt_and_success(rt, count as u64);
                        node.dec_thread();
                    }
                    if let Some(origin) = &origin {
                        origin.add_rt_and_success(rt, count as u64);
                        origin.dec_thread();
                    }
                    if resource.is_inbound() {
                        let global = global_inbound_node().stats();
                        global.add_rt_and_success(rt, count as u64);
                        global.dec_thread();
                    }
                }
                Some(EntryFault::App(_)) => {
                    // The call ran and failed: exception QPS was recorded
                    // when the fault was traced; release the thread slot.
                    if let Some(node) = &node {
                        node.dec_thread();
                    }
                    if let Some(origin) = &origin {
                        origin.dec_thread();
                    }
                    if resource.is_inbound() {
                        global_inbound_node().stats().dec_thread();
                    }
                }
                Some(EntryFault::Blocked(_)) => {
                    // Never admitted: nothing was incremented.
                }
            }
        }
        // Blocked entries never fired `on_pass`, so their exits stay
        // invisible to the hooks as well.
        if !was_blocked {
            for callback in callbacks().read().iter() {
                callback.on_exit(ctx, resource, count, args);
            }
        }
    }
}
