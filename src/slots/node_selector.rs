//! Attaches the per-(resource, context) statistics node to the call.

use crate::context::Context;
use crate::node::DefaultNode;
use crate::resource::ResourceId;
use crate::slots::{Next, ProcessorSlot, SlotResult};
use crate::value::ParamValue;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// One slot chain serves a resource across every context, so the cache is
/// keyed by *context name*: the same resource entered through two
/// entrances yields two default nodes, each a child of its own call tree.
pub(crate) struct NodeSelectorSlot {
    nodes: RwLock<Arc<HashMap<String, Arc<DefaultNode>>>>,
    build_lock: Mutex<()>,
}

impl NodeSelectorSlot {
    pub(crate) fn new() -> Self {
        Self {
            nodes: RwLock::new(Arc::new(HashMap::new())),
            build_lock: Mutex::new(()),
        }
    }

    fn node_for(&self, ctx: &Context, resource: &ResourceId) -> Arc<DefaultNode> {
        if let Some(node) = self.nodes.read().get(ctx.name()) {
            return Arc::clone(node);
        }
        let _guard = self.build_lock.lock();
        if let Some(node) = self.nodes.read().get(ctx.name()) {
            return Arc::clone(node);
        }
        let node = Arc::new(DefaultNode::new(resource.clone()));
        if let Some(parent) = ctx.last_node() {
            parent.add_child(Arc::clone(&node));
        }
        let mut guard = self.nodes.write();
        let mut next = HashMap::clone(&guard);
        next.insert(ctx.name().to_owned(), Arc::clone(&node));
        *guard = Arc::new(next);
        node
    }
}

impl ProcessorSlot for NodeSelectorSlot {
    fn entry(
        &self,
        ctx: &Context,
        resource: &ResourceId,
        _node: Option<Arc<DefaultNode>>,
        count: u32,
        prioritized: bool,
        args: &[ParamValue],
        next: Next<'_>,
    ) -> SlotResult {
        let node = self.node_for(ctx, resource);
        if let Some(entry) = ctx.cur_entry() {
            entry.set_cur_node(Arc::clone(&node));
        }
        next.entry(ctx, resource, Some(node), count, prioritized, args)
    }
}
