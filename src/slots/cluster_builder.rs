//! Links the call to the resource's process-wide aggregate.

use crate::context::Context;
use crate::node::{ClusterNode, DefaultNode};
use crate::resource::ResourceId;
use crate::slots::{Next, ProcessorSlot, SlotResult};
use crate::value::ParamValue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

static CLUSTER_NODES: OnceLock<RwLock<Arc<HashMap<String, Arc<ClusterNode>>>>> = OnceLock::new();

fn registry() -> &'static RwLock<Arc<HashMap<String, Arc<ClusterNode>>>> {
    CLUSTER_NODES.get_or_init(|| RwLock::new(Arc::new(HashMap::new())))
}

/// The single aggregate for a resource, if any call has touched it yet.
pub fn cluster_node(resource_name: &str) -> Option<Arc<ClusterNode>> {
    registry().read().get(resource_name).cloned()
}

pub(crate) fn get_or_create_cluster_node(resource_name: &str) -> Arc<ClusterNode> {
    if let Some(node) = registry().read().get(resource_name) {
        return Arc::clone(node);
    }
    let mut guard = registry().write();
    if let Some(node) = guard.get(resource_name) {
        return Arc::clone(node);
    }
    let node = Arc::new(ClusterNode::new());
    let mut next = HashMap::clone(&guard);
    next.insert(resource_name.to_owned(), Arc::clone(&node));
    *guard = Arc::new(next);
    node
}

/// Snapshot of every resource aggregate, for inspection.
pub fn cluster_node_map() -> Arc<HashMap<String, Arc<ClusterNode>>> {
    Arc::clone(&registry().read())
}

/// Ties the default node to its resource's [`ClusterNode`] and, when the
/// context declares an origin, attaches the per-origin statistic node to
/// the current entry.
pub(crate) struct ClusterBuilderSlot {
    cluster: OnceLock<Arc<ClusterNode>>,
}

impl ClusterBuilderSlot {
    pub(crate) fn new() -> Self {
        Self {
            cluster: OnceLock::new(),
        }
    }
}

impl ProcessorSlot for ClusterBuilderSlot {
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
        let cluster = self
            .cluster
            .get_or_init(|| get_or_create_cluster_node(resource.name()));
        if let Some(node) = &node {
            node.set_cluster_node(Arc::clone(cluster));
        }
        if !ctx.origin().is_empty() {
            if let Some(entry) = ctx.cur_entry() {
                entry.set_origin_node(cluster.get_or_create_origin_node(ctx.origin()));
            }
        }
        next.entry(ctx, resource, node, count, prioritized, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_cluster_node_per_resource() {
        let a = get_or_create_cluster_node("builder.res.shared");
        let b = get_or_create_cluster_node("builder.res.shared");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(cluster_node("builder.res.shared").is_some());
        assert!(cluster_node("builder.res.absent").is_none());
    }
}
