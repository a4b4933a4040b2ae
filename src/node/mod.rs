//! Statistics holders: the per-call-tree node graph and per-resource
//! aggregates.
//!
//! Edges point only downward (children, cluster aggregate, per-origin
//! breakdown), so the graph is a DAG and plain `Arc` sharing is enough; no
//! arena indirection is needed.

mod cluster;
mod default_node;
mod statistic;

pub use cluster::ClusterNode;
pub use default_node::{DefaultNode, EntranceNode};
pub use statistic::StatisticNode;

use std::sync::{Arc, OnceLock};

static GLOBAL_INBOUND: OnceLock<Arc<ClusterNode>> = OnceLock::new();

/// Aggregate over every inbound entry in the process; the system guard
/// checks its caps against this node.
pub fn global_inbound_node() -> &'static Arc<ClusterNode> {
    GLOBAL_INBOUND.get_or_init(|| Arc::new(ClusterNode::new()))
}
