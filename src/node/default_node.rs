use crate::node::cluster::ClusterNode;
use crate::node::statistic::StatisticNode;
use crate::resource::ResourceId;
use parking_lot::RwLock;
use std::sync::Arc;

/// Per-(resource, context) statistics node and call-tree vertex.
///
/// Writes fan out to the resource's shared [`ClusterNode`], so recording a
/// pass here keeps the per-resource aggregate consistent without a second
/// bookkeeping pass.
#[derive(Debug)]
pub struct DefaultNode {
    resource: ResourceId,
    stats: Arc<StatisticNode>,
    cluster: RwLock<Option<Arc<ClusterNode>>>,
    children: RwLock<Vec<Arc<DefaultNode>>>,
}

impl DefaultNode {
    pub fn new(resource: ResourceId) -> Self {
        Self {
            resource,
            stats: Arc::new(StatisticNode::new()),
            cluster: RwLock::new(None),
            children: RwLock::new(Vec::new()),
        }
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub fn stats(&self) -> &StatisticNode {
        &self.stats
    }

    pub fn stats_arc(&self) -> Arc<StatisticNode> {
        Arc::clone(&self.stats)
    }

    pub fn cluster_node(&self) -> Option<Arc<ClusterNode>> {
        self.cluster.read().clone()
    }

    pub fn set_cluster_node(&self, cluster: Arc<ClusterNode>) {
        *self.cluster.write() = Some(cluster);
    }

    pub fn add_child(&self, child: Arc<DefaultNode>) {
        let mut children = self.children.write();
        if !children.iter().any(|existing| Arc::ptr_eq(existing, &child)) {
            children.push(child);
        }
    }

    pub fn children(&self) -> Vec<Arc<DefaultNode>> {
        self.children.read().clone()
    }

    pub fn add_pass(&self, count: u64) {
        self.stats.add_pass(count);
        if let Some(cluster) = self.cluster.read().as_ref() {
            cluster.stats().add_pass(count);
        }
    }

    pub fn add_block(&self, count: u64) {
        self.stats.add_block(count);
        if let Some(cluster) = self.cluster.read().as_ref() {
            cluster.stats().add_block(count);
        }
    }

    pub fn add_exception(&self, count: u64) {
        self.stats.add_exception(count);
        if let Some(cluster) = self.cluster.read().as_ref() {
            cluster.stats().add_exception(count);
        }
    }

    pub fn add_rt_and_success(&self, rt_ms: u64, success_count: u64) {
        self.stats.add_rt_and_success(rt_ms, success_count);
        if let Some(cluster) = self.cluster.read().as_ref() {
            cluster.stats().add_rt_and_success(rt_ms, success_count);
        }
    }

    pub fn inc_thread(&self) {
        self.stats.inc_thread();
        if let Some(cluster) = self.cluster.read().as_ref() {
            cluster.stats().inc_thread();
        }
    }

    pub fn dec_thread(&self) {
        self.stats.dec_thread();
        if let Some(cluster) = self.cluster.read().as_ref() {
            cluster.stats().dec_thread();
        }
    }
}

/// Root of one context's call tree. Its own counters stay empty; aggregate
/// queries sum over the children attached by admissions in that context.
#[derive(Debug)]
pub struct EntranceNode {
    node: Arc<DefaultNode>,
}

impl EntranceNode {
    pub fn new(context_name: impl Into<String>) -> Self {
        Self {
            node: Arc::new(DefaultNode::new(ResourceId::inbound(context_name.into()))),
        }
    }

    pub fn name(&self) -> &str {
        self.node.resource().name()
    }

    pub fn node(&self) -> Arc<DefaultNode> {
        Arc::clone(&self.node)
    }

    fn sum(&self, read: impl Fn(&StatisticNode) -> f64) -> f64 {
        self.node
            .children()
            .iter()
            .map(|child| read(child.stats()))
            .sum()
    }

    pub fn pass_qps(&self) -> f64 {
        self.sum(StatisticNode::pass_qps)
    }

    pub fn block_qps(&self) -> f64 {
        self.sum(StatisticNode::block_qps)
    }

    pub fn success_qps(&self) -> f64 {
        self.sum(StatisticNode::success_qps)
    }

    pub fn total_qps(&self) -> f64 {
        self.pass_qps() + self.block_qps()
    }

    pub fn cur_thread_num(&self) -> i64 {
        self.node
            .children()
            .iter()
            .map(|child| child.stats().cur_thread_num())
            .sum()
    }

    /// Request-weighted average RT across the children.
    pub fn avg_rt(&self) -> f64 {
        let children = self.node.children();
        let mut rt = 0.0;
        let mut successes = 0.0;
        for child in &children {
            let qps = child.stats().success_qps();
            rt += child.stats().avg_rt() * qps;
            successes += qps;
        }
        if successes == 0.0 {
            return 0.0;
        }
        rt / successes
    }

    pub fn total_request(&self) -> u64 {
        self.node
            .children()
            .iter()
            .map(|child| child.stats().total_request())
            .sum()
    }

    pub fn total_pass(&self) -> u64 {
        self.node
            .children()
            .iter()
            .map(|child| child.stats().total_pass())
            .sum()
    }
}
