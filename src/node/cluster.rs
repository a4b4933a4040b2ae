use crate::node::statistic::StatisticNode;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-resource aggregate. Exactly one exists per resource process-wide;
/// every call to that resource, whatever its context, lands here. Holds a
/// per-origin breakdown for callers that declare an identity.
#[derive(Debug)]
pub struct ClusterNode {
    stats: Arc<StatisticNode>,
    origins: RwLock<Arc<HashMap<String, Arc<StatisticNode>>>>,
}

impl ClusterNode {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(StatisticNode::new()),
            origins: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn stats(&self) -> &StatisticNode {
        &self.stats
    }

    pub fn stats_arc(&self) -> Arc<StatisticNode> {
        Arc::clone(&self.stats)
    }

    pub fn origin_node(&self, origin: &str) -> Option<Arc<StatisticNode>> {
        self.origins.read().get(origin).cloned()
    }

    /// Fetch or create the statistic node tracking one caller identity.
    /// The map stabilizes quickly, so replacement is copy-on-write and
    /// readers never hold the lock.
    pub fn get_or_create_origin_node(&self, origin: &str) -> Arc<StatisticNode> {
        if let Some(node) = self.origins.read().get(origin) {
            return Arc::clone(node);
        }
        let mut guard = self.origins.write();
        if let Some(node) = guard.get(origin) {
            return Arc::clone(node);
        }
        let node = Arc::new(StatisticNode::new());
        let mut next = HashMap::clone(&guard);
        next.insert(origin.to_owned(), Arc::clone(&node));
        *guard = Arc::new(next);
        node
    }

    pub fn origin_map(&self) -> Arc<HashMap<String, Arc<StatisticNode>>> {
        Arc::clone(&self.origins.read())
    }

    /// Record application errors observed while the resource was held.
    pub fn record_exception(&self, count: u64) {
        self.stats.add_exception(count);
    }
}

impl Default for ClusterNode {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_nodes_are_created_once() {
        let node = ClusterNode::new();
        let a = node.get_or_create_origin_node("service-a");
        let b = node.get_or_create_origin_node("service-a");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(node.origin_map().len(), 1);
        assert!(node.origin_node("service-b").is_none());
    }

    #[test]
    fn exceptions_feed_the_aggregate() {
        let node = ClusterNode::new();
        node.record_exception(2);
        assert_eq!(node.stats().total_exception(), 2);
    }
}
