//! Per-value thread counters, maintained from the statistic slot's
//! pass/exit hooks.

use crate::resource::ResourceId;
use crate::stat::LruCounterMap;
use crate::value::ParamValue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

/// Capacity of each per-argument-index thread counter map.
const THREAD_COUNT_MAX_CAPACITY: usize = 4000;

type ThreadMap = Arc<LruCounterMap<ParamValue, AtomicI64>>;

/// Thread counters for one resource, keyed by argument index. Maps exist
/// only for indexes some thread-grade rule resolved to; the statistic
/// hooks update whichever maps exist.
#[derive(Debug, Default)]
pub(crate) struct ParamThreadMetric {
    maps: RwLock<HashMap<usize, ThreadMap>>,
}

impl ParamThreadMetric {
    fn ensure_index(&self, index: usize) {
        if self.maps.read().contains_key(&index) {
            return;
        }
        self.maps
            .write()
            .entry(index)
            .or_insert_with(|| Arc::new(LruCounterMap::new(THREAD_COUNT_MAX_CAPACITY)));
    }

    pub(crate) fn thread_count(&self, index: usize, value: &ParamValue) -> i64 {
        let Some(map) = self.maps.read().get(&index).cloned() else {
            return 0;
        };
        map.get(value)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub(crate) fn add_threads(&self, args: &[ParamValue]) {
        let maps = self.maps.read().clone();
        for (index, map) in &maps {
            let Some(arg) = args.get(*index) else {
                continue;
            };
            if arg.is_null() {
                continue;
            }
            for value in expand(arg) {
                let (counter, _) = map.get_or_insert_with(value, || AtomicI64::new(0));
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn decrease_threads(&self, args: &[ParamValue]) {
        let maps = self.maps.read().clone();
        for (index, map) in &maps {
            let Some(arg) = args.get(*index) else {
                continue;
            };
            if arg.is_null() {
                continue;
            }
            for value in expand(arg) {
                if let Some(counter) = map.get(value) {
                    if counter.fetch_sub(1, Ordering::Relaxed) <= 1 {
                        // Dead counters are dropped rather than pinned in
                        // the LRU.
                        map.remove(value);
                    }
                }
            }
        }
    }
}

/// A sequence argument counts each element; anything else counts itself.
pub(crate) fn expand(value: &ParamValue) -> Vec<&ParamValue> {
    match value.elements() {
        Some(items) => items.iter().collect(),
        None => vec![value],
    }
}

static STORAGE: OnceLock<RwLock<Arc<HashMap<String, Arc<ParamThreadMetric>>>>> = OnceLock::new();

fn storage() -> &'static RwLock<Arc<HashMap<String, Arc<ParamThreadMetric>>>> {
    STORAGE.get_or_init(|| RwLock::new(Arc::new(HashMap::new())))
}

pub(crate) fn metric_of(resource_name: &str) -> Option<Arc<ParamThreadMetric>> {
    storage().read().get(resource_name).cloned()
}

/// Make sure the resource tracks thread counts for `index`.
pub(crate) fn ensure_thread_map(resource_name: &str, index: usize) {
    if let Some(metric) = storage().read().get(resource_name) {
        metric.ensure_index(index);
        return;
    }
    let mut guard = storage().write();
    if let Some(metric) = guard.get(resource_name) {
        metric.ensure_index(index);
        return;
    }
    let metric = Arc::new(ParamThreadMetric::default());
    metric.ensure_index(index);
    let mut next = HashMap::clone(&guard);
    next.insert(resource_name.to_owned(), Arc::clone(&metric));
    *guard = Arc::new(next);
}

pub(crate) fn on_pass(resource: &ResourceId, args: &[ParamValue]) {
    if args.is_empty() {
        return;
    }
    if let Some(metric) = metric_of(resource.name()) {
        metric.add_threads(args);
    }
}

pub(crate) fn on_exit(resource: &ResourceId, args: &[ParamValue]) {
    if args.is_empty() {
        return;
    }
    if let Some(metric) = metric_of(resource.name()) {
        metric.decrease_threads(args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_counts_balance_per_value() {
        let metric = ParamThreadMetric::default();
        metric.ensure_index(0);

        let args = [ParamValue::from("key-a")];
        metric.add_threads(&args);
        metric.add_threads(&args);
        assert_eq!(metric.thread_count(0, &args[0]), 2);

        metric.decrease_threads(&args);
        assert_eq!(metric.thread_count(0, &args[0]), 1);
        metric.decrease_threads(&args);
        // The zeroed counter is removed entirely.
        assert_eq!(metric.thread_count(0, &args[0]), 0);
    }

    #[test]
    fn sequences_count_each_element() {
        let metric = ParamThreadMetric::default();
        metric.ensure_index(0);

        let seq = ParamValue::Seq(vec![ParamValue::from("x"), ParamValue::from("y")]);
        metric.add_threads(std::slice::from_ref(&seq));
        assert_eq!(metric.thread_count(0, &ParamValue::from("x")), 1);
        assert_eq!(metric.thread_count(0, &ParamValue::from("y")), 1);
    }

    #[test]
    fn untracked_indexes_are_ignored() {
        let metric = ParamThreadMetric::default();
        metric.ensure_index(1);
        let args = [ParamValue::from("a"), ParamValue::from("b")];
        metric.add_threads(&args);
        assert_eq!(metric.thread_count(0, &args[0]), 0);
        assert_eq!(metric.thread_count(1, &args[1]), 1);
    }
}
