//! Embedded token server: per-flow window statistics, global thresholds,
//! and the namespace-wide request limiter.

use crate::clock::now_ms;
use crate::cluster::{
    ClusterThresholdType, EmbeddedTokenServer, TokenResult, TokenService, TokenServiceError,
    TokenStatus,
};
use crate::slots::flow::FlowRule;
use crate::slots::param_flow::{ActiveParamRule, ParamFlowRule};
use crate::stat::{BucketRing, RingBucket};
use crate::value::ParamValue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_NAMESPACE: &str = "default";

fn default_exceed_count() -> f64 {
    1.0
}

fn default_max_occupy_ratio() -> f64 {
    1.0
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_sample_count() -> usize {
    10
}

fn default_max_allowed_qps() -> f64 {
    30_000.0
}

/// Server-side flow tuning for a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFlowConfig {
    /// Multiplier on the global threshold, for controlled overselling.
    #[serde(default = "default_exceed_count")]
    pub exceed_count: f64,
    /// Cap on future capacity reservable by prioritized requests, as a
    /// ratio of the global threshold.
    #[serde(default = "default_max_occupy_ratio")]
    pub max_occupy_ratio: f64,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_sample_count")]
    pub sample_count: usize,
    /// Namespace-wide safety cap enforced before any rule evaluation.
    #[serde(default = "default_max_allowed_qps")]
    pub max_allowed_qps: f64,
}

impl Default for ServerFlowConfig {
    fn default() -> Self {
        Self {
            exceed_count: default_exceed_count(),
            max_occupy_ratio: default_max_occupy_ratio(),
            interval_ms: default_interval_ms(),
            sample_count: default_sample_count(),
            max_allowed_qps: default_max_allowed_qps(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClusterEvent {
    Pass,
    PassRequest,
    Block,
    BlockRequest,
    OccupiedPass,
}

const CLUSTER_EVENT_COUNT: usize = 5;

#[derive(Debug)]
pub(crate) struct ClusterBucket {
    counters: [AtomicU64; CLUSTER_EVENT_COUNT],
}

impl ClusterBucket {
    fn add(&self, event: ClusterEvent, count: u64) {
        self.counters[event as usize].fetch_add(count, Ordering::Relaxed);
    }

    fn get(&self, event: ClusterEvent) -> u64 {
        self.counters[event as usize].load(Ordering::Relaxed)
    }
}

impl RingBucket for ClusterBucket {
    fn new_empty() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Window statistics for one cluster flow rule, with a future ring for
/// prioritized reservations.
#[derive(Debug)]
pub(crate) struct ClusterMetric {
    ring: BucketRing<ClusterBucket>,
    future: BucketRing<ClusterBucket>,
}

impl ClusterMetric {
    pub(crate) fn new(sample_count: usize, interval_ms: u64) -> Self {
        Self {
            ring: BucketRing::new(sample_count, interval_ms),
            future: BucketRing::new(sample_count, interval_ms),
        }
    }

    pub(crate) fn add(&self, event: ClusterEvent, count: u64) {
        self.ring.current_bucket(now_ms()).value().add(event, count);
    }

    pub(crate) fn sum(&self, event: ClusterEvent) -> u64 {
        let now = now_ms();
        self.ring.current_bucket(now);
        let mut total = 0;
        self.ring
            .for_each_valid(now, |bucket| total += bucket.get(event));
        total
    }

    pub(crate) fn avg(&self, event: ClusterEvent) -> f64 {
        self.sum(event) as f64 / self.ring.interval_sec()
    }

    fn waiting_sum(&self, now: u64) -> u64 {
        let mut total = 0;
        self.future.for_each_present(|start, bucket| {
            if start > now {
                total += bucket.get(ClusterEvent::Pass);
            }
        });
        total
    }

    pub(crate) fn waiting_avg(&self) -> f64 {
        self.waiting_sum(now_ms()) as f64 / self.ring.interval_sec()
    }

    /// Reserve `acquire` tokens in the earliest future window with
    /// headroom, scanning forward as current buckets lapse. Returns the
    /// wait until that window, or 0 when nothing inside the interval has
    /// room.
    pub(crate) fn try_occupy_next(&self, acquire: u32, threshold: f64) -> u64 {
        let now = now_ms();
        let window_ms = self.ring.window_ms();
        let interval_ms = self.ring.interval_ms();
        let max_count = threshold * self.ring.interval_sec();
        let borrowed = self.waiting_sum(now) as f64;
        let mut current_pass = self.sum(ClusterEvent::Pass) as f64;
        let mut earliest = (now - now % window_ms + window_ms) as i64 - interval_ms as i64;
        let mut idx: u64 = 0;
        while earliest < now as i64 {
            let wait_ms = idx * window_ms + window_ms - now % window_ms;
            if wait_ms >= interval_ms {
                break;
            }
            let expiring = if earliest >= 0 {
                self.ring
                    .bucket_at(earliest as u64)
                    .map(|bucket| bucket.value().get(ClusterEvent::Pass))
                    .unwrap_or(0) as f64
            } else {
                0.0
            };
            if current_pass + borrowed + acquire as f64 - expiring <= max_count {
                self.future
                    .current_bucket(now + wait_ms)
                    .value()
                    .add(ClusterEvent::Pass, acquire as u64);
                self.add(ClusterEvent::OccupiedPass, acquire as u64);
                return wait_ms;
            }
            earliest += window_ms as i64;
            current_pass -= expiring;
            idx += 1;
        }
        0
    }
}

#[derive(Debug)]
struct UnaryBucket(AtomicU64);

impl RingBucket for UnaryBucket {
    fn new_empty() -> Self {
        UnaryBucket(AtomicU64::new(0))
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Plain QPS gate over a sliding window.
#[derive(Debug)]
pub struct RequestLimiter {
    ring: BucketRing<UnaryBucket>,
    qps_allowed: f64,
}

impl RequestLimiter {
    pub fn new(qps_allowed: f64) -> Self {
        Self {
            ring: BucketRing::new(10, 1000),
            qps_allowed,
        }
    }

    pub fn add(&self, count: u64) {
        self.ring
            .current_bucket(now_ms())
            .value()
            .0
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn sum(&self) -> u64 {
        let now = now_ms();
        self.ring.current_bucket(now);
        let mut total = 0;
        self.ring
            .for_each_valid(now, |bucket| total += bucket.0.load(Ordering::Relaxed));
        total
    }

    pub fn qps(&self) -> f64 {
        self.sum() as f64 / self.ring.interval_sec()
    }

    pub fn qps_allowed(&self) -> f64 {
        self.qps_allowed
    }

    pub fn can_pass(&self) -> bool {
        self.qps() + 1.0 <= self.qps_allowed
    }

    pub fn try_pass(&self) -> bool {
        if self.can_pass() {
            self.add(1);
            return true;
        }
        false
    }
}

struct FlowEntry {
    rule: FlowRule,
    namespace: String,
    metric: Arc<ClusterMetric>,
    connected_count: AtomicU64,
}

struct ParamEntry {
    namespace: String,
    active: Arc<ActiveParamRule>,
}

/// In-process token server. Peers reach it through whatever transport the
/// embedding application provides; the flow checker reaches it directly.
pub struct DefaultEmbeddedTokenServer {
    config: RwLock<ServerFlowConfig>,
    flow_rules: RwLock<Arc<HashMap<u64, Arc<FlowEntry>>>>,
    param_rules: RwLock<Arc<HashMap<u64, Arc<ParamEntry>>>>,
    limiters: RwLock<Arc<HashMap<String, Arc<RequestLimiter>>>>,
    running: AtomicBool,
}

impl Default for DefaultEmbeddedTokenServer {
    fn default() -> Self {
        Self::new(ServerFlowConfig::default())
    }
}

impl DefaultEmbeddedTokenServer {
    pub fn new(config: ServerFlowConfig) -> Self {
        Self {
            config: RwLock::new(config),
            flow_rules: RwLock::new(Arc::new(HashMap::new())),
            param_rules: RwLock::new(Arc::new(HashMap::new())),
            limiters: RwLock::new(Arc::new(HashMap::new())),
            running: AtomicBool::new(false),
        }
    }

    pub fn update_config(&self, config: ServerFlowConfig) {
        *self.config.write() = config;
    }

    /// Register the cluster flow rules this server arbitrates for a
    /// namespace. Rules without cluster config are skipped.
    pub fn load_cluster_flow_rules(&self, namespace: &str, rules: Vec<FlowRule>) {
        let config = self.config.read().clone();
        let mut next = HashMap::clone(&self.flow_rules.read());
        next.retain(|_, entry| entry.namespace != namespace);
        for rule in rules {
            let Some(cluster_config) = rule.cluster_config.as_ref() else {
                log::warn!(
                    "skipping cluster flow rule without cluster config for `{}`",
                    rule.resource
                );
                continue;
            };
            let flow_id = cluster_config.flow_id;
            next.insert(
                flow_id,
                Arc::new(FlowEntry {
                    rule,
                    namespace: namespace.to_owned(),
                    metric: Arc::new(ClusterMetric::new(config.sample_count, config.interval_ms)),
                    connected_count: AtomicU64::new(1),
                }),
            );
        }
        *self.flow_rules.write() = Arc::new(next);
        self.ensure_limiter(namespace);
    }

    /// Register cluster parameter rules for a namespace.
    pub fn load_cluster_param_rules(&self, namespace: &str, rules: Vec<ParamFlowRule>) {
        let mut next = HashMap::clone(&self.param_rules.read());
        next.retain(|_, entry| entry.namespace != namespace);
        for rule in rules {
            let Some(cluster_config) = rule.cluster_config.as_ref() else {
                log::warn!(
                    "skipping cluster param rule without cluster config for `{}`",
                    rule.resource
                );
                continue;
            };
            let flow_id = cluster_config.flow_id;
            next.insert(
                flow_id,
                Arc::new(ParamEntry {
                    namespace: namespace.to_owned(),
                    active: Arc::new(ActiveParamRule::new(rule)),
                }),
            );
        }
        *self.param_rules.write() = Arc::new(next);
        self.ensure_limiter(namespace);
    }

    /// Number of client nodes currently attached for a flow, used by the
    /// per-node threshold mode.
    pub fn set_connected_count(&self, flow_id: u64, count: u64) {
        if let Some(entry) = self.flow_rules.read().get(&flow_id) {
            entry.connected_count.store(count.max(1), Ordering::Relaxed);
        }
    }

    fn ensure_limiter(&self, namespace: &str) {
        if self.limiters.read().contains_key(namespace) {
            return;
        }
        let allowed = self.config.read().max_allowed_qps;
        let mut guard = self.limiters.write();
        if guard.contains_key(namespace) {
            return;
        }
        let mut next = HashMap::clone(&guard);
        next.insert(
            namespace.to_owned(),
            Arc::new(RequestLimiter::new(allowed)),
        );
        *guard = Arc::new(next);
    }

    fn allow_proceed(&self, namespace: &str) -> bool {
        match self.limiters.read().get(namespace) {
            Some(limiter) => limiter.try_pass(),
            None => true,
        }
    }

    fn global_threshold(&self, entry: &FlowEntry) -> f64 {
        let count = entry.rule.count;
        let threshold_type = entry
            .rule
            .cluster_config
            .as_ref()
            .map(|config| config.threshold_type)
            .unwrap_or_default();
        match threshold_type {
            ClusterThresholdType::Global => count,
            ClusterThresholdType::AvgLocal => {
                count * entry.connected_count.load(Ordering::Relaxed) as f64
            }
        }
    }

    fn acquire_flow_token(
        &self,
        entry: &FlowEntry,
        acquire: u32,
        prioritized: bool,
    ) -> TokenResult {
        let config = self.config.read().clone();
        let metric = &entry.metric;
        let latest_qps = metric.avg(ClusterEvent::PassRequest);
        let global_threshold = self.global_threshold(entry) * config.exceed_count;
        let next_remaining = global_threshold - latest_qps - acquire as f64;

        if next_remaining >= 0.0 {
            metric.add(ClusterEvent::Pass, acquire as u64);
            metric.add(ClusterEvent::PassRequest, 1);
            if prioritized {
                metric.add(ClusterEvent::OccupiedPass, acquire as u64);
            }
            return TokenResult::ok(next_remaining as i64);
        }

        if prioritized {
            let occupy_avg = metric.waiting_avg();
            if occupy_avg <= config.max_occupy_ratio * global_threshold {
                let wait_ms = metric.try_occupy_next(acquire, global_threshold);
                if wait_ms > 0 {
                    log::debug!("cluster flow {} queued for {wait_ms} ms", flow_label(entry));
                    return TokenResult::should_wait(wait_ms);
                }
            }
        }

        metric.add(ClusterEvent::Block, acquire as u64);
        metric.add(ClusterEvent::BlockRequest, 1);
        TokenResult::blocked()
    }
}

fn flow_label(entry: &FlowEntry) -> u64 {
    entry
        .rule
        .cluster_config
        .as_ref()
        .map(|config| config.flow_id)
        .unwrap_or_default()
}

impl TokenService for DefaultEmbeddedTokenServer {
    fn request_token(
        &self,
        flow_id: u64,
        count: u32,
        prioritized: bool,
    ) -> Result<TokenResult, TokenServiceError> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(TokenResult::new(TokenStatus::Fail));
        }
        if count == 0 {
            return Ok(TokenResult::new(TokenStatus::BadRequest));
        }
        let Some(entry) = self.flow_rules.read().get(&flow_id).cloned() else {
            return Ok(TokenResult::new(TokenStatus::NoRuleExists));
        };
        if !self.allow_proceed(&entry.namespace) {
            return Ok(TokenResult::new(TokenStatus::TooManyRequests));
        }
        Ok(self.acquire_flow_token(&entry, count, prioritized))
    }

    fn request_param_token(
        &self,
        flow_id: u64,
        count: u32,
        params: &[ParamValue],
    ) -> Result<TokenResult, TokenServiceError> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(TokenResult::new(TokenStatus::Fail));
        }
        if count == 0 || params.is_empty() {
            return Ok(TokenResult::new(TokenStatus::BadRequest));
        }
        let Some(entry) = self.param_rules.read().get(&flow_id).cloned() else {
            return Ok(TokenResult::new(TokenStatus::NoRuleExists));
        };
        if !self.allow_proceed(&entry.namespace) {
            return Ok(TokenResult::new(TokenStatus::TooManyRequests));
        }
        for value in params {
            if !crate::slots::param_flow::server_token_check(&entry.active, count, value) {
                return Ok(TokenResult::blocked());
            }
        }
        Ok(TokenResult::ok(0))
    }
}

impl EmbeddedTokenServer for DefaultEmbeddedTokenServer {
    fn start(&self) -> Result<(), TokenServiceError> {
        self.running.store(true, Ordering::Release);
        log::info!("embedded token server started");
        Ok(())
    }

    fn stop(&self) -> Result<(), TokenServiceError> {
        self.running.store(false, Ordering::Release);
        log::info!("embedded token server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterFlowConfig;
    use crate::slots::flow::FlowRule as LocalFlowRule;

    fn server_with_rule(flow_id: u64, count: f64) -> DefaultEmbeddedTokenServer {
        let server = DefaultEmbeddedTokenServer::default();
        server.load_cluster_flow_rules(
            DEFAULT_NAMESPACE,
            vec![LocalFlowRule::qps("cluster.server.res", count)
                .with_cluster(ClusterFlowConfig::new(flow_id))],
        );
        let _ = EmbeddedTokenServer::start(&server);
        server
    }

    #[test]
    fn tokens_run_out_at_the_global_threshold() {
        let server = server_with_rule(101, 3.0);
        for _ in 0..3 {
            let result = server.request_token(101, 1, false).unwrap();
            assert_eq!(result.status, TokenStatus::Ok);
        }
        let result = server.request_token(101, 1, false).unwrap();
        assert_eq!(result.status, TokenStatus::Blocked);
    }

    #[test]
    fn unknown_flow_reports_no_rule() {
        let server = server_with_rule(102, 3.0);
        let result = server.request_token(9999, 1, false).unwrap();
        assert_eq!(result.status, TokenStatus::NoRuleExists);
    }

    #[test]
    fn stopped_server_fails_requests() {
        let server = server_with_rule(103, 3.0);
        let _ = EmbeddedTokenServer::stop(&server);
        let result = server.request_token(103, 1, false).unwrap();
        assert_eq!(result.status, TokenStatus::Fail);
    }

    #[test]
    fn prioritized_overflow_reserves_the_next_window() {
        let server = server_with_rule(104, 2.0);
        for _ in 0..2 {
            assert_eq!(
                server.request_token(104, 1, false).unwrap().status,
                TokenStatus::Ok
            );
        }
        let result = server.request_token(104, 1, true).unwrap();
        assert_eq!(result.status, TokenStatus::ShouldWait);
        assert!(result.wait_ms > 0);
    }

    #[test]
    fn request_limiter_caps_namespace_traffic() {
        let limiter = RequestLimiter::new(5.0);
        let mut passed = 0;
        for _ in 0..10 {
            if limiter.try_pass() {
                passed += 1;
            }
        }
        assert_eq!(passed, 5);
    }

    #[test]
    fn connected_count_scales_per_node_thresholds() {
        let server = server_with_rule(105, 1.0);
        server.set_connected_count(105, 3);
        for _ in 0..3 {
            assert_eq!(
                server.request_token(105, 1, false).unwrap().status,
                TokenStatus::Ok
            );
        }
        assert_eq!(
            server.request_token(105, 1, false).unwrap().status,
            TokenStatus::Blocked
        );
    }
}
