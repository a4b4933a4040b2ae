//! Global inbound guard: process-wide caps checked against the global
//! inbound node and a host probe.
//!
//! The probe samples `/proc` lazily on the caller's thread with a cached
//! reading, so no sampler thread is needed; CPU usage comes from deltas
//! between consecutive `/proc/stat` snapshots.

use crate::context::Context;
use crate::error::BlockError;
use crate::node::{global_inbound_node, DefaultNode};
use crate::resource::ResourceId;
use crate::slots::{Next, ProcessorSlot, SlotResult, SlotSignal};
use crate::value::ParamValue;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Which cap rejected the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemTrigger {
    ThreadCount,
    AvgRt,
    InboundQps,
    Load,
    Cpu,
}

impl fmt::Display for SystemTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ThreadCount => "thread-count",
            Self::AvgRt => "avg-rt",
            Self::InboundQps => "inbound-qps",
            Self::Load => "load",
            Self::Cpu => "cpu",
        };
        f.write_str(name)
    }
}

fn disabled() -> f64 {
    -1.0
}

/// Process-wide caps. A negative value disables that cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemRule {
    #[serde(default = "disabled")]
    pub highest_system_load: f64,
    /// CPU usage in `0..1`.
    #[serde(default = "disabled")]
    pub highest_cpu_usage: f64,
    #[serde(default = "disabled")]
    pub qps: f64,
    #[serde(default = "disabled")]
    pub avg_rt_ms: f64,
    #[serde(default = "disabled")]
    pub max_thread: f64,
}

impl Default for SystemRule {
    fn default() -> Self {
        Self {
            highest_system_load: disabled(),
            highest_cpu_usage: disabled(),
            qps: disabled(),
            avg_rt_ms: disabled(),
            max_thread: disabled(),
        }
    }
}

impl SystemRule {
    pub fn with_qps(mut self, qps: f64) -> Self {
        self.qps = qps;
        self
    }

    pub fn with_max_thread(mut self, max_thread: f64) -> Self {
        self.max_thread = max_thread;
        self
    }

    pub fn with_avg_rt_ms(mut self, avg_rt_ms: f64) -> Self {
        self.avg_rt_ms = avg_rt_ms;
        self
    }

    pub fn with_highest_system_load(mut self, load: f64) -> Self {
        self.highest_system_load = load;
        self
    }

    pub fn with_highest_cpu_usage(mut self, usage: f64) -> Self {
        self.highest_cpu_usage = usage;
        self
    }
}

/// Host readings consulted by the load and CPU caps. Failures disable
/// those caps rather than blocking traffic.
pub trait SystemProbe: Send + Sync {
    fn load_average(&self) -> Option<f64>;
    /// CPU usage in `0..1`.
    fn cpu_usage(&self) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, Default)]
struct CpuTick {
    idle: u64,
    total: u64,
}

#[derive(Debug, Default)]
struct ProcSample {
    taken_at: Option<Instant>,
    load_average: Option<f64>,
    cpu_usage: Option<f64>,
    last_tick: Option<CpuTick>,
}

/// Reads `/proc/loadavg` and `/proc/stat`, refreshing at most once per
/// second on whichever caller arrives first.
#[derive(Debug, Default)]
pub struct ProcSystemProbe {
    sample: Mutex<ProcSample>,
}

const PROBE_REFRESH: Duration = Duration::from_secs(1);

impl ProcSystemProbe {
    fn refresh(&self) -> (Option<f64>, Option<f64>) {
        let mut sample = self.sample.lock();
        let fresh = sample
            .taken_at
            .is_some_and(|at| at.elapsed() < PROBE_REFRESH);
        if !fresh {
            sample.load_average = read_load_avg_1m();
            let tick = read_cpu_tick();
            sample.cpu_usage = match (sample.last_tick, tick) {
                (Some(prev), Some(cur)) => cpu_usage_between(prev, cur),
                _ => None,
            };
            if tick.is_some() {
                sample.last_tick = tick;
            }
            sample.taken_at = Some(Instant::now());
        }
        (sample.load_average, sample.cpu_usage)
    }
}

impl SystemProbe for ProcSystemProbe {
    fn load_average(&self) -> Option<f64> {
        self.refresh().0
    }

    fn cpu_usage(&self) -> Option<f64> {
        self.refresh().1
    }
}

fn read_load_avg_1m() -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/loadavg").ok()?;
    contents.split_whitespace().next()?.parse().ok()
}

fn read_cpu_tick() -> Option<CpuTick> {
    let contents = std::fs::read_to_string("/proc/stat").ok()?;
    let line = contents.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|field| field.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait count as idle time.
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some(CpuTick { idle, total })
}

fn cpu_usage_between(prev: CpuTick, cur: CpuTick) -> Option<f64> {
    let total = cur.total.checked_sub(prev.total)?;
    if total == 0 {
        return None;
    }
    let idle = cur.idle.saturating_sub(prev.idle);
    Some(1.0 - idle as f64 / total as f64)
}

static PROBE: OnceLock<RwLock<Arc<dyn SystemProbe>>> = OnceLock::new();

fn probe() -> &'static RwLock<Arc<dyn SystemProbe>> {
    PROBE.get_or_init(|| RwLock::new(Arc::new(ProcSystemProbe::default())))
}

/// Swap the host probe, e.g. for tests or platforms without `/proc`.
pub fn set_system_probe(new_probe: Arc<dyn SystemProbe>) {
    *probe().write() = new_probe;
}

static RULES: OnceLock<RwLock<Arc<Vec<SystemRule>>>> = OnceLock::new();

fn rules() -> &'static RwLock<Arc<Vec<SystemRule>>> {
    RULES.get_or_init(|| RwLock::new(Arc::new(Vec::new())))
}

/// Replace the active system rule set. These caps are global, not
/// per-resource.
pub fn load_system_rules(new_rules: Vec<SystemRule>) {
    *rules().write() = Arc::new(new_rules);
}

pub fn system_rules() -> Vec<SystemRule> {
    rules().read().to_vec()
}

fn enabled(cap: f64) -> bool {
    cap >= 0.0
}

pub(crate) fn check_system(resource: &ResourceId, count: u32) -> Result<(), BlockError> {
    if !resource.is_inbound() {
        return Ok(());
    }
    let snapshot = rules().read().clone();
    if snapshot.is_empty() {
        return Ok(());
    }
    let global = global_inbound_node().stats();
    for rule in snapshot.iter() {
        if enabled(rule.max_thread) && global.cur_thread_num() as f64 > rule.max_thread {
            return Err(block(resource, rule, SystemTrigger::ThreadCount));
        }
        if enabled(rule.avg_rt_ms) && global.avg_rt() > rule.avg_rt_ms {
            return Err(block(resource, rule, SystemTrigger::AvgRt));
        }
        if enabled(rule.qps) && global.pass_qps() + count as f64 > rule.qps {
            return Err(block(resource, rule, SystemTrigger::InboundQps));
        }
        if enabled(rule.highest_system_load) {
            if let Some(load) = probe().read().load_average() {
                if load > rule.highest_system_load {
                    return Err(block(resource, rule, SystemTrigger::Load));
                }
            }
        }
        if enabled(rule.highest_cpu_usage) {
            if let Some(usage) = probe().read().cpu_usage() {
                if usage > rule.highest_cpu_usage {
                    return Err(block(resource, rule, SystemTrigger::Cpu));
                }
            }
        }
    }
    Ok(())
}

fn block(resource: &ResourceId, rule: &SystemRule, trigger: SystemTrigger) -> BlockError {
    BlockError::System {
        resource: resource.name().to_owned(),
        rule: rule.clone(),
        trigger,
    }
}

pub(crate) struct SystemSlot;

impl ProcessorSlot for SystemSlot {
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
        check_system(resource, count).map_err(SlotSignal::Block)?;
        next.entry(ctx, resource, node, count, prioritized, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe {
        load: f64,
        cpu: f64,
    }

    impl SystemProbe for FixedProbe {
        fn load_average(&self) -> Option<f64> {
            Some(self.load)
        }

        fn cpu_usage(&self) -> Option<f64> {
            Some(self.cpu)
        }
    }

    #[test]
    fn outbound_resources_skip_the_guard() {
        let result = check_system(&ResourceId::outbound("sys.out"), 1);
        assert!(result.is_ok());
    }

    #[test]
    fn cpu_usage_is_a_delta_between_ticks() {
        let prev = CpuTick {
            idle: 50,
            total: 100,
        };
        let cur = CpuTick {
            idle: 70,
            total: 200,
        };
        let usage = cpu_usage_between(prev, cur).unwrap();
        assert!((usage - 0.8).abs() < 1e-9);
    }

    #[test]
    fn probe_breach_blocks_inbound() {
        let _guard = crate::test_support::rule_env_lock();
        set_system_probe(Arc::new(FixedProbe {
            load: 9.0,
            cpu: 0.1,
        }));
        load_system_rules(vec![SystemRule::default().with_highest_system_load(2.0)]);

        let err = check_system(&ResourceId::inbound("sys.load"), 1).unwrap_err();
        match err {
            BlockError::System { trigger, .. } => assert_eq!(trigger, SystemTrigger::Load),
            other => panic!("unexpected block: {other:?}"),
        }

        load_system_rules(Vec::new());
        set_system_probe(Arc::new(ProcSystemProbe::default()));
    }
}
