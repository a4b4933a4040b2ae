//! In-process traffic governance.
//!
//! Every protected call passes through a per-resource pipeline of checks;
//! a failing check rejects the call with a typed [`BlockError`], and
//! admitted calls feed the sliding-window statistics future checks consult.
//!
//! ```no_run
//! use tollgate::{entry, load_flow_rules, FlowRule};
//!
//! load_flow_rules(vec![FlowRule::qps("orders.create", 100.0)]);
//!
//! match entry("orders.create") {
//!     Ok(admitted) => {
//!         // ... protected work ...
//!         let _ = admitted.exit();
//!     }
//!     Err(blocked) => {
//!         // shed load: the rejection is already counted
//!         let _ = blocked;
//!     }
//! }
//! ```
#![deny(unused_must_use)]

pub mod api;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod node;
pub mod resource;
pub mod slots;
pub mod stat;
mod timer;
pub mod value;

pub use api::{
    async_entry, chain_count, entry, entry_with, entry_with_priority, protect, protect_with,
    protect_with_fallback, try_entry, TracePolicy,
};
pub use cluster::client::{
    DefaultClusterTokenClient, TokenRequest, TokenRequestKind, TokenTransport,
};
pub use cluster::server::{
    DefaultEmbeddedTokenServer, RequestLimiter, ServerFlowConfig, DEFAULT_NAMESPACE,
};
pub use cluster::{
    apply_state, cluster_state, is_client, is_server, register_token_client,
    register_token_server, ClusterFlowConfig, ClusterState, ClusterThresholdType,
    ClusterTokenClient, EmbeddedTokenServer, TokenResult, TokenService, TokenServiceError,
    TokenStatus,
};
pub use context::{
    current_context_name, enter_context, enter_context_with_origin, exit_context, Context,
};
pub use entry::{AsyncEntry, Entry};
pub use error::{BlockError, BlockKind, EntryError, ProtectError};
pub use node::{global_inbound_node, ClusterNode, DefaultNode, EntranceNode, StatisticNode};
pub use resource::{ResourceId, TrafficDirection};
pub use slots::authority::{
    authority_rules_of_resource, load_authority_rules, AuthorityRule, AuthorityStrategy,
};
pub use slots::cluster_builder::{cluster_node, cluster_node_map};
pub use slots::degrade::{degrade_rules_of_resource, load_degrade_rules, DegradeGrade, DegradeRule};
pub use slots::flow::{
    flow_rules_of_resource, load_flow_rules, ControlBehavior, FlowGrade, FlowRule, FlowStrategy,
};
pub use slots::param_flow::{
    load_param_flow_rules, param_flow_rules_of_resource, ParamControlBehavior, ParamFlowItem,
    ParamFlowRule,
};
pub use slots::system::{
    load_system_rules, set_system_probe, system_rules, ProcSystemProbe, SystemProbe, SystemRule,
    SystemTrigger,
};
pub use stat::{MetricSample, SlidingMetric};
pub use value::ParamValue;

#[cfg(test)]
pub(crate) mod test_support {
    use parking_lot::{Mutex, MutexGuard};

    static RULE_ENV: Mutex<()> = Mutex::new(());

    /// Tests that load global rule sets serialize on this lock so they do
    /// not clobber each other's registries mid-flight.
    pub(crate) fn rule_env_lock() -> MutexGuard<'static, ()> {
        RULE_ENV.lock()
    }
}
