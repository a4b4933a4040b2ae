//! Origin-based allow/deny.

use crate::context::Context;
use crate::error::BlockError;
use crate::node::DefaultNode;
use crate::resource::ResourceId;
use crate::slots::{Next, ProcessorSlot, SlotResult, SlotSignal};
use crate::value::ParamValue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorityStrategy {
    /// Only listed origins may pass.
    #[default]
    White,
    /// Listed origins are rejected.
    Black,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityRule {
    pub resource: String,
    /// Comma-separated origin names the strategy applies to.
    pub limit_origin: String,
    #[serde(default)]
    pub strategy: AuthorityStrategy,
}

impl AuthorityRule {
    pub fn allow_only(resource: impl Into<String>, origins: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            limit_origin: origins.into(),
            strategy: AuthorityStrategy::White,
        }
    }

    pub fn deny(resource: impl Into<String>, origins: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            limit_origin: origins.into(),
            strategy: AuthorityStrategy::Black,
        }
    }
}

/// An anonymous caller or an empty list gives the rule nothing to judge.
pub(crate) fn pass_check(rule: &AuthorityRule, origin: &str) -> bool {
    if origin.is_empty() || rule.limit_origin.is_empty() {
        return true;
    }
    let listed = rule
        .limit_origin
        .split(',')
        .any(|candidate| candidate.trim() == origin);
    match rule.strategy {
        AuthorityStrategy::Black => !listed,
        AuthorityStrategy::White => listed,
    }
}

static RULES: OnceLock<RwLock<Arc<HashMap<String, Arc<Vec<AuthorityRule>>>>>> = OnceLock::new();

fn rules() -> &'static RwLock<Arc<HashMap<String, Arc<Vec<AuthorityRule>>>>> {
    RULES.get_or_init(|| RwLock::new(Arc::new(HashMap::new())))
}

/// Replace the active authority rule set.
pub fn load_authority_rules(new_rules: Vec<AuthorityRule>) {
    let mut grouped: HashMap<String, Vec<AuthorityRule>> = HashMap::new();
    for rule in new_rules {
        grouped.entry(rule.resource.clone()).or_default().push(rule);
    }
    let snapshot: HashMap<String, Arc<Vec<AuthorityRule>>> = grouped
        .into_iter()
        .map(|(resource, list)| (resource, Arc::new(list)))
        .collect();
    *rules().write() = Arc::new(snapshot);
}

pub fn authority_rules_of_resource(resource_name: &str) -> Vec<AuthorityRule> {
    rules()
        .read()
        .get(resource_name)
        .map(|list| list.to_vec())
        .unwrap_or_default()
}

pub(crate) struct AuthoritySlot;

impl ProcessorSlot for AuthoritySlot {
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
        if let Some(list) = rules().read().get(resource.name()).cloned() {
            for rule in list.iter() {
                if !pass_check(rule, ctx.origin()) {
                    return Err(SlotSignal::Block(BlockError::Authority {
                        resource: resource.name().to_owned(),
                        rule: rule.clone(),
                        origin: ctx.origin().to_owned(),
                    }));
                }
            }
        }
        next.entry(ctx, resource, node, count, prioritized, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn white_list_requires_membership() {
        let rule = AuthorityRule::allow_only("auth.res", "app-a,app-b");
        assert!(pass_check(&rule, "app-a"));
        assert!(pass_check(&rule, "app-b"));
        assert!(!pass_check(&rule, "app-c"));
    }

    #[test]
    fn black_list_rejects_members() {
        let rule = AuthorityRule::deny("auth.res", "bad-app");
        assert!(!pass_check(&rule, "bad-app"));
        assert!(pass_check(&rule, "good-app"));
    }

    #[test]
    fn matching_is_exact_not_substring() {
        let rule = AuthorityRule::allow_only("auth.res", "app-one");
        assert!(!pass_check(&rule, "app"));
        assert!(!pass_check(&rule, "app-one-two"));
    }

    #[test]
    fn anonymous_origin_always_passes() {
        let rule = AuthorityRule::allow_only("auth.res", "app-a");
        assert!(pass_check(&rule, ""));
    }
}
