//! Fault types surfaced by the admission pipeline.

use crate::slots::authority::AuthorityRule;
use crate::slots::degrade::DegradeRule;
use crate::slots::flow::FlowRule;
use crate::slots::param_flow::ParamFlowRule;
use crate::slots::system::{SystemRule, SystemTrigger};
use crate::value::ParamValue;
use thiserror::Error;

/// Which family of rule denied the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Flow,
    Degrade,
    ParamFlow,
    Authority,
    System,
}

/// Typed rejection returned instead of an entry. Carries a snapshot of the
/// rule that fired so callers can report or branch on it.
#[derive(Debug, Clone, Error)]
pub enum BlockError {
    #[error("flow rule rejected `{resource}`")]
    Flow { resource: String, rule: FlowRule },
    #[error("circuit breaker open for `{resource}`")]
    Degrade { resource: String, rule: DegradeRule },
    #[error("hot parameter limit hit on `{resource}`")]
    ParamFlow {
        resource: String,
        rule: ParamFlowRule,
        /// The argument value that tripped the limit, when one is known.
        param: Option<ParamValue>,
    },
    #[error("origin `{origin}` denied on `{resource}`")]
    Authority {
        resource: String,
        rule: AuthorityRule,
        origin: String,
    },
    #[error("system guard {trigger} rejected inbound `{resource}`")]
    System {
        resource: String,
        rule: SystemRule,
        trigger: SystemTrigger,
    },
}

impl BlockError {
    pub fn kind(&self) -> BlockKind {
        match self {
            Self::Flow { .. } => BlockKind::Flow,
            Self::Degrade { .. } => BlockKind::Degrade,
            Self::ParamFlow { .. } => BlockKind::ParamFlow,
            Self::Authority { .. } => BlockKind::Authority,
            Self::System { .. } => BlockKind::System,
        }
    }

    pub fn resource(&self) -> &str {
        match self {
            Self::Flow { resource, .. }
            | Self::Degrade { resource, .. }
            | Self::ParamFlow { resource, .. }
            | Self::Authority { resource, .. }
            | Self::System { resource, .. } => resource,
        }
    }

    /// The parameter value that triggered a hot-key rejection, if any.
    pub fn triggered_param(&self) -> Option<&ParamValue> {
        match self {
            Self::ParamFlow { param, .. } => param.as_ref(),
            _ => None,
        }
    }
}

/// Programmer errors in entry lifecycle handling.
#[derive(Debug, Clone, Error)]
pub enum EntryError {
    #[error(
        "entry for `{releasing}` released out of order; the stack top was `{stack_top}`"
    )]
    OutOfOrder {
        releasing: String,
        stack_top: String,
    },
}

/// Result of a protected closure: either admission was denied or the
/// application code itself failed.
#[derive(Debug)]
pub enum ProtectError<E> {
    Blocked(BlockError),
    App(E),
}

impl<E: std::fmt::Display> std::fmt::Display for ProtectError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocked(err) => write!(f, "{err}"),
            Self::App(err) => write!(f, "protected call failed: {err}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for ProtectError<E> {}

impl<E> ProtectError<E> {
    pub fn blocked(&self) -> Option<&BlockError> {
        match self {
            Self::Blocked(err) => Some(err),
            Self::App(_) => None,
        }
    }

    pub fn into_app(self) -> Option<E> {
        match self {
            Self::Blocked(_) => None,
            Self::App(err) => Some(err),
        }
    }
}
