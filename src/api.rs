//! Admission entry points and the per-resource chain registry.

use crate::config::{DEFAULT_CONTEXT_NAME, MAX_CHAIN_COUNT};
use crate::context::{self, Context};
use crate::entry::{AsyncEntry, Entry, EntryInner};
use crate::error::{BlockError, ProtectError};
use crate::resource::ResourceId;
use crate::slots::{SlotChain, SlotSignal};
use crate::value::ParamValue;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

static CHAINS: OnceLock<RwLock<Arc<HashMap<String, Arc<SlotChain>>>>> = OnceLock::new();
static BUILD_LOCK: Mutex<()> = Mutex::new(());

fn chains() -> &'static RwLock<Arc<HashMap<String, Arc<SlotChain>>>> {
    CHAINS.get_or_init(|| RwLock::new(Arc::new(HashMap::new())))
}

/// Number of resources currently carrying a slot chain.
pub fn chain_count() -> usize {
    chains().read().len()
}

/// The chain for a resource, built on first touch. `None` past the cap:
/// such resources run unchecked rather than growing the registry without
/// bound.
fn lookup_chain(resource_name: &str) -> Option<Arc<SlotChain>> {
    if let Some(chain) = chains().read().get(resource_name) {
        return Some(Arc::clone(chain));
    }
    let _guard = BUILD_LOCK.lock();
    if let Some(chain) = chains().read().get(resource_name) {
        return Some(Arc::clone(chain));
    }
    if chains().read().len() >= MAX_CHAIN_COUNT {
        log::warn!(
            "slot chain cap reached; `{resource_name}` will not be rule-checked"
        );
        return None;
    }
    let chain = Arc::new(SlotChain::build_default());
    let mut guard = chains().write();
    let mut next = HashMap::clone(&guard);
    next.insert(resource_name.to_owned(), Arc::clone(&chain));
    *guard = Arc::new(next);
    Some(chain)
}

fn ambient_context() -> Context {
    context::current_context()
        .unwrap_or_else(|| context::enter_context(DEFAULT_CONTEXT_NAME))
}

fn entry_internal(
    resource: ResourceId,
    count: u32,
    prioritized: bool,
    args: &[ParamValue],
) -> Result<Entry, BlockError> {
    let ctx = ambient_context();
    if ctx.is_null() {
        return Ok(Entry::from_inner(EntryInner::new_linked(
            resource, None, &ctx,
        )));
    }
    let chain = lookup_chain(resource.name());
    let inner = EntryInner::new_linked(resource.clone(), chain.clone(), &ctx);
    let Some(chain) = chain else {
        return Ok(Entry::from_inner(inner));
    };
    match chain.entry(&ctx, &resource, count, prioritized, args) {
        // A priority wait is converted to a pass by the statistic slot;
        // nothing upstream of it re-raises the signal.
        Ok(()) | Err(SlotSignal::PriorityWait { .. }) => Ok(Entry::from_inner(inner)),
        Err(SlotSignal::Block(error)) => {
            let _ = inner.exit(count, args);
            Err(error)
        }
    }
}

/// Admit one outbound call against `name`.
pub fn entry(name: &str) -> Result<Entry, BlockError> {
    entry_with(ResourceId::outbound(name), 1, &[])
}

/// Admit `count` units against a resource, passing the call arguments
/// consulted by parameter rules.
pub fn entry_with(
    resource: ResourceId,
    count: u32,
    args: &[ParamValue],
) -> Result<Entry, BlockError> {
    entry_internal(resource, count, false, args)
}

/// Like [`entry_with`], allowing the request to borrow quota from an
/// upcoming window instead of failing at the edge of the current one.
pub fn entry_with_priority(
    resource: ResourceId,
    count: u32,
    args: &[ParamValue],
) -> Result<Entry, BlockError> {
    entry_internal(resource, count, true, args)
}

/// Boolean-style admission: the block is recorded in statistics and
/// dropped.
pub fn try_entry(resource: ResourceId, count: u32, args: &[ParamValue]) -> Option<Entry> {
    match entry_internal(resource, count, false, args) {
        Ok(entry) => Some(entry),
        Err(error) => {
            log::debug!("admission denied: {error}");
            None
        }
    }
}

/// Admit a call whose work completes on another task or thread. The
/// returned handle is already unlinked from this thread's context and
/// exits against the context captured here.
pub fn async_entry(
    resource: ResourceId,
    count: u32,
    args: &[ParamValue],
) -> Result<AsyncEntry, BlockError> {
    let ctx = ambient_context();
    if ctx.is_null() {
        return Ok(AsyncEntry::from_inner(EntryInner::new_linked(
            resource, None, &ctx,
        )));
    }
    let chain = lookup_chain(resource.name());
    let inner = EntryInner::new_linked(resource.clone(), chain.clone(), &ctx);
    let Some(chain) = chain else {
        inner.rehome_for_async(&ctx);
        context::auto_exit_if_default(&ctx);
        return Ok(AsyncEntry::from_inner(inner));
    };
    match chain.entry(&ctx, &resource, count, false, args) {
        Ok(()) | Err(SlotSignal::PriorityWait { .. }) => {
            inner.rehome_for_async(&ctx);
            context::auto_exit_if_default(&ctx);
            Ok(AsyncEntry::from_inner(inner))
        }
        Err(SlotSignal::Block(error)) => {
            let _ = inner.exit(count, args);
            Err(error)
        }
    }
}

/// How [`protect_with`] classifies an application error.
pub struct TracePolicy<E> {
    ignore: Option<Box<dyn Fn(&E) -> bool + Send + Sync>>,
    trace: Option<Box<dyn Fn(&E) -> bool + Send + Sync>>,
}

impl<E> Default for TracePolicy<E> {
    fn default() -> Self {
        Self {
            ignore: None,
            trace: None,
        }
    }
}

impl<E> TracePolicy<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors matching this predicate propagate without being recorded.
    pub fn ignore_when(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.ignore = Some(Box::new(predicate));
        self
    }

    /// Errors matching this predicate are recorded as exceptions; without
    /// a predicate every non-ignored error is.
    pub fn trace_when(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.trace = Some(Box::new(predicate));
        self
    }
}

/// Run `f` under an entry on `resource`, tracing its error as exception
/// QPS before propagating it.
pub fn protect<T, E: fmt::Display>(
    resource: ResourceId,
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, ProtectError<E>> {
    protect_with(resource, TracePolicy::default(), f)
}

/// Run `f` under an entry on `resource`, classifying errors through
/// `policy`: ignored errors propagate unrecorded, traced errors count as
/// exception QPS, everything else propagates untouched.
pub fn protect_with<T, E: fmt::Display>(
    resource: ResourceId,
    policy: TracePolicy<E>,
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, ProtectError<E>> {
    let entry = entry_with(resource, 1, &[]).map_err(ProtectError::Blocked)?;
    match f() {
        Ok(value) => {
            let _ = entry.exit();
            Ok(value)
        }
        Err(error) => {
            let ignored = policy.ignore.as_ref().is_some_and(|p| p(&error));
            if !ignored && policy.trace.as_ref().map_or(true, |p| p(&error)) {
                entry.record_error(&error);
            }
            let _ = entry.exit();
            Err(ProtectError::App(error))
        }
    }
}

/// Like [`protect_with`], recovering traced errors through `fallback`
/// instead of propagating them. Ignored and untraced errors still
/// propagate.
pub fn protect_with_fallback<T, E: fmt::Display>(
    resource: ResourceId,
    policy: TracePolicy<E>,
    f: impl FnOnce() -> Result<T, E>,
    fallback: impl FnOnce(&E) -> T,
) -> Result<T, ProtectError<E>> {
    let entry = entry_with(resource, 1, &[]).map_err(ProtectError::Blocked)?;
    match f() {
        Ok(value) => {
            let _ = entry.exit();
            Ok(value)
        }
        Err(error) => {
            if policy.ignore.as_ref().is_some_and(|p| p(&error)) {
                let _ = entry.exit();
                return Err(ProtectError::App(error));
            }
            if policy.trace.as_ref().map_or(true, |p| p(&error)) {
                entry.record_error(&error);
                let recovered = fallback(&error);
                let _ = entry.exit();
                return Ok(recovered);
            }
            let _ = entry.exit();
            Err(ProtectError::App(error))
        }
    }
}
