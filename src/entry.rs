//! Scoped admission handles.

use crate::clock::now_ms;
use crate::context::{self, Context};
use crate::error::EntryError;
use crate::node::{global_inbound_node, DefaultNode, StatisticNode};
use crate::resource::ResourceId;
use crate::slots::SlotChain;
use crate::value::ParamValue;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What went wrong while an entry was held; decides the exit bookkeeping.
#[derive(Debug, Clone)]
pub(crate) enum EntryFault {
    /// Admission was denied; the call never ran, thread count was never
    /// incremented.
    Blocked(String),
    /// The protected code failed; the call ran and still owns a thread
    /// count.
    App(String),
}

pub(crate) struct EntryInner {
    resource: ResourceId,
    created_ms: u64,
    chain: Option<Arc<SlotChain>>,
    context: Mutex<Option<Context>>,
    cur_node: RwLock<Option<Arc<DefaultNode>>>,
    origin_node: RwLock<Option<Arc<StatisticNode>>>,
    parent: Mutex<Option<Arc<EntryInner>>>,
    fault: Mutex<Option<EntryFault>>,
    exited: AtomicBool,
}

// Entries and contexts reference each other; a compact Debug keeps the
// cycle out of formatting.
impl fmt::Debug for EntryInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("resource", &self.resource.name())
            .field("created_ms", &self.created_ms)
            .field("exited", &self.exited.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EntryInner {
    /// Create the entry and push it onto the context's stack. Entries under
    /// the null context stay unlinked.
    pub(crate) fn new_linked(
        resource: ResourceId,
        chain: Option<Arc<SlotChain>>,
        ctx: &Context,
    ) -> Arc<Self> {
        let inner = Arc::new(Self {
            resource,
            created_ms: now_ms(),
            chain,
            context: Mutex::new(Some(ctx.clone())),
            cur_node: RwLock::new(None),
            origin_node: RwLock::new(None),
            parent: Mutex::new(None),
            fault: Mutex::new(None),
            exited: AtomicBool::new(false),
        });
        if !ctx.is_null() {
            *inner.parent.lock() = ctx.cur_entry();
            ctx.set_cur_entry(Some(Arc::clone(&inner)));
        }
        inner
    }

    pub(crate) fn resource(&self) -> &ResourceId {
        &self.resource
    }

    pub(crate) fn created_ms(&self) -> u64 {
        self.created_ms
    }

    pub(crate) fn parent(&self) -> Option<Arc<EntryInner>> {
        self.parent.lock().clone()
    }

    pub(crate) fn cur_node(&self) -> Option<Arc<DefaultNode>> {
        self.cur_node.read().clone()
    }

    pub(crate) fn set_cur_node(&self, node: Arc<DefaultNode>) {
        *self.cur_node.write() = Some(node);
    }

    pub(crate) fn origin_node(&self) -> Option<Arc<StatisticNode>> {
        self.origin_node.read().clone()
    }

    pub(crate) fn set_origin_node(&self, node: Arc<StatisticNode>) {
        *self.origin_node.write() = Some(node);
    }

    pub(crate) fn fault(&self) -> Option<EntryFault> {
        self.fault.lock().clone()
    }

    pub(crate) fn set_fault(&self, fault: EntryFault) {
        let mut slot = self.fault.lock();
        if slot.is_none() {
            *slot = Some(fault);
        }
    }

    pub(crate) fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Detach from the creating context and re-home onto a detached copy,
    /// so the caller's stack no longer waits on this entry.
    pub(crate) fn rehome_for_async(self: &Arc<Self>, ctx: &Context) -> Context {
        let async_ctx = ctx.detached_copy();
        async_ctx.set_cur_entry(Some(Arc::clone(self)));
        ctx.set_cur_entry(self.parent.lock().clone());
        *self.context.lock() = Some(async_ctx.clone());
        async_ctx
    }

    /// Record an application error: exception QPS on this call's node, its
    /// origin node, and the global inbound aggregate for inbound traffic.
    pub(crate) fn record_exception(&self, count: u64) {
        if let Some(node) = self.cur_node() {
            node.add_exception(count);
        }
        if let Some(origin) = self.origin_node() {
            origin.add_exception(count);
        }
        if self.resource.is_inbound() {
            global_inbound_node().stats().add_exception(count);
        }
    }

    /// Release the entry. Must match the top of its context's stack; on a
    /// mismatch the whole stack is unwound and the fault surfaced.
    pub(crate) fn exit(self: &Arc<Self>, count: u32, args: &[ParamValue]) -> Result<(), EntryError> {
        if self.is_exited() {
            return Ok(());
        }
        let Some(ctx) = self.context.lock().clone() else {
            self.exited.store(true, Ordering::Release);
            return Ok(());
        };
        if ctx.is_null() {
            *self.context.lock() = None;
            self.exited.store(true, Ordering::Release);
            return Ok(());
        }

        match ctx.cur_entry() {
            Some(top) if Arc::ptr_eq(&top, self) => {
                if let Some(chain) = &self.chain {
                    chain.exit(&ctx, &self.resource, count, args);
                }
                let parent = self.parent.lock().clone();
                ctx.set_cur_entry(parent.clone());
                if parent.is_none() {
                    context::auto_exit_if_default(&ctx);
                }
                *self.context.lock() = None;
                self.exited.store(true, Ordering::Release);
                Ok(())
            }
            top => {
                let top_name = top
                    .as_ref()
                    .map(|t| t.resource.name().to_owned())
                    .unwrap_or_default();
                // Unwind everything so the context is usable again; each
                // unwound entry matches the top when its turn comes.
                let mut cursor = top;
                while let Some(entry) = cursor {
                    let parent = entry.parent();
                    let _ = entry.exit(count, args);
                    cursor = parent;
                }
                self.exited.store(true, Ordering::Release);
                log::warn!(
                    "entry for `{}` released out of order (stack top was `{top_name}`); unwound",
                    self.resource.name()
                );
                Err(EntryError::OutOfOrder {
                    releasing: self.resource.name().to_owned(),
                    stack_top: top_name,
                })
            }
        }
    }
}

/// Handle for one admitted call. Release it with [`Entry::exit`]; dropping
/// an unreleased entry exits it as a safety net.
#[derive(Debug)]
pub struct Entry {
    inner: Arc<EntryInner>,
}

impl Entry {
    pub(crate) fn from_inner(inner: Arc<EntryInner>) -> Self {
        Self { inner }
    }

    pub fn resource(&self) -> &ResourceId {
        self.inner.resource()
    }

    pub fn created_ms(&self) -> u64 {
        self.inner.created_ms()
    }

    /// Record an application error against this call: marks the entry so
    /// exit skips the success bookkeeping and counts exception QPS on the
    /// call's nodes.
    pub fn record_error(&self, error: impl fmt::Display) {
        self.inner.set_fault(EntryFault::App(error.to_string()));
        self.inner.record_exception(1);
    }

    pub fn exit(self) -> Result<(), EntryError> {
        self.inner.exit(1, &[])
    }

    pub fn exit_with(self, count: u32, args: &[ParamValue]) -> Result<(), EntryError> {
        self.inner.exit(count, args)
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        if !self.inner.is_exited() {
            if let Err(err) = self.inner.exit(1, &[]) {
                log::warn!("entry dropped while out of order: {err}");
            }
        }
    }
}

/// Handle for an admitted call whose protected work completes elsewhere.
/// Created already unlinked from the caller's context; exit releases it
/// against the context captured at creation.
#[derive(Debug)]
pub struct AsyncEntry {
    inner: Arc<EntryInner>,
}

impl AsyncEntry {
    pub(crate) fn from_inner(inner: Arc<EntryInner>) -> Self {
        Self { inner }
    }

    pub fn resource(&self) -> &ResourceId {
        self.inner.resource()
    }

    pub fn record_error(&self, error: impl fmt::Display) {
        self.inner.set_fault(EntryFault::App(error.to_string()));
        self.inner.record_exception(1);
    }

    pub fn exit(self) -> Result<(), EntryError> {
        self.inner.exit(1, &[])
    }

    pub fn exit_with(self, count: u32, args: &[ParamValue]) -> Result<(), EntryError> {
        self.inner.exit(count, args)
    }
}

impl Drop for AsyncEntry {
    fn drop(&mut self) {
        if !self.inner.is_exited() {
            if let Err(err) = self.inner.exit(1, &[]) {
                log::warn!("async entry dropped while out of order: {err}");
            }
        }
    }
}
