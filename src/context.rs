//! Per-caller ambient state.
//!
//! A context names the entrance through which calls arrive, optionally
//! carries the caller's origin identity, and anchors the entry stack.
//! Contexts live in a thread-local slot; admission outside any named
//! context auto-enters [`crate::config::DEFAULT_CONTEXT_NAME`], which
//! auto-exits when its last entry leaves.

use crate::config::{DEFAULT_CONTEXT_NAME, MAX_CONTEXT_COUNT};
use crate::entry::EntryInner;
use crate::node::{DefaultNode, EntranceNode};
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

const NULL_CONTEXT_NAME: &str = "null_context";

struct ContextInner {
    name: String,
    origin: String,
    /// `None` marks the null context handed out past the context ceiling.
    entrance: Option<Arc<EntranceNode>>,
    cur_entry: Mutex<Option<Arc<EntryInner>>>,
}

/// Handle to one caller's ambient state. Cloning shares the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

// Contexts and entries reference each other; a compact Debug keeps the
// cycle out of formatting.
impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.inner.name)
            .field("origin", &self.inner.origin)
            .field("null", &self.is_null())
            .finish()
    }
}

impl Context {
    fn named(name: &str, origin: &str, entrance: Arc<EntranceNode>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name: name.to_owned(),
                origin: origin.to_owned(),
                entrance: Some(entrance),
                cur_entry: Mutex::new(None),
            }),
        }
    }

    fn null() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name: NULL_CONTEXT_NAME.to_owned(),
                origin: String::new(),
                entrance: None,
                cur_entry: Mutex::new(None),
            }),
        }
    }

    /// A fresh context sharing this one's identity and entrance but with
    /// its own entry slot; used to carry async entries off the caller's
    /// stack.
    pub(crate) fn detached_copy(&self) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name: self.inner.name.clone(),
                origin: self.inner.origin.clone(),
                entrance: self.inner.entrance.clone(),
                cur_entry: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// True when this is the check-bypassing context handed out after the
    /// named-context ceiling was hit.
    pub fn is_null(&self) -> bool {
        self.inner.entrance.is_none()
    }

    pub(crate) fn cur_entry(&self) -> Option<Arc<EntryInner>> {
        self.inner.cur_entry.lock().clone()
    }

    pub(crate) fn set_cur_entry(&self, entry: Option<Arc<EntryInner>>) {
        *self.inner.cur_entry.lock() = entry;
    }

    /// Node the next admission should attach under: the parent entry's
    /// node, or the entrance node at the top of the tree.
    pub(crate) fn last_node(&self) -> Option<Arc<DefaultNode>> {
        if let Some(entry) = self.cur_entry() {
            if let Some(parent) = entry.parent() {
                if let Some(node) = parent.cur_node() {
                    return Some(node);
                }
            }
        }
        self.inner.entrance.as_ref().map(|e| e.node())
    }

    pub(crate) fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Named entrance nodes, capped: past the ceiling callers get the null
/// context and run unprotected rather than growing the node graph without
/// bound.
#[derive(Debug)]
pub(crate) struct EntranceRegistry {
    ceiling: usize,
    machine_root: Arc<EntranceNode>,
    map: RwLock<Arc<HashMap<String, Arc<EntranceNode>>>>,
}

impl EntranceRegistry {
    pub(crate) fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            machine_root: Arc::new(EntranceNode::new("machine-root")),
            map: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub(crate) fn machine_root(&self) -> &Arc<EntranceNode> {
        &self.machine_root
    }

    pub(crate) fn len(&self) -> usize {
        self.map.read().len()
    }

    pub(crate) fn lookup_or_create(&self, name: &str) -> Option<Arc<EntranceNode>> {
        if let Some(entrance) = self.map.read().get(name) {
            return Some(Arc::clone(entrance));
        }
        let mut guard = self.map.write();
        if let Some(entrance) = guard.get(name) {
            return Some(Arc::clone(entrance));
        }
        if guard.len() >= self.ceiling {
            return None;
        }
        let entrance = Arc::new(EntranceNode::new(name));
        self.machine_root.node().add_child(entrance.node());
        let mut next = HashMap::clone(&guard);
        next.insert(name.to_owned(), Arc::clone(&entrance));
        *guard = Arc::new(next);
        Some(entrance)
    }
}

static ENTRANCES: OnceLock<EntranceRegistry> = OnceLock::new();
static NULL_CONTEXT: OnceLock<Context> = OnceLock::new();

pub(crate) fn entrances() -> &'static EntranceRegistry {
    ENTRANCES.get_or_init(|| EntranceRegistry::new(MAX_CONTEXT_COUNT))
}

fn null_context() -> Context {
    NULL_CONTEXT.get_or_init(Context::null).clone()
}

thread_local! {
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Enter (or stay in) a named context with no origin.
pub fn enter_context(name: &str) -> Context {
    enter_context_with_origin(name, "")
}

/// Enter a named context declaring the caller's origin. If the thread is
/// already inside a context, that context is kept as-is.
pub fn enter_context_with_origin(name: &str, origin: &str) -> Context {
    if let Some(existing) = current_context() {
        return existing;
    }
    let ctx = match entrances().lookup_or_create(name) {
        Some(entrance) => Context::named(name, origin, entrance),
        None => {
            log::warn!(
                "named-context ceiling reached; `{name}` gets the null context (checks bypassed)"
            );
            null_context()
        }
    };
    CURRENT.with(|cell| *cell.borrow_mut() = Some(ctx.clone()));
    ctx
}

/// Leave the current context. A context with live entries stays put.
pub fn exit_context() {
    CURRENT.with(|cell| {
        let done = cell
            .borrow()
            .as_ref()
            .is_some_and(|ctx| ctx.cur_entry().is_none());
        if done {
            *cell.borrow_mut() = None;
        }
    });
}

pub fn current_context() -> Option<Context> {
    CURRENT.with(|cell| cell.borrow().clone())
}

pub fn current_context_name() -> Option<String> {
    current_context().map(|ctx| ctx.name().to_owned())
}

/// The default context auto-exits once its last entry has left.
pub(crate) fn auto_exit_if_default(ctx: &Context) {
    if ctx.name() != DEFAULT_CONTEXT_NAME {
        return;
    }
    CURRENT.with(|cell| {
        let done = cell
            .borrow()
            .as_ref()
            .is_some_and(|current| current.same_as(ctx) && current.cur_entry().is_none());
        if done {
            *cell.borrow_mut() = None;
        }
    });
}
