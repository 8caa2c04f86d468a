//! Per-thread context chains.
//!
//! A chain is the ordered list of contexts one thread created against one
//! store, root first. It only grows: released contexts stay in place and are
//! handed out again to the next acquisition of the same kind. Chains live in
//! a thread-local table keyed by store id.

use crate::context::{Context, ContextKind, KindTag};
use crate::error::{ContextError, Result};
use crate::kinds::{IterationContext, QueryContext};
use crate::lock::{LockState, SharedRoot};
use crate::store::BackingStore;
use core::cell::{Cell, RefCell};
use hashbrown::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Weak};

/// Cap on contexts per chain. Reaching it means contexts are leaking.
pub const MAX_NESTED_CONTEXTS: usize = 1 << 10;

/// A context of any kind, as stored in a chain.
#[derive(Debug, Clone)]
pub enum ChainEntry {
    Query(Rc<Context<QueryContext>>),
    Iteration(Rc<Context<IterationContext>>),
}

impl ChainEntry {
    pub fn kind(&self) -> KindTag {
        match self {
            ChainEntry::Query(_) => KindTag::Query,
            ChainEntry::Iteration(_) => KindTag::Iteration,
        }
    }

    pub fn chain_index(&self) -> usize {
        match self {
            ChainEntry::Query(c) => c.chain_index(),
            ChainEntry::Iteration(c) => c.chain_index(),
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            ChainEntry::Query(c) => c.is_active(),
            ChainEntry::Iteration(c) => c.is_active(),
        }
    }
}

pub(crate) struct Chain {
    store_id: u64,
    entries: RefCell<Vec<ChainEntry>>,
    // Lock of the root context (index 0), shared with the store registry.
    root: Arc<SharedRoot>,
    store: Weak<dyn BackingStore>,
    // Active contexts, counting each re-entry once.
    active: Cell<usize>,
    unlock_deferred: Cell<bool>,
}

impl Chain {
    pub(crate) fn new(store_id: u64, store: Weak<dyn BackingStore>, root: Arc<SharedRoot>) -> Self {
        Self {
            store_id,
            entries: RefCell::new(Vec::new()),
            root,
            store,
            active: Cell::new(0),
            unlock_deferred: Cell::new(false),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub(crate) fn entry(&self, index: usize) -> Option<ChainEntry> {
        self.entries.borrow().get(index).cloned()
    }

    pub(crate) fn lock_state(&self) -> LockState {
        self.root.lock.state()
    }

    fn store_alive(&self) -> bool {
        self.store.strong_count() > 0
    }

    /// Hand out an idle context of kind `K`, creating one if none is idle.
    pub(crate) fn acquire<K: ContextKind>(&self) -> Result<Rc<Context<K>>> {
        let idle = self
            .entries
            .borrow()
            .iter()
            .filter_map(|e| K::from_entry(e))
            // An idle context whose state is still borrowed through a sibling
            // handle cannot be reset, so it is skipped.
            .find(|c| !c.is_active() && c.state.try_borrow_mut().is_ok())
            .cloned();
        let context = match idle {
            Some(c) => c,
            None => self.push_new::<K>()?,
        };
        self.enter(&context)?;
        Ok(context)
    }

    fn push_new<K: ContextKind>(&self) -> Result<Rc<Context<K>>> {
        let mut entries = self.entries.borrow_mut();
        if entries.len() >= MAX_NESTED_CONTEXTS {
            tracing::warn!(
                store_id = self.store_id,
                limit = MAX_NESTED_CONTEXTS,
                kind = %K::KIND,
                "context chain is full; a context was probably never released"
            );
            return Err(ContextError::Overflow {
                limit: MAX_NESTED_CONTEXTS,
            });
        }
        let context = Rc::new(Context::new(entries.len(), K::create()));
        entries.push(K::into_entry(Rc::clone(&context)));
        tracing::debug!(
            store_id = self.store_id,
            chain_index = context.chain_index(),
            kind = %K::KIND,
            "created context"
        );
        Ok(context)
    }

    fn enter<K: ContextKind>(&self, context: &Context<K>) -> Result<()> {
        let store = self.store.upgrade().ok_or(ContextError::Closed)?;
        // Nothing fallible may run between taking the lock and counting the
        // context active, or the lock would never be released.
        if let Ok(mut state) = context.state.try_borrow_mut() {
            state.reset();
        }
        let outermost = self.root.lock.lock_locally(&*store)?;
        if outermost {
            self.root.holder.record_lock_site();
        }
        context.first_locked.set(outermost);
        context.depth.set(1);
        self.active.set(self.active.get() + 1);
        if K::KIND == KindTag::Iteration {
            self.root.holder.enter_iteration();
        }
        Ok(())
    }

    pub(crate) fn reenter<K: ContextKind>(&self, context: &Context<K>) -> Result<()> {
        let depth = context.depth.get();
        debug_assert!(depth > 0, "re-entering an idle context");
        let open = self.store.upgrade().is_some_and(|store| store.is_open());
        if !open {
            return Err(ContextError::Closed);
        }
        if depth >= MAX_NESTED_CONTEXTS {
            return Err(ContextError::Overflow {
                limit: MAX_NESTED_CONTEXTS,
            });
        }
        context.depth.set(depth + 1);
        Ok(())
    }

    pub(crate) fn release<K: ContextKind>(&self, context: &Context<K>) {
        let depth = context.depth.get();
        debug_assert!(depth > 0, "releasing an idle context");
        if depth == 0 {
            return;
        }
        context.depth.set(depth - 1);
        if depth > 1 {
            return;
        }
        if K::KIND == KindTag::Iteration {
            self.root.holder.exit_iteration();
        }
        let active = self.active.get() - 1;
        self.active.set(active);
        // The outermost context may be released before contexts nested in
        // it; the lock stays held until the chain has nothing active.
        if context.first_locked.replace(false) {
            self.unlock_deferred.set(true);
        }
        if active == 0 && self.unlock_deferred.replace(false) {
            self.root.holder.clear_lock_site();
            self.root.lock.unlock_locally();
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        // A chain that is gone can never lock again.
        self.root.lock.try_close();
    }
}

#[derive(Default)]
struct ThreadChains {
    by_store: HashMap<u64, Rc<Chain>>,
}

impl Drop for ThreadChains {
    fn drop(&mut self) {
        for chain in self.by_store.values() {
            chain.root.holder.mark_exited();
        }
    }
}

thread_local! {
    static THREAD_CHAINS: RefCell<ThreadChains> = RefCell::new(ThreadChains::default());
}

/// This thread's chain for `store_id`, built by `create` on first use.
///
/// `create` runs with the thread-local table borrowed and must not acquire
/// contexts itself.
pub(crate) fn current_chain(store_id: u64, create: impl FnOnce() -> Chain) -> Rc<Chain> {
    THREAD_CHAINS.with(|chains| {
        let mut chains = chains.borrow_mut();
        if let Some(chain) = chains.by_store.get(&store_id) {
            return Rc::clone(chain);
        }
        chains.by_store.retain(|_, c| c.store_alive());
        let chain = Rc::new(create());
        chains.by_store.insert(store_id, Rc::clone(&chain));
        tracing::debug!(store_id, thread = ?std::thread::current().id(), "created context chain");
        chain
    })
}

/// This thread's chain for `store_id`, if it has one.
pub(crate) fn existing_chain(store_id: u64) -> Option<Rc<Chain>> {
    THREAD_CHAINS.with(|chains| chains.borrow().by_store.get(&store_id).cloned())
}
