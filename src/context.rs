//! Typed contexts and the scoped guard that releases them.

use crate::chain::{Chain, ChainEntry};
use crate::error::Result;
use crate::lock::LockState;
use core::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

/// Static tag of a context kind. Idle contexts are matched by exact tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum KindTag {
    Query,
    Iteration,
}

impl fmt::Display for KindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KindTag::Query => f.write_str("query"),
            KindTag::Iteration => f.write_str("iteration"),
        }
    }
}

/// A kind of operation state that can live in a context chain.
///
/// Each kind maps onto one [`ChainEntry`] variant, so the set of kinds is
/// closed and lookups never inspect types at runtime.
pub trait ContextKind: Sized + 'static {
    const KIND: KindTag;

    /// Fresh state for a newly created context.
    fn create() -> Self;

    /// Forget per-operation state before the context is reused.
    fn reset(&mut self);

    fn into_entry(context: Rc<Context<Self>>) -> ChainEntry;

    fn from_entry(entry: &ChainEntry) -> Option<&Rc<Context<Self>>>;
}

/// One reusable context: a slot of its thread's chain.
#[derive(Debug)]
pub struct Context<K> {
    index: usize,
    // Zero while idle; above one when re-entered.
    pub(crate) depth: Cell<usize>,
    // Set when this context's acquisition took the root lock.
    pub(crate) first_locked: Cell<bool>,
    pub(crate) state: RefCell<K>,
}

impl<K> Context<K> {
    pub(crate) fn new(index: usize, state: K) -> Self {
        Self {
            index,
            depth: Cell::new(0),
            first_locked: Cell::new(false),
            state: RefCell::new(state),
        }
    }

    /// Position in the chain; the root is 0.
    pub fn chain_index(&self) -> usize {
        self.index
    }

    pub fn is_active(&self) -> bool {
        self.depth.get() > 0
    }

    pub fn state(&self) -> Ref<'_, K> {
        self.state.borrow()
    }
}

/// An acquired context. Dropping it releases the context.
///
/// The guard is `!Send`: a context belongs to the thread whose chain holds it.
pub struct ScopedContext<K: ContextKind> {
    chain: Rc<Chain>,
    context: Rc<Context<K>>,
}

impl<K: ContextKind> ScopedContext<K> {
    pub(crate) fn new(chain: Rc<Chain>, context: Rc<Context<K>>) -> Self {
        Self { chain, context }
    }

    pub fn chain_index(&self) -> usize {
        self.context.chain_index()
    }

    /// Number of contexts in this thread's chain.
    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    /// Whether this acquisition took the root lock.
    pub fn is_outermost(&self) -> bool {
        self.context.first_locked.get()
    }

    /// Current value of the chain's root lock.
    pub fn lock_state(&self) -> LockState {
        self.chain.lock_state()
    }

    pub fn state(&self) -> Ref<'_, K> {
        self.context.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, K> {
        self.context.state.borrow_mut()
    }

    /// Another context of the same chain, e.g. for an iteration to consult
    /// the query that started it.
    pub fn sibling_context(&self, index: usize) -> Option<ChainEntry> {
        self.chain.entry(index)
    }

    /// Like [`sibling_context`](Self::sibling_context) but only if the sibling
    /// is of kind `S`.
    pub fn sibling_as<S: ContextKind>(&self, index: usize) -> Option<Rc<Context<S>>> {
        let entry = self.chain.entry(index)?;
        S::from_entry(&entry).cloned()
    }

    /// Enter this same context again. No new chain slot is used and the
    /// root lock is not touched.
    pub fn reenter(&self) -> Result<ScopedContext<K>> {
        self.chain.reenter(&self.context)?;
        Ok(Self::new(Rc::clone(&self.chain), Rc::clone(&self.context)))
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(self) {
        drop(self)
    }
}

impl<K: ContextKind> Drop for ScopedContext<K> {
    fn drop(&mut self) {
        self.chain.release(&self.context);
    }
}

impl<K: ContextKind + fmt::Debug> fmt::Debug for ScopedContext<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedContext")
            .field("kind", &K::KIND)
            .field("chain_index", &self.chain_index())
            .field("depth", &self.context.depth.get())
            .field("outermost", &self.is_outermost())
            .finish()
    }
}
