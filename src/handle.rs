//! Store handle: owns the store lifecycle and drives close over every
//! thread's context chain.

use crate::chain::{self, Chain};
use crate::config::StoreConfig;
use crate::context::{ContextKind, ScopedContext};
use crate::error::{ContextError, Result};
use crate::kinds::{IterationContext, QueryContext};
use crate::lock::{LockState, SharedRoot};
use crate::store::BackingStore;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a store.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreState {
    Open,
    /// Close has started but not every context is closed yet. No new
    /// outermost acquisition succeeds and memory is not reclaimed.
    Closing,
    Closed,
}

struct StoreInner {
    id: u64,
    lifecycle: AtomicU8,
    config: StoreConfig,
    roots: Mutex<Vec<Weak<SharedRoot>>>,
}

impl BackingStore for StoreInner {
    fn is_open(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == OPEN
    }

    fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout()
    }
}

impl StoreInner {
    fn register(&self, root: &Arc<SharedRoot>) {
        let mut roots = self.roots.lock();
        roots.retain(|r| r.strong_count() > 0);
        roots.push(Arc::downgrade(root));
    }

    fn live_roots(&self) -> Vec<Arc<SharedRoot>> {
        self.roots.lock().iter().filter_map(Weak::upgrade).collect()
    }
}

/// Shared handle to a store. Clone it to use the store from several threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<StoreInner>,
}

impl StoreHandle {
    pub fn open(config: StoreConfig) -> Self {
        let id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(store_id = id, lock_timeout = ?config.lock_timeout(), "opened store");
        Self {
            inner: Arc::new(StoreInner {
                id,
                lifecycle: AtomicU8::new(OPEN),
                config,
                roots: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn state(&self) -> StoreState {
        match self.inner.lifecycle.load(Ordering::SeqCst) {
            OPEN => StoreState::Open,
            CLOSING => StoreState::Closing,
            _ => StoreState::Closed,
        }
    }

    /// Acquire a context of kind `K` from the calling thread's chain.
    pub fn acquire<K: ContextKind>(&self) -> Result<ScopedContext<K>> {
        let chain = match chain::existing_chain(self.inner.id) {
            Some(chain) => chain,
            None if !self.is_open() => return Err(ContextError::Closed),
            None => chain::current_chain(self.inner.id, || self.new_chain()),
        };
        let context = chain.acquire::<K>()?;
        Ok(ScopedContext::new(chain, context))
    }

    pub fn query_context(&self) -> Result<ScopedContext<QueryContext>> {
        self.acquire::<QueryContext>()
    }

    pub fn iteration_context(&self) -> Result<ScopedContext<IterationContext>> {
        self.acquire::<IterationContext>()
    }

    fn new_chain(&self) -> Chain {
        let root = Arc::new(SharedRoot::for_current_thread(
            self.inner.config.capture_lock_sites,
        ));
        self.inner.register(&root);
        let inner: Arc<dyn BackingStore> = self.inner.clone();
        Chain::new(self.inner.id, Arc::downgrade(&inner), root)
    }

    /// Length of the calling thread's chain, if it has one.
    pub fn thread_chain_len(&self) -> Option<usize> {
        chain::existing_chain(self.inner.id).map(|c| c.len())
    }

    /// Root lock state of the calling thread's chain, if it has one.
    pub fn thread_lock_state(&self) -> Option<LockState> {
        chain::existing_chain(self.inner.id).map(|c| c.lock_state())
    }

    /// Number of threads whose chains for this store are still alive.
    pub fn registered_chains(&self) -> usize {
        self.inner.live_roots().len()
    }

    /// Close the store once no thread holds a context on it.
    ///
    /// Fails at once if the calling thread holds a context itself; the store
    /// is then left open.
    ///
    /// A timeout does not return the store to [`StoreState::Open`]: roots
    /// closed before the timeout cannot be reopened. The store stays
    /// [`StoreState::Closing`] instead, rejecting new acquisitions with
    /// nothing reclaimed, and close may be called again.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let store_id = inner.id;
        if inner.lifecycle.load(Ordering::SeqCst) == CLOSED {
            return Ok(());
        }
        if let Some(own) = chain::existing_chain(store_id) {
            if own.lock_state() == LockState::LockedLocally {
                tracing::error!(
                    store_id,
                    "close called from an unfinished query or iteration on the same thread"
                );
                return Err(ContextError::SameThreadClose);
            }
        }
        match inner
            .lifecycle
            .compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => tracing::info!(store_id, "closing store"),
            Err(CLOSED) => return Ok(()),
            Err(_) => tracing::debug!(store_id, "resuming store close"),
        }

        let mut roots = inner.live_roots();
        roots.sort_by_key(|r| !r.holder.is_current_thread());
        let timeout = inner.lock_timeout();
        for root in &roots {
            if let Err(e) = root.close(timeout) {
                tracing::error!(
                    store_id,
                    owner = ?root.holder.thread_id(),
                    error = %e,
                    "store close aborted; the store stays closing and close may be retried"
                );
                return Err(e);
            }
        }

        inner.lifecycle.store(CLOSED, Ordering::SeqCst);
        inner.roots.lock().clear();
        tracing::info!(store_id, contexts = roots.len(), "store closed");
        Ok(())
    }
}

impl Default for StoreHandle {
    fn default() -> Self {
        Self::open(StoreConfig::default())
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn store() -> StoreHandle {
        StoreHandle::open(StoreConfig::default().with_lock_timeout(Duration::from_secs(5)))
    }

    /// Invariant: The handle is shareable across threads.
    #[test]
    fn handle_is_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<StoreHandle>();
    }

    /// Invariant: Close on a store nobody used succeeds and is idempotent.
    #[test]
    fn close_unused_store_twice() {
        let s = store();
        assert!(s.close().is_ok());
        assert_eq!(s.state(), StoreState::Closed);
        assert!(s.close().is_ok());
    }

    /// Invariant: After close no acquisition succeeds, whether or not the
    /// thread already had a chain.
    #[test]
    fn acquire_after_close_fails() {
        let s = store();
        drop(s.query_context().unwrap());
        s.close().unwrap();
        assert!(matches!(s.query_context(), Err(ContextError::Closed)));

        let other = s.clone();
        let res = thread::spawn(move || other.query_context().map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(res, Err(ContextError::Closed)));
        assert_eq!(s.registered_chains(), 0);
    }

    /// Invariant: Closing from a thread that holds a context fails at once
    /// and leaves the store open and usable.
    #[test]
    fn same_thread_close_leaves_store_open() {
        let s = store();
        let q = s.query_context().unwrap();
        assert!(matches!(s.close(), Err(ContextError::SameThreadClose)));
        assert_eq!(s.state(), StoreState::Open);
        let nested = s.iteration_context().unwrap();
        drop(nested);
        drop(q);
        assert!(s.close().is_ok());
    }

    /// Invariant: Each thread registers one chain; chains of exited threads
    /// stop counting.
    #[test]
    fn one_chain_per_thread() {
        let s = store();
        drop(s.query_context().unwrap());
        drop(s.iteration_context().unwrap());
        assert_eq!(s.registered_chains(), 1);

        let other = s.clone();
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let t = thread::spawn(move || {
            drop(other.query_context().unwrap());
            tx.send(()).unwrap();
            done_rx.recv().unwrap();
        });
        rx.recv().unwrap();
        assert_eq!(s.registered_chains(), 2);
        done_tx.send(()).unwrap();
        t.join().unwrap();
        assert_eq!(s.registered_chains(), 1);
    }

    /// Invariant: Thread-level inspection reflects this thread's chain only.
    #[test]
    fn thread_inspection() {
        let s = store();
        assert_eq!(s.thread_chain_len(), None);
        assert_eq!(s.thread_lock_state(), None);
        let q = s.query_context().unwrap();
        assert_eq!(s.thread_chain_len(), Some(1));
        assert_eq!(s.thread_lock_state(), Some(LockState::LockedLocally));
        drop(q);
        assert_eq!(s.thread_lock_state(), Some(LockState::Unlocked));
        s.close().unwrap();
        assert_eq!(s.thread_lock_state(), Some(LockState::Closed));
    }
}
