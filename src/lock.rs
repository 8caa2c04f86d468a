//! Three-state context lock shared between a chain's owner and closers.
//!
//! `Unlocked -> LockedLocally` and back are only ever performed by the
//! owner thread. `Unlocked -> Closed` is performed by whoever closes the
//! store, and `Closed` is absorbing.

use crate::error::{ContextError, Result};
use crate::holder::Holder;
use crate::store::BackingStore;
use std::sync::atomic::{fence, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const UNLOCKED: u8 = 0;
const LOCKED_LOCALLY: u8 = 1;
const CLOSED: u8 = 2;

/// Observable value of a [`ContextLock`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockState {
    Unlocked,
    LockedLocally,
    Closed,
}

impl LockState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            UNLOCKED => LockState::Unlocked,
            LOCKED_LOCALLY => LockState::LockedLocally,
            _ => LockState::Closed,
        }
    }
}

#[derive(Debug)]
pub struct ContextLock {
    state: AtomicU8,
}

impl ContextLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNLOCKED),
        }
    }

    pub fn state(&self) -> LockState {
        LockState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` if this call took the lock (outermost acquisition),
    /// `false` if the lock was already held by this chain.
    ///
    /// The openness check in front of the CAS is what keeps an owner that
    /// locks and unlocks in a loop from starving a closer. It is re-read
    /// after a failed CAS because the two reads may disagree, and a closed
    /// store wins over "already held".
    pub(crate) fn lock_locally<S: BackingStore + ?Sized>(&self, store: &S) -> Result<bool> {
        if store.is_open()
            && self
                .state
                .compare_exchange(UNLOCKED, LOCKED_LOCALLY, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Ok(true);
        }
        if !store.is_open() {
            return Err(ContextError::Closed);
        }
        match self.state.load(Ordering::SeqCst) {
            LOCKED_LOCALLY => Ok(false),
            raw => {
                tracing::error!(
                    state = ?LockState::from_raw(raw),
                    "context lock rejected an acquisition while its store reports open"
                );
                Err(ContextError::Closed)
            }
        }
    }

    /// Release the lock taken by [`lock_locally`](Self::lock_locally).
    pub(crate) fn unlock_locally(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), LOCKED_LOCALLY);
        // Reads of mapped memory made under the lock must complete before a
        // closer can observe Unlocked and free that memory.
        fence(Ordering::Acquire);
        // Release store only; no store-load barrier on this path.
        self.state.store(UNLOCKED, Ordering::Release);
    }

    /// One attempt at `Unlocked -> Closed`. A lock that is already closed
    /// counts as closed.
    pub fn try_close(&self) -> bool {
        match self
            .state
            .compare_exchange(UNLOCKED, CLOSED, Ordering::SeqCst, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == CLOSED,
        }
    }

    /// Close this lock on behalf of a store close, waiting up to twice
    /// `lock_timeout` for the owner to release it.
    pub(crate) fn close(&self, holder: &Holder, lock_timeout: Duration) -> Result<()> {
        if self.try_close() {
            return Ok(());
        }
        if holder.is_current_thread() {
            return Err(ContextError::SameThreadClose);
        }
        let ceiling = lock_timeout.saturating_mul(2);
        tracing::debug!(
            owner = ?holder.thread_id(),
            ?ceiling,
            "context held by another thread, waiting for release"
        );
        let started = Instant::now();
        loop {
            if self.try_close() {
                return Ok(());
            }
            thread::yield_now();
            if started.elapsed() >= ceiling {
                break;
            }
        }
        // A last attempt so a release racing the deadline is not reported.
        if self.try_close() {
            return Ok(());
        }
        let report = holder.report(lock_timeout);
        tracing::error!(
            owner = ?report.thread_id(),
            state = %report.state(),
            ?ceiling,
            "context was not released before the close deadline"
        );
        Err(ContextError::CloseTimeout(Box::new(report)))
    }
}

impl Default for ContextLock {
    fn default() -> Self {
        Self::new()
    }
}

/// The lock of a chain's root context plus its owner's identity. Shared
/// between the owner thread (through its chain) and the store registry.
pub(crate) struct SharedRoot {
    pub(crate) lock: ContextLock,
    pub(crate) holder: Holder,
}

impl SharedRoot {
    pub(crate) fn for_current_thread(capture_sites: bool) -> Self {
        Self {
            lock: ContextLock::new(),
            holder: Holder::current(capture_sites),
        }
    }

    pub(crate) fn close(&self, lock_timeout: Duration) -> Result<()> {
        self.lock.close(&self.holder, lock_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holder::HolderState;
    use std::sync::atomic::AtomicBool;
    use std::sync::{mpsc, Arc};

    struct FakeStore {
        open: AtomicBool,
        timeout: Duration,
    }

    impl FakeStore {
        fn open() -> Self {
            Self {
                open: AtomicBool::new(true),
                timeout: Duration::from_millis(20),
            }
        }
        fn shut(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    impl BackingStore for FakeStore {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        fn lock_timeout(&self) -> Duration {
            self.timeout
        }
    }

    /// Invariant: Only the first acquisition takes the lock; nested ones
    /// report `false` and unlock returns the cell to Unlocked.
    #[test]
    fn outermost_then_nested() {
        let store = FakeStore::open();
        let lock = ContextLock::new();
        assert!(lock.lock_locally(&store).unwrap());
        assert!(!lock.lock_locally(&store).unwrap());
        assert_eq!(lock.state(), LockState::LockedLocally);
        lock.unlock_locally();
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    /// Invariant: A closed store rejects acquisition and leaves the cell alone.
    #[test]
    fn closed_store_rejects_without_transition() {
        let store = FakeStore::open();
        store.shut();
        let lock = ContextLock::new();
        assert!(matches!(lock.lock_locally(&store), Err(ContextError::Closed)));
        assert_eq!(lock.state(), LockState::Unlocked);
    }

    /// Invariant: A closed store wins over the lock being held already.
    #[test]
    fn closed_store_wins_over_held_lock() {
        let store = FakeStore::open();
        let lock = ContextLock::new();
        assert!(lock.lock_locally(&store).unwrap());
        store.shut();
        assert!(matches!(lock.lock_locally(&store), Err(ContextError::Closed)));
        assert_eq!(lock.state(), LockState::LockedLocally);
        lock.unlock_locally();
        assert!(lock.try_close());
    }

    /// Invariant: Closed is absorbing, even against a store that still
    /// reports open, and try_close is idempotent.
    #[test]
    fn closed_is_absorbing() {
        let store = FakeStore::open();
        let lock = ContextLock::new();
        assert!(lock.try_close());
        assert!(lock.try_close());
        assert_eq!(lock.state(), LockState::Closed);
        assert!(matches!(lock.lock_locally(&store), Err(ContextError::Closed)));
        assert_eq!(lock.state(), LockState::Closed);
    }

    /// Invariant: try_close never steals a held lock.
    #[test]
    fn try_close_fails_while_locked() {
        let store = FakeStore::open();
        let lock = ContextLock::new();
        lock.lock_locally(&store).unwrap();
        assert!(!lock.try_close());
        assert_eq!(lock.state(), LockState::LockedLocally);
        lock.unlock_locally();
        assert!(lock.try_close());
    }

    /// Invariant: Closing a lock held by the calling thread fails at once.
    #[test]
    fn close_from_owner_thread_fails_fast() {
        let store = FakeStore::open();
        let root = SharedRoot::for_current_thread(false);
        root.lock.lock_locally(&store).unwrap();
        let started = Instant::now();
        assert!(matches!(
            root.close(Duration::from_secs(30)),
            Err(ContextError::SameThreadClose)
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        root.lock.unlock_locally();
        assert!(root.close(Duration::from_secs(30)).is_ok());
    }

    /// Invariant: A closer on another thread waits for the owner to release
    /// and then closes the lock.
    #[test]
    fn close_waits_for_release() {
        let store = FakeStore::open();
        let root = Arc::new(SharedRoot::for_current_thread(false));
        root.lock.lock_locally(&store).unwrap();

        let (tx, rx) = mpsc::channel();
        let closer = {
            let root = Arc::clone(&root);
            std::thread::spawn(move || {
                tx.send(()).unwrap();
                root.close(Duration::from_secs(10))
            })
        };
        rx.recv().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(root.lock.state(), LockState::LockedLocally);
        root.lock.unlock_locally();
        assert!(closer.join().unwrap().is_ok());
        assert_eq!(root.lock.state(), LockState::Closed);
    }

    /// Invariant: A lock never released fails the close after roughly twice
    /// the timeout, with the owner's identity in the report.
    #[test]
    fn close_times_out_with_report() {
        let store = FakeStore::open();
        let root = Arc::new(SharedRoot::for_current_thread(false));
        root.lock.lock_locally(&store).unwrap();
        let owner = std::thread::current().id();

        let closer = {
            let root = Arc::clone(&root);
            std::thread::spawn(move || {
                let started = Instant::now();
                (root.close(Duration::from_millis(20)), started.elapsed())
            })
        };
        let (res, elapsed) = closer.join().unwrap();
        assert!(elapsed >= Duration::from_millis(40));
        match res {
            Err(ContextError::CloseTimeout(report)) => {
                assert_eq!(report.thread_id(), owner);
                assert_eq!(report.state(), HolderState::Running);
                assert_eq!(report.lock_timeout(), Duration::from_millis(20));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // The failed close left the lock usable by its owner.
        assert_eq!(root.lock.state(), LockState::LockedLocally);
        root.lock.unlock_locally();
        assert!(root.close(Duration::from_millis(20)).is_ok());
    }
}
