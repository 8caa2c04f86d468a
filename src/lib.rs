//! context-chain: pooled per-thread operation contexts for an off-heap,
//! memory-mapped concurrent store, and the lock that lets the store be
//! closed only once no thread is inside one.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: every store operation runs inside a reusable context; contexts
//!   are cheap to reacquire, and closing the store never frees memory a
//!   live context may still read.
//! - Layers:
//!   - ContextLock: a three-state atomic cell (Unlocked, LockedLocally,
//!     Closed) owned by the root of each chain. The owner thread locks and
//!     unlocks it; a closing thread moves it to Closed.
//!   - Chain: the per-thread, root-first list of contexts for one store.
//!     Acquisition reuses an idle context of the requested kind or appends
//!     a new one; only the outermost acquisition touches the lock.
//!   - ScopedContext / StoreHandle: the public surface. Guards release on
//!     drop; the handle owns the store lifecycle and drives close across
//!     all chains.
//!
//! Constraints
//! - Chains and guards are thread-confined (`!Send`); the handle and the root
//!   locks are shared across threads.
//! - No allocation on the reacquire path; the chain only grows when a new
//!   kind or a deeper nesting is first seen, up to `MAX_NESTED_CONTEXTS`.
//! - `lock_locally` never blocks. Only `close` waits, yielding between
//!   attempts, for at most twice the configured lock timeout.
//!
//! Close protocol
//! - The store first stops reporting open, so owners cannot relock and a
//!   closer cannot be starved by an owner locking in a loop.
//! - Each root is then moved `Unlocked -> Closed`. A root locked by the
//!   closing thread itself fails with `SameThreadClose` without waiting; a
//!   root locked elsewhere is retried until released or until the deadline,
//!   at which point the holder's diagnostics are returned.
//! - Unlock issues a read fence and then a release store, so reads of mapped
//!   memory made under the lock complete before a closer can observe it free.
//!
//! Notes and non-goals
//! - The hash table itself (segments, serialization, the mapped file) is
//!   outside this crate; `QueryContext` and `IterationContext` only keep the
//!   cursor state such operations carry.
//! - The set of context kinds is closed: each kind is one `ChainEntry`
//!   variant and is matched by a static tag.

mod chain;
mod chain_proptest;
mod config;
mod context;
mod error;
mod handle;
mod holder;
mod kinds;
mod lock;
mod store;

// Public surface
pub use chain::{ChainEntry, MAX_NESTED_CONTEXTS};
pub use crate::config::{
    ConfigLoadError, StoreConfig, DEFAULT_LOCK_TIMEOUT_SECONDS, ENV_PREFIX,
};
pub use context::{Context, ContextKind, KindTag, ScopedContext};
pub use error::{ContextError, Result};
pub use handle::{StoreHandle, StoreState};
pub use holder::{HolderReport, HolderState};
pub use kinds::{IterationContext, QueryContext};
pub use lock::{ContextLock, LockState};
pub use store::BackingStore;
