//! Boundary to the backing store.

use std::time::Duration;

/// What the context core needs from the store it guards.
///
/// `is_open` is called without any lock held and may be briefly stale; the
/// lock state machine re-reads it wherever staleness would matter.
pub trait BackingStore: Send + Sync + 'static {
    /// Whether new outermost acquisitions are still allowed.
    fn is_open(&self) -> bool;

    /// Per-segment lock timeout. Close waits at most twice this long for a
    /// context to be released.
    fn lock_timeout(&self) -> Duration;
}
