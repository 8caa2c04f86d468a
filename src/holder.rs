//! Owner identity and status for a chain's root, read by closing threads.
//!
//! Another thread's stack cannot be sampled, so the owner publishes what a
//! closer needs to explain a stuck close: who it is, whether it exited or
//! is iterating, and (when enabled) where the outermost lock was taken.

use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

struct LockSite {
    since: Instant,
    backtrace: Backtrace,
}

pub(crate) struct Holder {
    thread_id: ThreadId,
    thread_name: Option<String>,
    exited: AtomicBool,
    iterations: AtomicUsize,
    capture_sites: bool,
    site: Mutex<Option<LockSite>>,
}

impl Holder {
    /// Describe the calling thread as the owner.
    pub(crate) fn current(capture_sites: bool) -> Self {
        let me = thread::current();
        Self {
            thread_id: me.id(),
            thread_name: me.name().map(str::to_owned),
            exited: AtomicBool::new(false),
            iterations: AtomicUsize::new(0),
            capture_sites,
            site: Mutex::new(None),
        }
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub(crate) fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }

    pub(crate) fn enter_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn exit_iteration(&self) {
        self.iterations.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> HolderState {
        if self.exited.load(Ordering::Acquire) {
            HolderState::Exited
        } else if self.iterations.load(Ordering::Relaxed) > 0 {
            HolderState::Iterating
        } else {
            HolderState::Running
        }
    }

    /// Called on the outermost acquisition. No-op unless site capture is on.
    pub(crate) fn record_lock_site(&self) {
        if !self.capture_sites {
            return;
        }
        let site = LockSite {
            since: Instant::now(),
            backtrace: Backtrace::force_capture(),
        };
        *self.site.lock() = Some(site);
    }

    pub(crate) fn clear_lock_site(&self) {
        if self.capture_sites {
            *self.site.lock() = None;
        }
    }

    pub(crate) fn report(&self, lock_timeout: Duration) -> HolderReport {
        let site = self.site.lock();
        HolderReport {
            thread_id: self.thread_id,
            thread_name: self.thread_name.clone(),
            state: self.state(),
            held_for: site.as_ref().map(|s| s.since.elapsed()),
            lock_site: site.as_ref().map(|s| s.backtrace.to_string()),
            lock_timeout,
        }
    }
}

/// What the owner thread was doing when a close gave up on it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HolderState {
    /// Owner is alive and inside a non-iteration operation.
    Running,
    /// Owner is alive with at least one iteration context active.
    Iterating,
    /// Owner thread has exited without releasing its context.
    Exited,
}

impl fmt::Display for HolderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HolderState::Running => "running",
            HolderState::Iterating => "iterating",
            HolderState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Diagnostics carried by a close timeout.
#[derive(Debug, Clone)]
pub struct HolderReport {
    thread_id: ThreadId,
    thread_name: Option<String>,
    state: HolderState,
    held_for: Option<Duration>,
    lock_site: Option<String>,
    lock_timeout: Duration,
}

impl HolderReport {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    pub fn state(&self) -> HolderState {
        self.state
    }

    /// How long the outermost lock had been held. Requires lock site capture.
    pub fn held_for(&self) -> Option<Duration> {
        self.held_for
    }

    /// Backtrace of the outermost acquisition. Requires lock site capture.
    pub fn lock_site(&self) -> Option<&str> {
        self.lock_site.as_deref()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }
}

impl fmt::Display for HolderReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.thread_name.as_deref().unwrap_or("<unnamed>");
        writeln!(
            f,
            "context owned by thread '{}' ({:?}) in state {}",
            name, self.thread_id, self.state
        )?;
        if let Some(held) = self.held_for {
            writeln!(f, "outermost lock held for {:?}", held)?;
        }
        match &self.lock_site {
            Some(site) => writeln!(f, "outermost lock acquired at:\n{}", site)?,
            None => writeln!(
                f,
                "lock site unknown (enable capture_lock_sites to record it)"
            )?,
        }
        let timeout = self.lock_timeout;
        writeln!(f, "Possible reasons:")?;
        writeln!(
            f,
            "- the owner thread exited before releasing this context; release every \
             context by dropping its guard and never leak a guard"
        )?;
        writeln!(
            f,
            "- the owner thread runs a context operation such as a query for longer than \
             {:?}; spend less time inside contexts or call close() only after all queries \
             finished",
            timeout
        )?;
        writeln!(
            f,
            "- an iteration over a large store takes longer than {:?}; call close() only \
             after all iterations finished",
            timeout
        )?;
        write!(
            f,
            "- a deadlock between the owner thread and the thread calling close(); \
             release contexts before waiting on the closing thread"
        )
    }
}
