//! Multi-threaded waitable manager
//!
//! Owns a set of [`Waitable`]s and a fixed pool of threads. The threads take
//! turns being the *waiter*: the waiter holds the set lock, polls every
//! entry plus `new_waitable_event`, removes the one entry it claims and
//! releases the lock before running the callback. So a waitable is either
//! in the set or being handled by exactly one thread, never both.
//!
//! ```text
//!  add() ──► pending ──signal──► new_waitable_event
//!                │                      │
//!                ▼ (merged by waiter)   ▼
//!           wait_set ──poll──► claim ──► handle_signaled()
//!                ▲                              │
//!                └──────── pending ◄── Continue ┘
//! ```
//!
//! Handlers return entries through `pending` because the set lock is
//! usually held by the next waiter sitting in `poll`. Lock order is
//! `wait_set` then `pending`; `add` only takes `pending`.
//!
//! Among several ready entries the one served least recently wins, so a
//! chatty session cannot starve the others.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::fd::AsFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use mitm_core::{
    kdebug, kerror, kinfo, ktrace, kwarn, HandleOutcome, Waitable, WaitableId, WaitableSink,
};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::config::{ConfigError, ManagerConfig};
use crate::event::Event;

/// Fatal manager failure.
#[derive(Debug)]
pub enum ManagerError {
    Config(ConfigError),
    /// The wait primitive failed; the set can no longer be served.
    Wait(Errno),
    /// The wakeup event could not be created or signaled.
    Event(Errno),
    Spawn(io::Error),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{}", e),
            Self::Wait(e) => write!(f, "wait on waitable set failed: {}", e),
            Self::Event(e) => write!(f, "manager event failed: {}", e),
            Self::Spawn(e) => write!(f, "failed to spawn manager thread: {}", e),
        }
    }
}

impl std::error::Error for ManagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Wait(e) | Self::Event(e) => Some(e),
            Self::Spawn(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ManagerError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// Counters returned by [`WaitableManager::process`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Callbacks run.
    pub dispatches: u64,
    /// Waitables destroyed, including the shutdown drain.
    pub closes: u64,
    /// Callbacks that panicked.
    pub panics: u64,
    /// Largest number of live waitables seen.
    pub peak_waitables: usize,
}

struct Entry {
    id: WaitableId,
    waitable: Box<dyn Waitable>,
    last_served: u64,
}

#[derive(Default)]
struct Pending {
    entries: Vec<Entry>,
    /// Set by the final drain. Later adds are destroyed on arrival.
    closed: bool,
}

struct Shared {
    config: ManagerConfig,
    wait_set: Mutex<BTreeMap<WaitableId, Entry>>,
    pending: Mutex<Pending>,
    new_waitable_event: Event,
    shutdown: AtomicBool,
    next_id: AtomicU64,
    serve_clock: AtomicU64,
    live: AtomicUsize,
    dispatches: AtomicU64,
    closes: AtomicU64,
    panics: AtomicU64,
    peak: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn add(&self, waitable: Box<dyn Waitable>) {
        let id = WaitableId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            id,
            waitable,
            last_served: 0,
        };
        self.push_pending(entry, true);
    }

    /// Queue for the next merge. `fresh` entries were not counted yet.
    fn push_pending(&self, entry: Entry, fresh: bool) {
        let mut pending = lock(&self.pending);
        if pending.closed {
            drop(pending);
            kdebug!("manager closed, dropping {} ({})", entry.waitable.describe(), entry.id.0);
            if !fresh {
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
            self.closes.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if fresh {
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(live, Ordering::Relaxed);
        }
        pending.entries.push(entry);
        drop(pending);

        if let Err(e) = self.new_waitable_event.signal() {
            kwarn!("failed to signal new waitable event: {}", e);
        }
    }

    fn destroy(&self, entry: Entry) {
        ktrace!("destroying {} ({})", entry.waitable.describe(), entry.id.0);
        drop(entry);
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            kinfo!("waitable manager shutdown requested");
        }
        if let Err(e) = self.new_waitable_event.signal() {
            kwarn!("failed to wake waiter for shutdown: {}", e);
        }
    }

    #[inline]
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn poll_timeout(&self) -> PollTimeout {
        match self.config.wait_timeout {
            // validate() bounds the value to u16 milliseconds.
            Some(t) => PollTimeout::from(t.as_millis().min(u16::MAX as u128) as u16),
            None => PollTimeout::NONE,
        }
    }

    /// Become the waiter and claim one ready entry.
    ///
    /// `Ok(None)` means timeout, an interrupted wait, a set change, or
    /// shutdown; the caller loops and re-checks.
    fn wait_any(&self) -> Result<Option<Entry>, Errno> {
        let mut set = lock(&self.wait_set);
        if self.is_shutdown() {
            return Ok(None);
        }

        {
            let mut pending = lock(&self.pending);
            for entry in pending.entries.drain(..) {
                set.insert(entry.id, entry);
            }
        }

        let chosen = {
            let mut fds = Vec::with_capacity(set.len() + 1);
            fds.push(PollFd::new(self.new_waitable_event.as_fd(), PollFlags::POLLIN));
            for entry in set.values() {
                fds.push(PollFd::new(entry.waitable.handle(), PollFlags::POLLIN));
            }

            match poll(&mut fds, self.poll_timeout()) {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(None),
                Err(e) => return Err(e),
            }

            let ready = |fd: &PollFd<'_>| fd.revents().map_or(false, |r| !r.is_empty());

            if ready(&fds[0]) {
                if let Err(e) = self.new_waitable_event.clear() {
                    kwarn!("failed to clear new waitable event: {}", e);
                }
            }

            set.values()
                .zip(fds[1..].iter())
                .filter(|(_, fd)| ready(fd))
                .min_by_key(|(entry, _)| entry.last_served)
                .map(|(entry, _)| entry.id)
        };

        Ok(chosen.and_then(|id| set.remove(&id)))
    }

    fn dispatch(&self, mut entry: Entry) {
        entry.last_served = self.serve_clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.dispatches.fetch_add(1, Ordering::Relaxed);

        let outcome = catch_unwind(AssertUnwindSafe(|| entry.waitable.handle_signaled(self)));
        match outcome {
            Ok(HandleOutcome::Continue) => self.push_pending(entry, false),
            Ok(HandleOutcome::Close) => self.destroy(entry),
            Ok(HandleOutcome::Replace(next)) => {
                self.destroy(entry);
                self.add(next);
            }
            Err(_) => {
                kerror!(
                    "handler for {} ({}) panicked, closing it",
                    entry.waitable.describe(),
                    entry.id.0
                );
                self.panics.fetch_add(1, Ordering::Relaxed);
                self.destroy(entry);
            }
        }
    }

    /// Destroy everything still owned and refuse later adds.
    fn drain(&self) -> usize {
        let entries: Vec<Entry> = {
            let mut set = lock(&self.wait_set);
            let mut pending = lock(&self.pending);
            pending.closed = true;
            let mut all: Vec<Entry> = std::mem::take(&mut *set).into_values().collect();
            all.append(&mut pending.entries);
            all
        };
        let n = entries.len();
        for entry in entries {
            self.destroy(entry);
        }
        n
    }

    fn stats(&self) -> ManagerStats {
        ManagerStats {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            peak_waitables: self.peak.load(Ordering::Relaxed),
        }
    }
}

impl WaitableSink for Shared {
    fn add(&self, waitable: Box<dyn Waitable>) {
        Shared::add(self, waitable)
    }
}

fn waiter_loop(shared: &Shared, index: usize) -> Result<(), Errno> {
    kdebug!("waiter {} started", index);
    while !shared.is_shutdown() {
        match shared.wait_any() {
            Ok(Some(entry)) => shared.dispatch(entry),
            Ok(None) => {}
            Err(e) => {
                kerror!("waiter {}: wait failed: {}", index, e);
                shared.request_shutdown();
                return Err(e);
            }
        }
    }
    kdebug!("waiter {} exiting", index);
    Ok(())
}

/// Owns the waitable set until [`process`](Self::process) returns.
pub struct WaitableManager {
    shared: Arc<Shared>,
}

impl WaitableManager {
    /// Create the manager. No threads run until `process`.
    pub fn new(config: ManagerConfig) -> Result<Self, ManagerError> {
        config.validate()?;
        let event = Event::new().map_err(ManagerError::Event)?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                wait_set: Mutex::new(BTreeMap::new()),
                pending: Mutex::new(Pending::default()),
                new_waitable_event: event,
                shutdown: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                serve_clock: AtomicU64::new(0),
                live: AtomicUsize::new(0),
                dispatches: AtomicU64::new(0),
                closes: AtomicU64::new(0),
                panics: AtomicU64::new(0),
                peak: AtomicUsize::new(0),
            }),
        })
    }

    pub fn add(&self, waitable: Box<dyn Waitable>) {
        self.shared.add(waitable);
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Run the thread pool until shutdown, then destroy every remaining
    /// waitable exactly once.
    ///
    /// Returns `ManagerError::Wait` if polling failed; the other threads
    /// are stopped and the set drained first.
    pub fn process(self) -> Result<ManagerStats, ManagerError> {
        let shared = self.shared;
        let n = shared.config.num_threads;
        kinfo!("waitable manager starting {} threads", n);

        let mut handles = Vec::with_capacity(n);
        let mut spawn_error = None;
        for index in 0..n {
            let s = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("mitm-waiter-{}", index))
                .stack_size(shared.config.thread_stack_size)
                .spawn(move || waiter_loop(&s, index));
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    kerror!("failed to spawn waiter {}: {}", index, e);
                    shared.request_shutdown();
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        let mut wait_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    wait_error.get_or_insert(e);
                }
                Err(_) => kerror!("waiter thread panicked outside a handler"),
            }
        }

        let drained = shared.drain();
        let stats = shared.stats();
        kinfo!(
            "waitable manager stopped: {} dispatches, {} closed ({} at shutdown), {} panics",
            stats.dispatches,
            stats.closes,
            drained,
            stats.panics
        );

        if let Some(e) = spawn_error {
            return Err(ManagerError::Spawn(e));
        }
        if let Some(e) = wait_error {
            return Err(ManagerError::Wait(e));
        }
        Ok(stats)
    }
}

/// Cloneable access to a manager from other threads.
#[derive(Clone)]
pub struct ManagerHandle {
    shared: Arc<Shared>,
}

impl ManagerHandle {
    pub fn add(&self, waitable: Box<dyn Waitable>) {
        self.shared.add(waitable);
    }

    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Waitables owned right now, queued or being handled included.
    pub fn live_count(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }
}

impl WaitableSink for ManagerHandle {
    fn add(&self, waitable: Box<dyn Waitable>) {
        self.shared.add(waitable);
    }
}

impl fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("live", &self.live_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
