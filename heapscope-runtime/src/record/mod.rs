//! The allocation event log.
//!
//! Every interposed allocator call lands here. Recording is thread-local:
//! each thread owns a [`LocalContext`] holding its private event vector, so
//! the hot path takes no lock and contends on nothing but one atomic
//! fetch-add (the event-id counter, which totally orders events across
//! threads). When a thread exits, its context's `Drop` drains the local log
//! into the process-wide [`GlobalContext`] under a mutex; report generation
//! at process exit snapshots that aggregate.
//!
//! ## Lifecycle invariants
//!
//! - Tracing is enabled while at least one local context is alive. The
//!   profiler constructor calls [`init`] on the main thread to create the
//!   first one; other threads pick theirs up lazily on first allocation.
//!   When the last context is destroyed (glibc runs TLS destructors before
//!   `atexit` handlers), tracing flips off, so report generation's own
//!   allocations are never recorded.
//! - The recorder's own allocations (growing the event vector, symbol
//!   buffers) re-enter the interposed hooks. The per-thread nest guard
//!   suppresses *recording* for those, while the hooks still forward them to
//!   the real allocator.
//! - Sorting the merged event log by id reproduces a valid interleaving:
//!   ids come from one monotonic counter fetched while the event is built.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

pub use heapscope_common::EventKind;

use crate::counters::AllocCount;
use crate::domain::Addr;
use crate::frametag::{extract_events, ObjectEvent};
use crate::unwind::{unwind, unwind_with_sp, MAX_FRAMES};

/// Upper bound on destructor tags recovered per free event.
const MAX_OBJECT_EVENTS: usize = 1024;

/// One allocation or deallocation, as captured on the hot path. Addresses
/// are stored as plain integers so records can cross threads when local logs
/// drain into the global aggregate.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Position in the process-wide total order.
    pub id: u64,
    pub kind: EventKind,
    /// Requested size in bytes; 0 for frees (their size is recovered during
    /// report generation by pairing against the preceding allocation).
    pub alloc_size: usize,
    /// Address returned by (or passed to) the allocator.
    pub alloc_addr: Addr,
    /// For reallocs, the old address; 0 otherwise.
    pub alloc_hint: Addr,
    /// Captured return addresses, innermost first.
    pub trace: Vec<Addr>,
    /// Destructor frame tags found on the stack (free events only).
    pub object_trace: Vec<ObjectEvent>,
}

/// A log of events plus running totals. Lives per-thread inside
/// [`LocalContext`] and once more as the global aggregate.
#[derive(Debug, Default)]
pub struct AllocCounter {
    pub totals: AllocCount,
    pub events: Vec<EventRecord>,
}

impl AllocCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self { totals: AllocCount::new(), events: Vec::new() }
    }

    pub fn record(&mut self, event: EventRecord) {
        if !matches!(event.kind, EventKind::Free) {
            self.totals.record_alloc(event.alloc_size);
        }
        self.events.push(event);
    }

    /// Move every event and total out of `other` into `self`.
    pub fn drain(&mut self, other: &mut AllocCounter) {
        self.totals.drain(&mut other.totals);
        self.events.append(&mut other.events);
    }
}

/// Set while at least one local context is alive.
static TRACING_ENABLED: AtomicBool = AtomicBool::new(false);
static LIVE_CONTEXTS: AtomicUsize = AtomicUsize::new(0);
/// Source of event ids. One process-wide counter so that sorting by id
/// recovers the global event order.
static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// True while events should be recorded. Checked first on every hook entry;
/// a single relaxed load, no thread-local access.
#[inline]
pub fn tracing_enabled() -> bool {
    TRACING_ENABLED.load(Ordering::Relaxed)
}

/// Per-thread recording state.
pub struct LocalContext {
    nest: Cell<u32>,
    counter: RefCell<AllocCounter>,
}

impl LocalContext {
    fn new() -> Self {
        LIVE_CONTEXTS.fetch_add(1, Ordering::SeqCst);
        TRACING_ENABLED.store(true, Ordering::SeqCst);
        Self { nest: Cell::new(0), counter: RefCell::new(AllocCounter::new()) }
    }

    /// Enter the recording section, or `None` if this thread is already
    /// inside it (an allocation made by the recorder itself).
    fn enter(&self) -> Option<NestGuard<'_>> {
        if self.nest.get() > 0 {
            return None;
        }
        self.nest.set(1);
        Some(NestGuard { nest: &self.nest })
    }
}

impl Drop for LocalContext {
    fn drop(&mut self) {
        global().drain(self.counter.get_mut());
        if LIVE_CONTEXTS.fetch_sub(1, Ordering::SeqCst) == 1 {
            TRACING_ENABLED.store(false, Ordering::SeqCst);
        }
    }
}

struct NestGuard<'a> {
    nest: &'a Cell<u32>,
}

impl Drop for NestGuard<'_> {
    fn drop(&mut self) {
        self.nest.set(0);
    }
}

thread_local! {
    static LOCAL: LocalContext = LocalContext::new();
}

/// Process-wide aggregate of drained thread logs.
pub struct GlobalContext {
    counter: Mutex<AllocCounter>,
}

impl GlobalContext {
    #[must_use]
    pub const fn new() -> Self {
        Self { counter: Mutex::new(AllocCounter::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AllocCounter> {
        match self.counter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn drain(&self, local: &mut AllocCounter) {
        self.lock().drain(local);
    }

    /// Take the accumulated log, leaving the aggregate empty.
    #[must_use]
    pub fn take(&self) -> AllocCounter {
        std::mem::take(&mut *self.lock())
    }

    #[must_use]
    pub fn totals(&self) -> AllocCount {
        self.lock().totals
    }
}

impl Default for GlobalContext {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: GlobalContext = GlobalContext::new();

#[must_use]
pub fn global() -> &'static GlobalContext {
    &GLOBAL
}

/// Create the calling thread's local context, enabling tracing. The
/// profiler constructor calls this on the main thread before any hook can
/// observe `tracing_enabled()`.
pub fn init() {
    LOCAL.with(|_| ());
}

/// Record one allocation-family event (`kind` is Alloc or Realloc) for the
/// current thread. Silently does nothing while tracing is disabled, while
/// this thread's recorder is re-entered, or during thread destruction.
pub fn record_alloc(kind: EventKind, size: usize, addr: Addr, hint: Addr) {
    if !tracing_enabled() {
        return;
    }
    let _ = LOCAL.try_with(|local| {
        let Some(_guard) = local.enter() else { return };

        let mut ips = [0usize; MAX_FRAMES];
        // SAFETY: capturing the current thread's own stack.
        let depth = unsafe { unwind(&mut ips) };
        let id = EVENT_COUNTER.fetch_add(1, Ordering::SeqCst);

        local.counter.borrow_mut().record(EventRecord {
            id,
            kind,
            alloc_size: size,
            alloc_addr: addr,
            alloc_hint: hint,
            trace: ips[..depth].to_vec(),
            object_trace: Vec::new(),
        });
    });
}

/// Record one free event for the current thread, scanning the stack between
/// captured frames for destructor frame tags. The freed size is not known
/// here; it is recovered during report generation.
pub fn record_free(addr: Addr) {
    if !tracing_enabled() {
        return;
    }
    let _ = LOCAL.try_with(|local| {
        let Some(_guard) = local.enter() else { return };

        let mut ips = [0usize; MAX_FRAMES];
        let mut sps = [0usize; MAX_FRAMES];
        // SAFETY: capturing the current thread's own stack.
        let depth = unsafe { unwind_with_sp(&mut ips, &mut sps) };
        let object_trace = extract_events(&sps[..depth], MAX_OBJECT_EVENTS);
        let id = EVENT_COUNTER.fetch_add(1, Ordering::SeqCst);

        local.counter.borrow_mut().record(EventRecord {
            id,
            kind: EventKind::Free,
            alloc_size: 0,
            alloc_addr: addr,
            alloc_hint: 0,
            trace: ips[..depth].to_vec(),
            object_trace,
        });
    });
}
