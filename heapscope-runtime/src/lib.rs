//! # heapscope-runtime - In-Process Allocation Profiling Runtime
//!
//! This crate is the core of heapscope: it records every allocation and
//! deallocation the host process performs, annotates each event with a call
//! stack (and, on the free path, with any destructor frame tags found on the
//! stack), and turns the accumulated log into an indexed JSON report at
//! process exit.
//!
//! It is deliberately free of `#[no_mangle]` exports so it can be unit-tested
//! as an ordinary rlib; the companion `heapscope-preload` cdylib supplies the
//! actual `malloc`/`free` symbol interposition and forwards into the
//! recording API here.
//!
//! ## Module Structure
//!
//! - [`record`]: the event log - per-thread local contexts with a recursion
//!   guard, a mutex-protected global aggregate, and the atomic event-id
//!   counter that totally orders events across threads
//! - [`unwind`]: instruction/stack-pointer capture for the current thread
//! - [`frametag`]: the stack-embedded, checksummed destructor marker protocol
//!   (`save_state` writes it, a bounded raw-memory scan recovers it)
//! - [`real_alloc`]: resolution of the real allocator implementation that the
//!   interposed symbols must delegate to
//! - [`report`]: the output-record builder (consolidation, symbolization,
//!   string/type/frame table construction) and the JSON writer
//! - [`config`]: environment-variable configuration
//! - [`domain`]: shared error types
//!
//! ## Hot path vs. cold path
//!
//! Recording an event touches only thread-local state after one lock-free
//! atomic check; the process-wide lock is taken only when a thread exits
//! (draining its log into the global aggregate) and once at process exit
//! (report generation). See `record` for the lifecycle invariants.

pub mod config;
pub mod counters;
pub mod domain;
pub mod frametag;
pub mod real_alloc;
pub mod record;
pub mod report;
pub mod unwind;

pub use counters::AllocCount;
pub use domain::{ReportError, SymbolizeError};
pub use frametag::{save_state, FrameTagSlot, TypeDescriptor};
pub use record::{record_alloc, record_free, tracing_enabled, EventKind};
