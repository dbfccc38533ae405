//! # heapscope - Allocation Profiler Launcher
//!
//! heapscope profiles the heap activity of an unmodified target program. It
//! works by injecting a recording runtime into the target with `LD_PRELOAD`:
//! the `heapscope-preload` library interposes `malloc`, `free`, `realloc`,
//! and the C++ `operator new`/`delete` family, logs every event with a call
//! stack, and writes an indexed JSON report when the target exits. This
//! crate is the user-facing side: it assembles the environment, spawns the
//! target, and analyzes the resulting report.
//!
//! ## Operational modes
//!
//! - **Launch** (`heapscope -- <command> [args...]`): run a target under the
//!   profiler, mirroring its exit code
//! - **Analyze** (`heapscope --report stats.json`): summarize an existing
//!   report without running anything
//!
//! ## Module Structure
//!
//! - [`cli`]: argument definitions
//! - [`launch`]: environment assembly and target process supervision
//! - [`preflight`]: sanity checks before spawning (target exists, runtime
//!   library locatable, debug-info advisory)
//! - [`analysis`]: report loading, totals, and per-site aggregation

// Expose modules for testing
pub mod analysis;
pub mod cli;
pub mod launch;
pub mod preflight;
