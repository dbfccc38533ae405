//! Report generation: consolidation, symbolization, and JSON output.
//!
//! Everything here runs once, at process exit, after tracing has already
//! been disabled by the last thread context's teardown. It is ordinary
//! allocating Rust code; nothing in this module may be reached from the
//! allocation hot path.

pub mod builder;
pub mod strtab;
pub mod symbolize;
pub mod writer;

use std::path::PathBuf;

pub use builder::{build_report, compute_free_sizes};
pub use symbolize::Symbolizer;
pub use writer::write_report;

use crate::config;
use crate::domain::ReportError;
use crate::record;

/// A process is secondary when it inherited the profiler from an ancestor
/// under `--profile-children`; its report must not clobber the ancestor's.
fn is_secondary() -> bool {
    match std::env::var(config::ENV_STARTED) {
        Ok(value) => value != std::process::id().to_string(),
        Err(_) => false,
    }
}

/// Drain the global event log, build the report, and write it to this
/// process's report path. Called from the exit hook.
pub fn write_process_report() -> Result<PathBuf, ReportError> {
    let pid = std::process::id();
    let path = config::global().report_path(is_secondary(), pid);

    let counter = record::global().take();
    log::info!(
        "writing report for pid {pid}: {} events, {} allocations, {} bytes to {}",
        counter.events.len(),
        counter.totals.num_allocs,
        counter.totals.num_bytes,
        path.display()
    );

    let symbolizer = Symbolizer::new();
    let output = build_report(counter, &symbolizer);
    write_report(&output, &path)?;
    Ok(path)
}
