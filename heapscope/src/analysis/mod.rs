//! Analysis logic for allocation reports
//!
//! Pure post-processing over a loaded report: whole-run totals and per-site
//! aggregation, separated from the presentation in `main`.

pub mod site_analyzer;

pub use site_analyzer::{analyze_sites, AllocationSite};

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use heapscope_common::{EventKind, OutputRecord};

/// Load and validate a report file.
pub fn load_report(path: &Path) -> Result<OutputRecord> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read report: {}", path.display()))?;
    let record: OutputRecord = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse report: {}", path.display()))?;
    record
        .validate()
        .with_context(|| format!("Report is internally inconsistent: {}", path.display()))?;
    Ok(record)
}

/// Whole-run totals derived from the event table.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReportTotals {
    pub alloc_count: u64,
    pub free_count: u64,
    pub realloc_count: u64,
    /// Sum of all requested sizes (allocations and reallocations).
    pub allocated_bytes: u64,
    /// Allocations never freed before exit.
    pub leaked_count: u64,
    pub leaked_bytes: u64,
}

impl ReportTotals {
    /// Replay the event table in order, tracking live allocations the same
    /// way the runtime's free-size recovery does.
    #[must_use]
    pub fn from_record(record: &OutputRecord) -> Self {
        let mut totals = Self::default();
        let mut live: HashMap<u64, u64> = HashMap::new();
        for event in &record.event_table {
            match event.kind {
                EventKind::Alloc => {
                    totals.alloc_count += 1;
                    totals.allocated_bytes += event.alloc_size;
                    live.insert(event.alloc_addr, event.alloc_size);
                }
                EventKind::Realloc => {
                    totals.realloc_count += 1;
                    totals.allocated_bytes += event.alloc_size;
                    live.remove(&event.alloc_hint);
                    live.insert(event.alloc_addr, event.alloc_size);
                }
                EventKind::Free => {
                    totals.free_count += 1;
                    live.remove(&event.alloc_addr);
                }
            }
        }
        totals.leaked_count = live.len() as u64;
        totals.leaked_bytes = live.values().sum();
        totals
    }
}

/// Print the human-readable summary for a loaded report.
pub fn print_summary(record: &OutputRecord, top: usize) {
    let totals = ReportTotals::from_record(record);

    println!("ALLOCATION SUMMARY");
    println!("  events        {}", record.event_table.len());
    println!(
        "  allocations   {} ({} bytes requested)",
        totals.alloc_count + totals.realloc_count,
        totals.allocated_bytes
    );
    println!("  frees         {}", totals.free_count);
    println!(
        "  live at exit  {} allocations, {} bytes",
        totals.leaked_count, totals.leaked_bytes
    );

    let sites = analyze_sites(record, top);
    if sites.is_empty() {
        return;
    }
    println!();
    println!("TOP CALL SITES (by bytes requested)");
    for site in &sites {
        print!("  {:>5.1}%  {:>12}  {}", site.percentage, site.bytes, site.name);
        if let Some(file) = &site.file {
            print!("  ({file}");
            if let Some(line) = site.line {
                print!(":{line}");
            }
            print!(")");
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapscope_common::OutputEvent;

    fn event(id: u64, kind: EventKind, size: u64, addr: u64, hint: u64) -> OutputEvent {
        OutputEvent {
            id,
            kind,
            alloc_size: size,
            alloc_addr: addr,
            alloc_hint: hint,
            pc_id: Vec::new(),
            object_info: None,
        }
    }

    #[test]
    fn test_totals_track_leaks_through_realloc() {
        let record = OutputRecord {
            event_table: vec![
                event(0, EventKind::Alloc, 16, 0x10, 0),
                event(1, EventKind::Realloc, 64, 0x20, 0x10),
                event(2, EventKind::Alloc, 8, 0x30, 0),
                event(3, EventKind::Free, 8, 0x30, 0),
            ],
            ..OutputRecord::default()
        };
        let totals = ReportTotals::from_record(&record);
        assert_eq!(
            totals,
            ReportTotals {
                alloc_count: 2,
                free_count: 1,
                realloc_count: 1,
                allocated_bytes: 88,
                leaked_count: 1,
                leaked_bytes: 64,
            }
        );
    }

    #[test]
    fn test_load_report_rejects_invalid_cross_references() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");

        let mut record = OutputRecord::default();
        let mut bad = event(0, EventKind::Alloc, 1, 0x10, 0);
        bad.pc_id.push(3); // frame table is empty
        record.event_table.push(bad);
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        assert!(load_report(&path).is_err());
    }
}
