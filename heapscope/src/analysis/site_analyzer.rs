//! Call-site aggregation for allocation reports.
//!
//! Groups allocation events by the function that requested the memory and
//! ranks sites by bytes requested. The innermost frames of every trace
//! belong to the profiler and the allocator entry points themselves, so
//! attribution walks outward past those to the first application frame.

#![allow(clippy::cast_precision_loss)]

use std::collections::HashMap;

use heapscope_common::{EventKind, OutputRecord};

/// An aggregated allocation site.
#[derive(Debug, Clone)]
pub struct AllocationSite {
    /// Function name attributed with the allocations.
    pub name: String,
    /// Source file of the function (if debug info was available).
    pub file: Option<String>,
    /// Source line (if debug info was available).
    pub line: Option<u32>,
    /// Total bytes requested from this site.
    pub bytes: u64,
    /// Number of allocation events from this site.
    pub count: u64,
    /// Share of all requested bytes (0.0 - 100.0).
    pub percentage: f64,
}

#[derive(Default)]
struct SiteStats {
    bytes: u64,
    count: u64,
    file: Option<String>,
    line: Option<u32>,
}

/// Frames that can never be an application call site: the interposed entry
/// points and the recording runtime underneath them.
fn is_profiler_frame(name: &str) -> bool {
    const ENTRY_POINTS: &[&str] = &[
        "malloc",
        "calloc",
        "realloc",
        "free",
        "memalign",
        "aligned_alloc",
        "posix_memalign",
    ];
    name.contains("heapscope")
        || name.starts_with("operator new")
        || name.starts_with("operator delete")
        || ENTRY_POINTS.contains(&name)
}

/// Walk a trace from the innermost frame outward and return the first
/// logical frame that belongs to the application.
fn attribute<'a>(record: &'a OutputRecord, pc_id: &[usize]) -> Option<(&'a str, usize)> {
    let ft = &record.frame_table;
    for &pc in pc_id {
        for frame in ft.frame_range(pc) {
            let name = record.string(ft.func[frame]).unwrap_or("");
            if name.is_empty() || is_profiler_frame(name) {
                continue;
            }
            return Some((name, frame));
        }
    }
    None
}

/// Aggregate allocation events by call site, ranked by bytes requested,
/// truncated to the `top` largest.
#[must_use]
pub fn analyze_sites(record: &OutputRecord, top: usize) -> Vec<AllocationSite> {
    let mut sites: HashMap<String, SiteStats> = HashMap::new();
    let mut total_bytes = 0u64;

    for event in &record.event_table {
        if event.kind == EventKind::Free {
            continue;
        }
        total_bytes += event.alloc_size;

        let (name, frame) = match attribute(record, &event.pc_id) {
            Some(hit) => hit,
            None => ("<unknown>", usize::MAX),
        };
        let stats = sites.entry(name.to_string()).or_default();
        stats.bytes += event.alloc_size;
        stats.count += 1;
        if stats.file.is_none() && frame != usize::MAX {
            let ft = &record.frame_table;
            stats.file = record.string(ft.file[frame]).filter(|f| !f.is_empty()).map(String::from);
            stats.line = Some(ft.line[frame]).filter(|&l| l != 0);
        }
    }

    let mut ranked: Vec<AllocationSite> = sites
        .into_iter()
        .map(|(name, stats)| AllocationSite {
            name,
            file: stats.file,
            line: stats.line,
            bytes: stats.bytes,
            count: stats.count,
            percentage: if total_bytes == 0 {
                0.0
            } else {
                stats.bytes as f64 / total_bytes as f64 * 100.0
            },
        })
        .collect();
    ranked.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.name.cmp(&b.name)));
    ranked.truncate(top);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapscope_common::{FrameTable, OutputEvent};

    /// Two pcs: pc 0 is the interposed `malloc` shim, pc 1 is application
    /// code with one inline frame above the physical one.
    fn sample_record() -> OutputRecord {
        OutputRecord {
            strtab: vec![
                String::new(),
                "malloc".into(),
                "grow_buffer".into(),
                "app::ingest".into(),
                "src/ingest.rs".into(),
            ],
            frame_table: FrameTable {
                pc: vec![0x1000, 0x2000],
                object_path: vec![0, 0],
                object_address: vec![0x1000, 0x2000],
                object_symbol: vec![1, 3],
                offsets: vec![0, 1, 3],
                file: vec![0, 4, 4],
                func: vec![1, 2, 3],
                line: vec![0, 12, 80],
                column: vec![0, 0, 0],
                is_inline: vec![0, 1, 0],
            },
            event_table: vec![
                OutputEvent {
                    id: 0,
                    kind: EventKind::Alloc,
                    alloc_size: 96,
                    alloc_addr: 0x10,
                    alloc_hint: 0,
                    pc_id: vec![0, 1],
                    object_info: None,
                },
                OutputEvent {
                    id: 1,
                    kind: EventKind::Alloc,
                    alloc_size: 32,
                    alloc_addr: 0x20,
                    alloc_hint: 0,
                    pc_id: vec![0, 1],
                    object_info: None,
                },
                OutputEvent {
                    id: 2,
                    kind: EventKind::Free,
                    alloc_size: 96,
                    alloc_addr: 0x10,
                    alloc_hint: 0,
                    pc_id: vec![0],
                    object_info: None,
                },
            ],
            ..OutputRecord::default()
        }
    }

    #[test]
    fn test_attribution_skips_allocator_entry_points() {
        let record = sample_record();
        let sites = analyze_sites(&record, 10);
        assert_eq!(sites.len(), 1);

        let site = &sites[0];
        // The malloc shim at pc 0 is skipped; the inline frame at pc 1 wins.
        assert_eq!(site.name, "grow_buffer");
        assert_eq!(site.bytes, 128);
        assert_eq!(site.count, 2, "frees must not count as sites");
        assert!((site.percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(site.file.as_deref(), Some("src/ingest.rs"));
        assert_eq!(site.line, Some(12));
    }

    #[test]
    fn test_top_truncates_ranking() {
        let mut record = sample_record();
        // Orphan the smaller event so it forms a second, smaller site.
        record.event_table[1].pc_id = Vec::new();

        let all = analyze_sites(&record, 10);
        assert_eq!(all.len(), 2);

        let top = analyze_sites(&record, 1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].name, "grow_buffer");
        assert_eq!(top[0].bytes, 96);
    }

    #[test]
    fn test_traceless_events_fall_back_to_unknown() {
        let record = OutputRecord {
            event_table: vec![OutputEvent {
                id: 0,
                kind: EventKind::Alloc,
                alloc_size: 8,
                alloc_addr: 0x10,
                alloc_hint: 0,
                pc_id: Vec::new(),
                object_info: None,
            }],
            ..OutputRecord::default()
        };
        let sites = analyze_sites(&record, 5);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].name, "<unknown>");
    }
}
