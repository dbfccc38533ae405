//! End-to-end report generation: a synthetic event log with real captured
//! stacks goes through consolidation, symbolization, and JSON output, and
//! the written report is read back and checked against the schema's
//! structural invariants.

use heapscope_common::{EventKind, OutputRecord};
use heapscope_runtime::record::{AllocCounter, EventRecord};
use heapscope_runtime::report::{build_report, write_report, Symbolizer};
use heapscope_runtime::unwind;

#[inline(never)]
fn capture_trace() -> Vec<usize> {
    let mut ips = [0usize; 64];
    let depth = unsafe { unwind::unwind(&mut ips) };
    ips[..depth].to_vec()
}

fn event(id: u64, kind: EventKind, size: usize, addr: usize, trace: Vec<usize>) -> EventRecord {
    EventRecord {
        id,
        kind,
        alloc_size: size,
        alloc_addr: addr,
        alloc_hint: 0,
        trace,
        object_trace: Vec::new(),
    }
}

#[test]
fn test_report_round_trip() {
    let trace = capture_trace();
    assert!(!trace.is_empty());

    let mut counter = AllocCounter::new();
    // Out of id order, as interleaved thread drains would be.
    counter.record(event(2, EventKind::Free, 0, 0x5000, trace.clone()));
    counter.record(event(0, EventKind::Alloc, 48, 0x5000, trace.clone()));
    counter.record(event(1, EventKind::Alloc, 16, 0x6000, trace));

    let record = build_report(counter, &Symbolizer::new());
    record.validate().expect("built report must validate");

    // Consolidation: sorted by id, free size recovered from the allocation.
    let ids: Vec<u64> = record.event_table.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(record.event_table[2].kind, EventKind::Free);
    assert_eq!(record.event_table[2].alloc_size, 48);

    // Every pc expands to at least one frame, physical frame last.
    let ft = &record.frame_table;
    assert!(ft.pc_count() > 0);
    for i in 0..ft.pc_count() {
        let range = ft.frame_range(i);
        assert!(!range.is_empty(), "pc {i} has no frames");
        let non_inline = range.clone().filter(|&f| ft.is_inline[f] == 0).count();
        assert_eq!(non_inline, 1, "pc {i} must have exactly one physical frame");
        assert_eq!(ft.is_inline[range.end - 1], 0);
    }

    // Our own test code ran with debug info, so at least one frame should
    // have symbolized to a function name.
    let named = ft.func.iter().any(|&f| !record.strtab[f].is_empty());
    assert!(named, "expected at least one symbolized function name");

    // Write, read back, and re-validate.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.json");
    write_report(&record, &path).unwrap();

    let back: OutputRecord =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    back.validate().expect("round-tripped report must validate");
    assert_eq!(back.event_table.len(), 3);
    assert_eq!(back.strtab, record.strtab);
}
