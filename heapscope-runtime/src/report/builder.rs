//! Turns the raw event log into the indexed output record.
//!
//! Build order matters: events are sorted by id first (draining interleaves
//! per-thread logs arbitrarily), then free sizes are recovered by replaying
//! the allocation history, and only then are strings, frames, and types
//! interned so every index in the result refers to a finished table.

use std::collections::HashMap;

use heapscope_common::{EventKind, FrameTable, ObjectInfo, OutputEvent, OutputRecord, TypeDataTable};

use crate::domain::Addr;
use crate::frametag::TypeDescriptor;
use crate::record::{AllocCounter, EventRecord};
use crate::report::strtab::StringTable;
use crate::report::symbolize::Symbolizer;

/// Back-fill the size of each free event by replaying allocations in id
/// order. The allocator can hand the same address out repeatedly, so the
/// replay is last-write-wins: a free always pairs with the latest live
/// allocation at its address. Unmatched frees (allocations predating the
/// profiler, or foreign memory) keep size 0.
pub fn compute_free_sizes(events: &mut [EventRecord]) {
    let mut live: HashMap<Addr, usize> = HashMap::new();
    for event in events {
        match event.kind {
            EventKind::Alloc => {
                live.insert(event.alloc_addr, event.alloc_size);
            }
            EventKind::Realloc => {
                live.remove(&event.alloc_hint);
                live.insert(event.alloc_addr, event.alloc_size);
            }
            EventKind::Free => {
                if let Some(size) = live.remove(&event.alloc_addr) {
                    event.alloc_size = size;
                }
            }
        }
    }
}

/// Build the full output record from a drained event log.
#[must_use]
pub fn build_report(mut counter: AllocCounter, symbolizer: &Symbolizer) -> OutputRecord {
    let mut events = std::mem::take(&mut counter.events);
    events.sort_unstable_by_key(|e| e.id);
    compute_free_sizes(&mut events);

    let mut strtab = StringTable::new();

    let mut pcs: Vec<Addr> = events.iter().flat_map(|e| e.trace.iter().copied()).collect();
    pcs.sort_unstable();
    pcs.dedup();
    let pc_index: HashMap<Addr, usize> =
        pcs.iter().enumerate().map(|(i, &pc)| (pc, i)).collect();

    let frame_table = build_frame_table(&pcs, symbolizer, &mut strtab);

    // Distinct descriptors, ordered by address like the pc table: the table
    // layout must not depend on event encounter order.
    let mut descriptors: Vec<&'static TypeDescriptor> = events
        .iter()
        .flat_map(|e| e.object_trace.iter().map(|o| o.type_data))
        .collect();
    descriptors.sort_unstable_by_key(|d| std::ptr::from_ref(*d) as usize);
    descriptors.dedup_by_key(|d| std::ptr::from_ref(*d) as usize);

    let mut types = TypeTable::new();
    for desc in descriptors {
        types.intern(desc, &mut strtab);
    }

    let mut event_table = Vec::with_capacity(events.len());
    for event in events {
        // pc_index was built from these same traces, so lookups cannot miss.
        let pc_id = event.trace.iter().map(|ip| pc_index[ip]).collect();

        let object_info = if event.object_trace.is_empty() {
            None
        } else {
            let mut info = ObjectInfo::default();
            for obj in &event.object_trace {
                info.trace_index.push(obj.trace_index);
                info.object_id.push(obj.object_id);
                info.addr.push(obj.addr as u64);
                info.size.push(obj.type_data.size as u64);
                info.type_name.push(strtab.intern(obj.type_data.type_name));
                info.type_data.push(types.intern(obj.type_data, &mut strtab));
            }
            Some(info)
        };

        event_table.push(OutputEvent {
            id: event.id,
            kind: event.kind,
            alloc_size: event.alloc_size as u64,
            alloc_addr: event.alloc_addr as u64,
            alloc_hint: event.alloc_hint as u64,
            pc_id,
            object_info,
        });
    }

    OutputRecord {
        strtab: strtab.into_vec(),
        frame_table,
        type_data_table: types.finish(),
        event_table,
    }
}

fn build_frame_table(
    pcs: &[Addr],
    symbolizer: &Symbolizer,
    strtab: &mut StringTable,
) -> FrameTable {
    let mut table = FrameTable { offsets: vec![0], ..FrameTable::default() };
    for &pc in pcs {
        let resolved = symbolizer.resolve(pc as u64);
        table.pc.push(pc as u64);
        table.object_path.push(strtab.intern_opt(resolved.object_path.as_deref()));
        table.object_address.push(resolved.object_address);
        table.object_symbol.push(strtab.intern_opt(resolved.object_symbol.as_deref()));
        for frame in &resolved.frames {
            table.func.push(strtab.intern_opt(frame.func.as_deref()));
            table.file.push(strtab.intern_opt(frame.file.as_deref()));
            table.line.push(frame.line);
            table.column.push(frame.column);
            table.is_inline.push(u8::from(frame.is_inline));
        }
        table.offsets.push(table.func.len());
    }
    table
}

/// Type-layout interner keyed by descriptor address (one static descriptor
/// exists per type, so the address is the identity).
struct TypeTable {
    table: TypeDataTable,
    index: HashMap<usize, usize>,
}

impl TypeTable {
    fn new() -> Self {
        Self {
            table: TypeDataTable {
                field_off: vec![0],
                base_off: vec![0],
                ..TypeDataTable::default()
            },
            index: HashMap::new(),
        }
    }

    fn intern(&mut self, desc: &'static TypeDescriptor, strtab: &mut StringTable) -> usize {
        let key = std::ptr::from_ref(desc) as usize;
        if let Some(&i) = self.index.get(&key) {
            return i;
        }

        let i = self.table.size.len();
        self.table.size.push(desc.size as u64);
        self.table.type_name.push(strtab.intern(desc.type_name));
        for field in desc.fields {
            self.table.field_names.push(strtab.intern(field.name));
            self.table.field_types.push(strtab.intern(field.type_name));
            self.table.field_sizes.push(field.size as u64);
            self.table.field_offsets.push(field.offset as u64);
        }
        self.table.field_off.push(self.table.field_names.len());
        for base in desc.bases {
            self.table.base_types.push(strtab.intern(base.type_name));
            self.table.base_sizes.push(base.size as u64);
            self.table.base_offsets.push(base.offset as u64);
        }
        self.table.base_off.push(self.table.base_types.len());

        self.index.insert(key, i);
        i
    }

    fn finish(self) -> TypeDataTable {
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::AllocCount;
    use crate::frametag::{FieldDescriptor, ObjectEvent};

    fn event(id: u64, kind: EventKind, size: usize, addr: Addr, hint: Addr) -> EventRecord {
        EventRecord {
            id,
            kind,
            alloc_size: size,
            alloc_addr: addr,
            alloc_hint: hint,
            trace: vec![0x1000, 0x2000],
            object_trace: Vec::new(),
        }
    }

    #[test]
    fn test_free_sizes_pair_with_latest_allocation() {
        // The same address is allocated, freed, and allocated again with a
        // different size; each free must see its own generation's size.
        let mut events = vec![
            event(0, EventKind::Alloc, 16, 0x10, 0),
            event(1, EventKind::Free, 0, 0x10, 0),
            event(2, EventKind::Alloc, 32, 0x10, 0),
            event(3, EventKind::Free, 0, 0x10, 0),
        ];
        compute_free_sizes(&mut events);
        assert_eq!(events[1].alloc_size, 16);
        assert_eq!(events[3].alloc_size, 32);
    }

    #[test]
    fn test_free_sizes_follow_realloc_moves() {
        let mut events = vec![
            event(0, EventKind::Alloc, 16, 0x10, 0),
            event(1, EventKind::Realloc, 64, 0x20, 0x10),
            event(2, EventKind::Free, 0, 0x10, 0), // stale address
            event(3, EventKind::Free, 0, 0x20, 0),
        ];
        compute_free_sizes(&mut events);
        assert_eq!(events[2].alloc_size, 0, "freed address was consumed by realloc");
        assert_eq!(events[3].alloc_size, 64);
    }

    #[test]
    fn test_unmatched_free_keeps_zero_size() {
        let mut events = vec![event(0, EventKind::Free, 0, 0xbeef, 0)];
        compute_free_sizes(&mut events);
        assert_eq!(events[0].alloc_size, 0);
    }

    fn build(events: Vec<EventRecord>) -> OutputRecord {
        let counter = AllocCounter { totals: AllocCount::new(), events };
        build_report(counter, &Symbolizer::new())
    }

    #[test]
    fn test_report_validates_and_indexes_traces() {
        // Events arrive unsorted, as drained thread logs would be.
        let record = build(vec![
            event(1, EventKind::Free, 0, 0x10, 0),
            event(0, EventKind::Alloc, 16, 0x10, 0),
        ]);
        record.validate().expect("built report must validate");

        assert_eq!(record.event_table[0].id, 0);
        assert_eq!(record.event_table[1].id, 1);
        assert_eq!(record.event_table[1].alloc_size, 16, "free size back-filled");

        // Both events share the same two fake pcs.
        assert_eq!(record.frame_table.pc_count(), 2);
        assert_eq!(record.event_table[0].pc_id, record.event_table[1].pc_id);
        assert_eq!(record.strtab[0], "");
    }

    static WIDGET_FIELDS: [FieldDescriptor; 1] =
        [FieldDescriptor { name: "len", type_name: "usize", size: 8, offset: 0 }];
    static WIDGET: TypeDescriptor =
        TypeDescriptor { size: 24, type_name: "Widget", fields: &WIDGET_FIELDS, bases: &[] };

    #[test]
    fn test_object_traces_populate_type_table() {
        let mut free = event(1, EventKind::Free, 0, 0x10, 0);
        free.object_trace = vec![
            ObjectEvent { trace_index: 0, object_id: 7, addr: 0x10, type_data: &WIDGET },
            ObjectEvent { trace_index: 1, object_id: 8, addr: 0x40, type_data: &WIDGET },
        ];
        let record = build(vec![event(0, EventKind::Alloc, 24, 0x10, 0), free]);
        record.validate().expect("built report must validate");

        let info = record.event_table[1].object_info.as_ref().expect("object info present");
        assert_eq!(info.len(), 2);
        assert_eq!(info.object_id, vec![7, 8]);
        // Shared descriptor interns to one type-table entry.
        assert_eq!(info.type_data, vec![0, 0]);

        let types = &record.type_data_table;
        assert_eq!(types.type_count(), 1);
        assert_eq!(types.size, vec![24]);
        assert_eq!(types.field_off, vec![0, 1]);
        assert_eq!(record.strtab[types.type_name[0]], "Widget");
        assert_eq!(record.strtab[types.field_names[0]], "len");
    }

    static ALPHA: TypeDescriptor =
        TypeDescriptor { size: 8, type_name: "Alpha", fields: &[], bases: &[] };
    static BETA: TypeDescriptor =
        TypeDescriptor { size: 16, type_name: "Beta", fields: &[], bases: &[] };

    #[test]
    fn test_type_table_ordered_by_descriptor_address() {
        // Reference the higher-addressed descriptor first so encounter order
        // and address order disagree; the table must follow address order.
        let (hi, lo) = if std::ptr::from_ref(&ALPHA) as usize > std::ptr::from_ref(&BETA) as usize
        {
            (&ALPHA, &BETA)
        } else {
            (&BETA, &ALPHA)
        };

        let mut free = event(1, EventKind::Free, 0, 0x10, 0);
        free.object_trace = vec![
            ObjectEvent { trace_index: 0, object_id: 1, addr: 0x10, type_data: hi },
            ObjectEvent { trace_index: 1, object_id: 2, addr: 0x40, type_data: lo },
        ];
        let record = build(vec![event(0, EventKind::Alloc, 8, 0x10, 0), free]);
        record.validate().expect("built report must validate");

        let types = &record.type_data_table;
        assert_eq!(types.type_count(), 2);
        assert_eq!(record.strtab[types.type_name[0]], lo.type_name);
        assert_eq!(record.strtab[types.type_name[1]], hi.type_name);

        // Events still index into the reordered table correctly.
        let info = record.event_table[1].object_info.as_ref().expect("object info present");
        assert_eq!(info.type_data, vec![1, 0]);
    }

    #[test]
    fn test_alloc_events_have_null_object_info() {
        let record = build(vec![event(0, EventKind::Alloc, 8, 0x10, 0)]);
        assert!(record.event_table[0].object_info.is_none());
    }
}
