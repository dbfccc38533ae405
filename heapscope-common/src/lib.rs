//! Report schema shared between the heapscope runtime (which writes reports
//! at process exit) and the heapscope CLI (which loads them for analysis).
//!
//! The report is a single JSON document built around integer indices: every
//! textual field is an index into `strtab`, every program counter in an
//! event's stack is an index into `frame_table`, and every object trace entry
//! points into `type_data_table`. This keeps report size dominated by counts
//! rather than by repeated strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variables forming the contract between the launcher CLI and
/// the injected runtime.
pub mod env {
    /// Report output path override.
    pub const ENV_OUT: &str = "HEAPSCOPE_OUT";
    /// Log filter for the runtime's diagnostics (env_logger syntax).
    pub const ENV_LOG: &str = "HEAPSCOPE_LOG";
    /// Whether child processes spawned by the target should also be profiled.
    pub const ENV_PROFILE_CHILDREN: &str = "HEAPSCOPE_PROFILE_CHILDREN";
    /// Set by the first profiled process so descendants can tell they are
    /// not it.
    pub const ENV_STARTED: &str = "HEAPSCOPE_STARTED";

    /// Default report path when `HEAPSCOPE_OUT` is unset.
    pub const DEFAULT_OUT: &str = "malloc_stats.json";
}

/// Index into the report's string table.
pub type StrIndex = usize;

/// Classifies an allocation event.
///
/// `Realloc` covers the resize path; plain `malloc`/`calloc`/`memalign` and
/// the C++ `new` family all record as `Alloc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Alloc,
    Free,
    Realloc,
}

/// A single recorded allocation event, with raw pointers and strings replaced
/// by table indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEvent {
    /// Unique 64-bit stamp ordering events chronologically across threads.
    /// The first event recorded by the process has id 0.
    pub id: u64,

    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Size of the allocation in bytes. For `Free` events this is back-filled
    /// during consolidation from the matching allocation.
    pub alloc_size: u64,

    /// Pointer returned by the allocator (or passed to free).
    pub alloc_addr: u64,

    /// Input pointer, e.g. the old pointer passed to realloc. 0 if absent.
    pub alloc_hint: u64,

    /// Call stack as frame-table indices, innermost frame first.
    pub pc_id: Vec<usize>,

    /// Objects found on the stack during capture (free path only).
    /// Serialized as `null` when no scan ran or nothing was found.
    pub object_info: Option<ObjectInfo>,
}

/// Parallel arrays describing the objects whose destructor frames were found
/// on the stack when a free event was recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Index into the event's stack trace where each object was discovered.
    pub trace_index: Vec<usize>,
    /// Destructor invocation id (unique over the program's lifetime).
    pub object_id: Vec<u64>,
    /// Address of the object under destruction (`this` pointer).
    pub addr: Vec<u64>,
    /// Size of the object's type.
    pub size: Vec<u64>,
    /// Type name, as a string-table index.
    #[serde(rename = "type")]
    pub type_name: Vec<StrIndex>,
    /// Index into the type-data table.
    pub type_data: Vec<usize>,
}

impl ObjectInfo {
    #[must_use]
    pub fn len(&self) -> usize {
        self.trace_index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trace_index.is_empty()
    }
}

/// Symbol and source information for every distinct program counter that
/// appears in any event's stack trace.
///
/// A single program counter expands to one or more logical frames when the
/// compiler inlined calls at that address. The frames for `pc[i]` occupy
/// `offsets[i]..offsets[i + 1]` in the per-frame arrays; the last frame of
/// each range is the physical (non-inline) one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameTable {
    /// Distinct program counters, sorted ascending.
    pub pc: Vec<u64>,

    /// Path of the object file containing each pc (string-table index).
    pub object_path: Vec<StrIndex>,
    /// Address of each pc relative to its object file's load base.
    pub object_address: Vec<u64>,
    /// Nearest exported symbol for each pc (string-table index).
    pub object_symbol: Vec<StrIndex>,

    /// Prefix sums delimiting each pc's frame range; length is `pc.len() + 1`.
    pub offsets: Vec<usize>,

    /// Source file per logical frame (string-table index).
    pub file: Vec<StrIndex>,
    /// Function name per logical frame (string-table index).
    pub func: Vec<StrIndex>,
    /// Source line per logical frame; 0 if unknown.
    pub line: Vec<u32>,
    /// Source column per logical frame; 0 if unknown.
    pub column: Vec<u32>,
    /// 1 if the frame was produced by inline expansion, else 0.
    pub is_inline: Vec<u8>,
}

impl FrameTable {
    /// Number of distinct program counters in the table.
    #[must_use]
    pub fn pc_count(&self) -> usize {
        self.pc.len()
    }

    /// Range of logical-frame indices for the `i`-th program counter.
    #[must_use]
    pub fn frame_range(&self, i: usize) -> std::ops::Range<usize> {
        self.offsets[i]..self.offsets[i + 1]
    }
}

/// Deduplicated type layouts, flattened into parallel arrays.
///
/// Types have a variable number of fields and bases, delimited by the
/// `field_off` / `base_off` prefix-sum arrays: for type `i`, its fields are
/// `field_off[i]..field_off[i + 1]` in the `field_*` arrays, and likewise
/// for bases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeDataTable {
    /// Total size of each type.
    pub size: Vec<u64>,
    /// Name of each type (string-table index).
    #[serde(rename = "type")]
    pub type_name: Vec<StrIndex>,

    /// Prefix sums delimiting each type's fields; length is `size.len() + 1`.
    pub field_off: Vec<usize>,
    pub field_names: Vec<StrIndex>,
    pub field_types: Vec<StrIndex>,
    pub field_sizes: Vec<u64>,
    pub field_offsets: Vec<u64>,

    /// Prefix sums delimiting each type's bases; length is `size.len() + 1`.
    pub base_off: Vec<usize>,
    pub base_types: Vec<StrIndex>,
    pub base_sizes: Vec<u64>,
    pub base_offsets: Vec<u64>,
}

impl TypeDataTable {
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.size.len()
    }
}

/// The full serialized report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputRecord {
    pub strtab: Vec<String>,
    pub frame_table: FrameTable,
    pub type_data_table: TypeDataTable,
    pub event_table: Vec<OutputEvent>,
}

/// A cross-reference in a report that points outside its target table.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("string index {index} out of bounds in {context} (strtab has {len} entries)")]
    StrIndex { context: &'static str, index: usize, len: usize },

    #[error("frame index {index} out of bounds in event {event} (frame table has {len} pcs)")]
    FrameIndex { event: u64, index: usize, len: usize },

    #[error("type-data index {index} out of bounds in event {event} (table has {len} types)")]
    TypeIndex { event: u64, index: usize, len: usize },

    #[error("offsets array in {context} is not a prefix sum covering {expected} entries")]
    Offsets { context: &'static str, expected: usize },

    #[error("event table is not sorted by event id")]
    Unsorted,
}

impl OutputRecord {
    /// Look up a string by index, if in bounds.
    #[must_use]
    pub fn string(&self, index: StrIndex) -> Option<&str> {
        self.strtab.get(index).map(String::as_str)
    }

    /// Check that every index referenced by any event, frame-table entry, or
    /// type entry resolves within bounds, and that events are sorted by id.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let nstr = self.strtab.len();
        let check_str = |context: &'static str, indices: &[StrIndex]| {
            match indices.iter().find(|&&i| i >= nstr) {
                Some(&index) => Err(ValidationError::StrIndex { context, index, len: nstr }),
                None => Ok(()),
            }
        };

        let ft = &self.frame_table;
        check_str("frame_table.object_path", &ft.object_path)?;
        check_str("frame_table.object_symbol", &ft.object_symbol)?;
        check_str("frame_table.file", &ft.file)?;
        check_str("frame_table.func", &ft.func)?;
        validate_offsets("frame_table.offsets", &ft.offsets, ft.pc.len(), ft.func.len())?;

        let tt = &self.type_data_table;
        check_str("type_data_table.type", &tt.type_name)?;
        check_str("type_data_table.field_names", &tt.field_names)?;
        check_str("type_data_table.field_types", &tt.field_types)?;
        check_str("type_data_table.base_types", &tt.base_types)?;
        validate_offsets("type_data_table.field_off", &tt.field_off, tt.size.len(), tt.field_names.len())?;
        validate_offsets("type_data_table.base_off", &tt.base_off, tt.size.len(), tt.base_types.len())?;

        let npc = ft.pc.len();
        let ntype = tt.size.len();
        let mut last_id = None;
        for event in &self.event_table {
            if let Some(prev) = last_id {
                if event.id < prev {
                    return Err(ValidationError::Unsorted);
                }
            }
            last_id = Some(event.id);

            if let Some(&index) = event.pc_id.iter().find(|&&i| i >= npc) {
                return Err(ValidationError::FrameIndex { event: event.id, index, len: npc });
            }
            if let Some(info) = &event.object_info {
                check_str("event.object_info.type", &info.type_name)?;
                if let Some(&index) = info.type_data.iter().find(|&&i| i >= ntype) {
                    return Err(ValidationError::TypeIndex { event: event.id, index, len: ntype });
                }
            }
        }

        Ok(())
    }
}

fn validate_offsets(
    context: &'static str,
    offsets: &[usize],
    groups: usize,
    entries: usize,
) -> Result<(), ValidationError> {
    // An entirely empty table may omit the leading sentinel.
    if offsets.is_empty() && groups == 0 && entries == 0 {
        return Ok(());
    }
    let well_formed = offsets.len() == groups + 1
        && offsets.first() == Some(&0)
        && offsets.last() == Some(&entries)
        && offsets.windows(2).all(|w| w[0] <= w[1]);
    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::Offsets { context, expected: entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> OutputRecord {
        OutputRecord {
            strtab: vec![String::new(), "main".into(), "/bin/app".into()],
            frame_table: FrameTable {
                pc: vec![0x1000],
                object_path: vec![2],
                object_address: vec![0x1000],
                object_symbol: vec![1],
                offsets: vec![0, 1],
                file: vec![0],
                func: vec![1],
                line: vec![42],
                column: vec![0],
                is_inline: vec![0],
            },
            type_data_table: TypeDataTable {
                field_off: vec![0],
                base_off: vec![0],
                ..TypeDataTable::default()
            },
            event_table: vec![OutputEvent {
                id: 0,
                kind: EventKind::Alloc,
                alloc_size: 64,
                alloc_addr: 0xdead_0000,
                alloc_hint: 0,
                pc_id: vec![0],
                object_info: None,
            }],
        }
    }

    #[test]
    fn test_valid_record_passes() {
        sample_record().validate().expect("record should validate");
    }

    #[test]
    fn test_out_of_bounds_frame_index_rejected() {
        let mut record = sample_record();
        record.event_table[0].pc_id.push(7);
        assert!(matches!(
            record.validate(),
            Err(ValidationError::FrameIndex { index: 7, .. })
        ));
    }

    #[test]
    fn test_out_of_bounds_string_index_rejected() {
        let mut record = sample_record();
        record.frame_table.func[0] = 99;
        assert!(matches!(record.validate(), Err(ValidationError::StrIndex { .. })));
    }

    #[test]
    fn test_unsorted_events_rejected() {
        let mut record = sample_record();
        let mut second = record.event_table[0].clone();
        second.id = 5;
        record.event_table.insert(0, second);
        assert!(matches!(record.validate(), Err(ValidationError::Unsorted)));
    }

    #[test]
    fn test_event_kind_serializes_uppercase() {
        let json = serde_json::to_string(&EventKind::Realloc).unwrap();
        assert_eq!(json, "\"REALLOC\"");
        let back: EventKind = serde_json::from_str("\"FREE\"").unwrap();
        assert_eq!(back, EventKind::Free);
    }

    #[test]
    fn test_absent_object_info_serializes_as_null() {
        let record = sample_record();
        let json = serde_json::to_value(&record).unwrap();
        assert!(json["event_table"][0]["object_info"].is_null());
    }
}
