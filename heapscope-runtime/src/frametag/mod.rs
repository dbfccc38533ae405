//! The stack-embedded frame-tag protocol.
//!
//! An instrumented destructor deposits a small, checksummed record in a
//! caller-reserved block of its own stack frame the moment it is entered
//! (before any field destruction runs). A `free` call executing deeper on the
//! same stack can then recover the identity and layout of the object under
//! destruction by scanning the raw stack memory between the frames it
//! unwound - an out-of-band side channel keyed by stack address range, with
//! no formal parameter-passing involved.
//!
//! Nothing about this is expressible safely: the scan reads stack bytes that
//! are, from the language's point of view, dead or uninitialized. The entire
//! unsafe surface is confined to [`scan_window`]; everything above it deals
//! in validated [`ObjectEvent`] values.
//!
//! A word matching the magic tag is never trusted on its own - arbitrary
//! stack garbage can collide with any fixed constant. A candidate record is
//! accepted only if its checksum (a multiplicative mix over every other
//! field) validates.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{compiler_fence, AtomicU64, Ordering};

use crate::domain::Addr;

/// Magic word marking a candidate frame-tag record on the stack.
pub const FRAME_TAG: u64 = 0xeeb3_6e72_6e3f_fec1;

/// How many 8-byte words of each frame window are searched for the tag.
/// Bounds worst-case scan cost per frame; records are written at the very
/// top of the instrumented frame, so a small depth suffices.
const SCAN_DEPTH_WORDS: usize = 16;

/// Monotonic counter of destructor entries; gives each deposited record a
/// process-unique object id.
static TAG_CALL_COUNT: AtomicU64 = AtomicU64::new(0);

/// Static layout metadata for one concrete type. One instance exists per
/// type, so descriptors are deduplicated by address.
#[derive(Debug)]
pub struct TypeDescriptor {
    /// Total size of the type in bytes.
    pub size: usize,
    /// Demangled type name.
    pub type_name: &'static str,
    pub fields: &'static [FieldDescriptor],
    pub bases: &'static [BaseDescriptor],
}

#[derive(Debug)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub type_name: &'static str,
    pub size: usize,
    pub offset: usize,
}

#[derive(Debug)]
pub struct BaseDescriptor {
    pub type_name: &'static str,
    pub size: usize,
    pub offset: usize,
}

/// The fixed-layout record deposited on the stack. 40 bytes on 64-bit
/// targets; the hook contract reserves at least this much stack space.
#[repr(C)]
#[derive(Clone, Copy)]
struct FrameTagRecord {
    tag: u64,
    call_count: u64,
    this_ptr: usize,
    type_data: usize,
    checksum: u64,
}

/// Size of one serialized frame-tag record.
pub const FRAME_TAG_RECORD_SIZE: usize = std::mem::size_of::<FrameTagRecord>();

const RECORD_WORDS: usize = FRAME_TAG_RECORD_SIZE / 8;

/// Caller-reserved stack space for one frame-tag record.
///
/// An instrumented destructor declares one of these as its first local and
/// passes it to [`save_state`]; the slot must live for the whole destructor
/// body so the record stays recoverable until the function returns.
#[repr(C, align(8))]
pub struct FrameTagSlot {
    bytes: [MaybeUninit<u8>; FRAME_TAG_RECORD_SIZE],
}

impl FrameTagSlot {
    #[must_use]
    pub const fn uninit() -> Self {
        Self { bytes: [MaybeUninit::uninit(); FRAME_TAG_RECORD_SIZE] }
    }
}

impl Default for FrameTagSlot {
    fn default() -> Self {
        Self::uninit()
    }
}

/// One validated frame-tag discovery, tied back to the stack trace that was
/// being captured when the scan ran.
#[derive(Debug, Clone, Copy)]
pub struct ObjectEvent {
    /// Index into the captured trace of the frame whose window held the tag.
    pub trace_index: usize,
    /// Destructor invocation id (from the global tag call counter).
    pub object_id: u64,
    /// Address of the object under destruction.
    pub addr: Addr,
    pub type_data: &'static TypeDescriptor,
}

/// Multiplicative mixing step. The xor constant breaks the fixed tag's bit
/// pattern; `| 1` keeps the multiplier odd so no input maps everything to 0.
fn mix(a: u64, b: u64) -> u64 {
    let product = u128::from(a ^ 0x9e37_79b9_7f4a_7c15) * u128::from(b | 1);
    ((product >> 64) as u64) ^ (product as u64)
}

fn record_checksum(call_count: u64, this_ptr: usize, type_data: usize) -> u64 {
    mix(mix(FRAME_TAG, call_count), mix(this_ptr as u64, type_data as u64))
}

/// Deposit a frame-tag record into `slot`.
///
/// Must be the first statement of an instrumented destructor. Inlined so no
/// extra call frame separates the write from the destructor's own frame (the
/// scan attributes a record to the frame window it physically sits in). The
/// volatile write plus compiler fence keeps the optimizer from discarding
/// what is otherwise a dead store.
#[inline(always)]
pub fn save_state(this_ptr: *const (), slot: &mut FrameTagSlot, type_data: &'static TypeDescriptor) {
    let call_count = TAG_CALL_COUNT.fetch_add(1, Ordering::Relaxed);
    let type_data_addr = std::ptr::from_ref(type_data) as usize;
    let record = FrameTagRecord {
        tag: FRAME_TAG,
        call_count,
        this_ptr: this_ptr as usize,
        type_data: type_data_addr,
        checksum: record_checksum(call_count, this_ptr as usize, type_data_addr),
    };
    // SAFETY: the slot is 8-aligned and exactly one record wide.
    unsafe {
        ptr::write_volatile(slot.bytes.as_mut_ptr().cast::<FrameTagRecord>(), record);
    }
    compiler_fence(Ordering::SeqCst);
}

/// Scan one frame window `[start, end)` of raw stack memory for a validated
/// frame-tag record.
///
/// At most one live record is assumed per window: scanning stops at the
/// first word matching the magic tag, whether or not its checksum validates
/// (a tag word followed by a bad checksum is stack garbage, not a reason to
/// keep searching).
///
/// # Safety
///
/// `[start, end)` must be readable memory of the current thread's stack.
/// The bytes read may be uninitialized from the language's perspective; they
/// are only ever compared and copied, never interpreted as references -
/// except for the descriptor pointer of a record whose checksum validated,
/// which by the protocol's invariant was written by [`save_state`] and
/// therefore addresses a `'static` descriptor.
pub unsafe fn scan_window(start: Addr, end: Addr) -> Option<ObjectEvent> {
    let start = (start + 7) & !7;
    if end <= start {
        return None;
    }

    let words = (end - start) / 8;
    if words < RECORD_WORDS {
        return None;
    }

    let base = start as *const u64;
    let search = (words - RECORD_WORDS + 1).min(SCAN_DEPTH_WORDS);

    for i in 0..search {
        if ptr::read_volatile(base.add(i)) != FRAME_TAG {
            continue;
        }
        let candidate = ptr::read_volatile(base.add(i).cast::<FrameTagRecord>());
        let expected = record_checksum(candidate.call_count, candidate.this_ptr, candidate.type_data);
        if candidate.checksum != expected {
            return None;
        }
        return Some(ObjectEvent {
            trace_index: 0,
            object_id: candidate.call_count,
            addr: candidate.this_ptr,
            type_data: &*(candidate.type_data as *const TypeDescriptor),
        });
    }

    None
}

/// Scan every frame window of a captured stack-pointer sequence, collecting
/// up to `max_events` validated records. `sps[i]` must pair with the i-th
/// frame of the trace the caller captured alongside it.
#[must_use]
pub fn extract_events(sps: &[Addr], max_events: usize) -> Vec<ObjectEvent> {
    let mut events = Vec::new();
    for (i, start, end) in crate::unwind::frame_windows(sps) {
        if events.len() == max_events {
            break;
        }
        // SAFETY: consecutive stack pointers of the current thread's own
        // unwound stack delimit readable stack memory.
        if let Some(mut event) = unsafe { scan_window(start, end) } {
            event.trace_index = i;
            events.push(event);
        }
    }
    events
}
