//! Stack unwinding for the current thread.
//!
//! Captures raw instruction-pointer sequences (and optionally the matching
//! stack pointers, which delimit per-frame stack windows for the frame-tag
//! scan). Built on `backtrace::trace_unsynchronized`: the recording path
//! already holds a per-thread nesting guard, so the unsynchronized variant is
//! safe and avoids taking a lock inside the allocator hook.
//!
//! Captured instruction pointers are decremented by one before being
//! returned: return addresses point *after* the call instruction, but symbol
//! lookup wants the address *of* the call.

use crate::domain::Addr;

/// Upper bound on captured stack depth. Deeper stacks are silently truncated;
/// truncation must never fail the allocation being recorded.
pub const MAX_FRAMES: usize = 512;

/// Capture the current thread's call stack into `ips`, innermost frame first.
/// Returns the number of frames captured.
///
/// # Safety
///
/// Caller must guarantee no concurrent unwinding of this thread's stack
/// (trivially true when called from the thread itself outside signal
/// handlers, which is the only way the runtime calls it).
#[inline(never)]
pub unsafe fn unwind(ips: &mut [Addr]) -> usize {
    let mut count = 0;
    backtrace::trace_unsynchronized(|frame| {
        let ip = frame.ip() as Addr;
        if ip == 0 {
            return true;
        }
        if count >= ips.len() {
            return false;
        }
        ips[count] = ip;
        count += 1;
        true
    });
    dec_ips(&mut ips[..count]);
    count
}

/// Like [`unwind`], but also records each frame's stack pointer into `sps`.
/// `ips` and `sps` must have equal length; `sps[i]` pairs with `ips[i]`.
///
/// # Safety
///
/// Same contract as [`unwind`].
#[inline(never)]
pub unsafe fn unwind_with_sp(ips: &mut [Addr], sps: &mut [Addr]) -> usize {
    debug_assert_eq!(ips.len(), sps.len());
    let cap = ips.len().min(sps.len());

    let mut count = 0;
    backtrace::trace_unsynchronized(|frame| {
        let ip = frame.ip() as Addr;
        if ip == 0 {
            return true;
        }
        if count >= cap {
            return false;
        }
        ips[count] = ip;
        sps[count] = frame.sp() as Addr;
        count += 1;
        true
    });
    dec_ips(&mut ips[..count]);
    count
}

fn dec_ips(ips: &mut [Addr]) {
    for ip in ips {
        *ip -= 1;
    }
}

/// Frame windows derived from consecutive stack-pointer samples.
///
/// `sps[i]..sps[i + 1]` is the stack region owned by the i-th frame's caller
/// chain on a downward-growing stack. Windows with a missing sample or an
/// inverted range are skipped (some unwinders report 0 for frames they cannot
/// locate precisely).
pub fn frame_windows(sps: &[Addr]) -> impl Iterator<Item = (usize, Addr, Addr)> + '_ {
    sps.windows(2).enumerate().filter_map(|(i, pair)| {
        let (start, end) = (pair[0], pair[1]);
        if start != 0 && end != 0 && start < end {
            Some((i, start, end))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwind_captures_frames() {
        let mut ips = [0usize; MAX_FRAMES];
        let count = unsafe { unwind(&mut ips) };
        assert!(count > 0, "expected at least one frame");
        assert!(ips[..count].iter().all(|&ip| ip != 0));
    }

    #[test]
    fn test_unwind_truncates_silently() {
        let mut ips = [0usize; 2];
        let count = unsafe { unwind(&mut ips) };
        assert_eq!(count, 2);
    }

    #[test]
    fn test_unwind_with_sp_pairs_up() {
        let mut ips = [0usize; MAX_FRAMES];
        let mut sps = [0usize; MAX_FRAMES];
        let count = unsafe { unwind_with_sp(&mut ips, &mut sps) };
        assert!(count > 0);
        // At least some frames must carry a usable stack pointer.
        assert!(sps[..count].iter().any(|&sp| sp != 0));
    }

    #[test]
    fn test_frame_windows_skip_invalid_ranges() {
        let sps = [100usize, 200, 0, 300, 250, 400];
        let windows: Vec<_> = frame_windows(&sps).collect();
        // (100,200) valid; (200,0) and (0,300) invalid; (300,250) inverted;
        // (250,400) valid.
        assert_eq!(windows, vec![(0, 100, 200), (4, 250, 400)]);
    }
}
