//! LD_PRELOAD entry point: the interposed allocator symbols.
//!
//! This cdylib exports `malloc`, `free`, and their relatives under their C
//! names, so loading it ahead of libc routes every allocation in the host
//! process through here. Each shim forwards to the real allocator first and
//! records the event second; recording is strictly best-effort and never
//! changes what the caller observes. The C++ `operator new`/`delete` family
//! is exported under its Itanium-mangled names so C++ hosts are covered
//! without a C++ toolchain anywhere in the build.
//!
//! All recording logic lives in `heapscope-runtime`; this crate contains
//! only the symbol surface and process lifecycle glue. Keeping the
//! `#[no_mangle]` exports out of the runtime rlib matters: linked into a
//! test binary they would interpose the test harness's own allocator.
//!
//! Event ordering at the boundary: allocations call the real allocator
//! before recording (the address is unknown until then); frees record
//! before releasing, so a freed address cannot be handed to another thread
//! and re-recorded ahead of its free event. Frame-tag scanning also needs
//! the free recorded while the destructor frames above it are still live.

#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]

use libc::{c_void, size_t};

use heapscope_runtime::record::{self, EventKind};
use heapscope_runtime::{config, real_alloc, report};

// -------------------------------------------------------------------------
// Process lifecycle
// -------------------------------------------------------------------------

#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = init;

/// Runs before `main` via `.init_array`. Enables tracing and registers the
/// exit hook. glibc runs TLS destructors before `atexit` handlers, so by
/// the time the hook fires every thread's events have drained into the
/// global log and tracing is already off.
extern "C" fn init() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::new().filter(config::ENV_LOG),
    )
    .try_init();

    let pid = std::process::id();
    match std::env::var(config::ENV_STARTED) {
        // First profiled process: mark the tree so descendants know they
        // are secondary.
        Err(_) => std::env::set_var(config::ENV_STARTED, pid.to_string()),
        // Inherited via LD_PRELOAD from a profiled ancestor: stay dormant
        // unless child profiling was requested.
        Ok(_) => {
            if !config::global().profile_children {
                log::debug!("heapscope dormant in child pid {pid}");
                return;
            }
        }
    }

    record::init();
    // SAFETY: registering a no-argument exit handler.
    unsafe {
        libc::atexit(write_report_at_exit);
    }
    log::debug!("heapscope tracing enabled in pid {pid}");
}

extern "C" fn write_report_at_exit() {
    match report::write_process_report() {
        Ok(path) => log::debug!("heapscope report written to {}", path.display()),
        Err(err) => log::error!("heapscope failed to write report: {err}"),
    }
}

// -------------------------------------------------------------------------
// C allocator surface
// -------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let ptr = real_alloc::malloc(size);
    if !ptr.is_null() {
        record::record_alloc(EventKind::Alloc, size, ptr as usize, 0);
    }
    ptr
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    let ptr = real_alloc::calloc(nmemb, size);
    if !ptr.is_null() {
        record::record_alloc(EventKind::Alloc, nmemb.saturating_mul(size), ptr as usize, 0);
    }
    ptr
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let new_ptr = real_alloc::realloc(ptr, size);
    if !new_ptr.is_null() {
        if ptr.is_null() {
            record::record_alloc(EventKind::Alloc, size, new_ptr as usize, 0);
        } else {
            record::record_alloc(EventKind::Realloc, size, new_ptr as usize, ptr as usize);
        }
    }
    new_ptr
}

#[no_mangle]
pub unsafe extern "C" fn memalign(align: size_t, size: size_t) -> *mut c_void {
    let ptr = real_alloc::memalign(align, size);
    if !ptr.is_null() {
        record::record_alloc(EventKind::Alloc, size, ptr as usize, 0);
    }
    ptr
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(align: size_t, size: size_t) -> *mut c_void {
    memalign(align, size)
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    record::record_free(ptr as usize);
    real_alloc::free(ptr);
}

// -------------------------------------------------------------------------
// C++ operator new / operator delete (Itanium-mangled)
// -------------------------------------------------------------------------
//
// The throwing operators cannot raise std::bad_alloc from here; on
// exhaustion they return null, which well-formed C++ treats as a crash
// either way. The nothrow and array variants share the plain code paths:
// the distinction only matters to the C++ front end.

unsafe fn op_new(size: size_t) -> *mut c_void {
    let ptr = real_alloc::malloc(size);
    if !ptr.is_null() {
        record::record_alloc(EventKind::Alloc, size, ptr as usize, 0);
    }
    ptr
}

unsafe fn op_new_aligned(size: size_t, align: size_t) -> *mut c_void {
    let ptr = real_alloc::memalign(align, size);
    if !ptr.is_null() {
        record::record_alloc(EventKind::Alloc, size, ptr as usize, 0);
    }
    ptr
}

unsafe fn op_delete(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    record::record_free(ptr as usize);
    real_alloc::free(ptr);
}

/// `operator new(size_t)`
#[no_mangle]
pub unsafe extern "C" fn _Znwm(size: size_t) -> *mut c_void {
    op_new(size)
}

/// `operator new[](size_t)`
#[no_mangle]
pub unsafe extern "C" fn _Znam(size: size_t) -> *mut c_void {
    op_new(size)
}

/// `operator new(size_t, nothrow_t const&)`
#[no_mangle]
pub unsafe extern "C" fn _ZnwmRKSt9nothrow_t(size: size_t, _tag: *const c_void) -> *mut c_void {
    op_new(size)
}

/// `operator new[](size_t, nothrow_t const&)`
#[no_mangle]
pub unsafe extern "C" fn _ZnamRKSt9nothrow_t(size: size_t, _tag: *const c_void) -> *mut c_void {
    op_new(size)
}

/// `operator new(size_t, align_val_t)`
#[no_mangle]
pub unsafe extern "C" fn _ZnwmSt11align_val_t(size: size_t, align: size_t) -> *mut c_void {
    op_new_aligned(size, align)
}

/// `operator new[](size_t, align_val_t)`
#[no_mangle]
pub unsafe extern "C" fn _ZnamSt11align_val_t(size: size_t, align: size_t) -> *mut c_void {
    op_new_aligned(size, align)
}

/// `operator delete(void*)`
#[no_mangle]
pub unsafe extern "C" fn _ZdlPv(ptr: *mut c_void) {
    op_delete(ptr);
}

/// `operator delete[](void*)`
#[no_mangle]
pub unsafe extern "C" fn _ZdaPv(ptr: *mut c_void) {
    op_delete(ptr);
}

/// `operator delete(void*, size_t)`
#[no_mangle]
pub unsafe extern "C" fn _ZdlPvm(ptr: *mut c_void, _size: size_t) {
    op_delete(ptr);
}

/// `operator delete[](void*, size_t)`
#[no_mangle]
pub unsafe extern "C" fn _ZdaPvm(ptr: *mut c_void, _size: size_t) {
    op_delete(ptr);
}

/// `operator delete(void*, nothrow_t const&)`
#[no_mangle]
pub unsafe extern "C" fn _ZdlPvRKSt9nothrow_t(ptr: *mut c_void, _tag: *const c_void) {
    op_delete(ptr);
}

/// `operator delete[](void*, nothrow_t const&)`
#[no_mangle]
pub unsafe extern "C" fn _ZdaPvRKSt9nothrow_t(ptr: *mut c_void, _tag: *const c_void) {
    op_delete(ptr);
}

/// `operator delete(void*, align_val_t)`
#[no_mangle]
pub unsafe extern "C" fn _ZdlPvSt11align_val_t(ptr: *mut c_void, _align: size_t) {
    op_delete(ptr);
}

/// `operator delete[](void*, align_val_t)`
#[no_mangle]
pub unsafe extern "C" fn _ZdaPvSt11align_val_t(ptr: *mut c_void, _align: size_t) {
    op_delete(ptr);
}

/// `operator delete(void*, size_t, align_val_t)`
#[no_mangle]
pub unsafe extern "C" fn _ZdlPvmSt11align_val_t(ptr: *mut c_void, _size: size_t, _align: size_t) {
    op_delete(ptr);
}

/// `operator delete[](void*, size_t, align_val_t)`
#[no_mangle]
pub unsafe extern "C" fn _ZdaPvmSt11align_val_t(ptr: *mut c_void, _size: size_t, _align: size_t) {
    op_delete(ptr);
}
