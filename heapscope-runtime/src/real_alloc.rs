//! Resolution of the real allocator behind the interposed symbols.
//!
//! The preload shims shadow `malloc` and friends, so they cannot call them
//! by name; they delegate here instead. On glibc the `__libc_*` aliases are
//! linked directly, which works before relocation is complete and involves
//! no `dlsym` (itself a `calloc` caller, which would re-enter the shims
//! during bootstrap). On other libcs the symbols are resolved lazily through
//! `dlsym(RTLD_NEXT)` and cached in atomics.
//!
//! A failed resolution is unrecoverable: the process has no working
//! allocator, so the only safe move is a raw stderr diagnostic and an
//! immediate `_exit`. No allocation happens on that path.

use libc::{c_void, size_t};

/// # Safety
///
/// Same contract as C `malloc`.
#[inline]
pub unsafe fn malloc(size: usize) -> *mut c_void {
    imp::malloc(size)
}

/// # Safety
///
/// Same contract as C `calloc`.
#[inline]
pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    imp::calloc(nmemb, size)
}

/// # Safety
///
/// Same contract as C `realloc`: `ptr` must be null or a live allocation
/// from this allocator.
#[inline]
pub unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    imp::realloc(ptr, size)
}

/// # Safety
///
/// `align` must be a power of two. Same contract as C `memalign`.
#[inline]
pub unsafe fn memalign(align: usize, size: usize) -> *mut c_void {
    imp::memalign(align, size)
}

/// # Safety
///
/// Same contract as C `free`: `ptr` must be null or a live allocation from
/// this allocator.
#[inline]
pub unsafe fn free(ptr: *mut c_void) {
    imp::free(ptr);
}

#[cfg(target_env = "gnu")]
mod imp {
    use super::{c_void, size_t};

    extern "C" {
        fn __libc_malloc(size: size_t) -> *mut c_void;
        fn __libc_calloc(nmemb: size_t, size: size_t) -> *mut c_void;
        fn __libc_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void;
        fn __libc_memalign(align: size_t, size: size_t) -> *mut c_void;
        fn __libc_free(ptr: *mut c_void);
    }

    pub unsafe fn malloc(size: usize) -> *mut c_void {
        __libc_malloc(size)
    }

    pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut c_void {
        __libc_calloc(nmemb, size)
    }

    pub unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        __libc_realloc(ptr, size)
    }

    pub unsafe fn memalign(align: usize, size: usize) -> *mut c_void {
        __libc_memalign(align, size)
    }

    pub unsafe fn free(ptr: *mut c_void) {
        __libc_free(ptr);
    }
}

#[cfg(not(target_env = "gnu"))]
mod imp {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{c_void, size_t};

    static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
    static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
    static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
    static REAL_MEMALIGN: AtomicUsize = AtomicUsize::new(0);
    static REAL_FREE: AtomicUsize = AtomicUsize::new(0);

    /// Look a symbol up past our own shims, caching the address. Racing
    /// threads resolve to the same address, so the store needs no CAS.
    unsafe fn resolve(cache: &AtomicUsize, name: &'static str) -> usize {
        let cached = cache.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }
        let addr = libc::dlsym(libc::RTLD_NEXT, name.as_ptr().cast());
        if addr.is_null() {
            die(name);
        }
        cache.store(addr as usize, Ordering::Relaxed);
        addr as usize
    }

    /// Allocation-free last words. Without a real allocator the process
    /// cannot limp on.
    unsafe fn die(name: &str) -> ! {
        let msg = b"heapscope: failed to resolve real allocator symbol: ";
        libc::write(2, msg.as_ptr().cast(), msg.len());
        // name is a NUL-terminated literal; print without the terminator.
        libc::write(2, name.as_ptr().cast(), name.len() - 1);
        libc::write(2, b"\n".as_ptr().cast(), 1);
        libc::_exit(1);
    }

    pub unsafe fn malloc(size: usize) -> *mut c_void {
        let f: unsafe extern "C" fn(size_t) -> *mut c_void =
            std::mem::transmute(resolve(&REAL_MALLOC, "malloc\0"));
        f(size)
    }

    pub unsafe fn calloc(nmemb: usize, size: usize) -> *mut c_void {
        let f: unsafe extern "C" fn(size_t, size_t) -> *mut c_void =
            std::mem::transmute(resolve(&REAL_CALLOC, "calloc\0"));
        f(nmemb, size)
    }

    pub unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        let f: unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void =
            std::mem::transmute(resolve(&REAL_REALLOC, "realloc\0"));
        f(ptr, size)
    }

    pub unsafe fn memalign(align: usize, size: usize) -> *mut c_void {
        let f: unsafe extern "C" fn(size_t, size_t) -> *mut c_void =
            std::mem::transmute(resolve(&REAL_MEMALIGN, "memalign\0"));
        f(align, size)
    }

    pub unsafe fn free(ptr: *mut c_void) {
        let f: unsafe extern "C" fn(*mut c_void) =
            std::mem::transmute(resolve(&REAL_FREE, "free\0"));
        f(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_free_round_trip() {
        unsafe {
            let p = malloc(64);
            assert!(!p.is_null());
            std::ptr::write_bytes(p.cast::<u8>(), 0xab, 64);
            free(p);
        }
    }

    #[test]
    fn test_calloc_zeroes() {
        unsafe {
            let p = calloc(4, 16).cast::<u8>();
            assert!(!p.is_null());
            for i in 0..64 {
                assert_eq!(*p.add(i), 0);
            }
            free(p.cast());
        }
    }

    #[test]
    fn test_realloc_preserves_prefix() {
        unsafe {
            let p = malloc(16).cast::<u8>();
            assert!(!p.is_null());
            for i in 0..16 {
                *p.add(i) = i as u8;
            }
            let q = realloc(p.cast(), 256).cast::<u8>();
            assert!(!q.is_null());
            for i in 0..16 {
                assert_eq!(*q.add(i), i as u8);
            }
            free(q.cast());
        }
    }

    #[test]
    fn test_memalign_honors_alignment() {
        unsafe {
            let p = memalign(64, 100);
            assert!(!p.is_null());
            assert_eq!(p as usize % 64, 0);
            free(p);
        }
    }
}
