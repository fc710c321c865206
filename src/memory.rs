//! Page-granular mappings and allocator queries.
//!
//! The collector keeps its metadata out of the program heap: batches live in
//! private anonymous mappings and the aggregated dataset lives in a shared
//! one so the forked child can publish reference marks to the parent.

use once_cell::sync::Lazy;

use crate::gc_fatal;

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds `bytes` up to a whole number of pages.
pub fn page_align(bytes: usize) -> usize {
    let page = page_size();
    (bytes + page - 1) & !(page - 1)
}

unsafe fn map(bytes: usize, flags: libc::c_int) -> *mut u8 {
    let mem = libc::mmap(
        core::ptr::null_mut(),
        bytes,
        libc::PROT_READ | libc::PROT_WRITE,
        flags | libc::MAP_ANONYMOUS,
        -1,
        0,
    );

    if mem == libc::MAP_FAILED {
        gc_fatal!("out of memory (mmap of {} bytes)", bytes);
    }

    mem as _
}

/// Maps `bytes` of zeroed memory visible to this process only.
pub unsafe fn mmap_private(bytes: usize) -> *mut u8 {
    map(bytes, libc::MAP_PRIVATE)
}

/// Maps `bytes` of zeroed memory that stays shared with forked children.
pub unsafe fn mmap_shared(bytes: usize) -> *mut u8 {
    map(bytes, libc::MAP_SHARED)
}

pub unsafe fn unmap(ptr: *mut u8, bytes: usize) {
    libc::munmap(ptr as _, bytes);
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        /// Usable size of a block returned by the underlying allocator.
        pub fn usable_size(addr: usize) -> usize {
            unsafe { libc::malloc_size(addr as *const libc::c_void) }
        }
    } else {
        /// Usable size of a block returned by the underlying allocator.
        pub fn usable_size(addr: usize) -> usize {
            unsafe { libc::malloc_usable_size(addr as *mut libc::c_void) }
        }
    }
}
