//! Snapshot scanning, run inside the forked child.
//!
//! The child inherits a frozen copy of every stack and heap block. It
//! walks each registered thread's live stack range and then every
//! candidate block's contents, counting, for every word that names a
//! candidate, one reference into the shared `refs` array. The parent reads
//! those counters after the child reports how many bytes it covered.

use std::sync::atomic::Ordering;

use crate::collector::gc_data::{AggregateData, PTR_MASK};
use crate::thread;

const WORD: usize = core::mem::size_of::<usize>();

/// Word-scans `[lo, hi)` and bumps the reference count of every candidate
/// named by a word in the range. Returns the number of bytes covered.
pub(crate) unsafe fn scan_range(data: &AggregateData, lo: usize, hi: usize) -> usize {
    debug_assert!(lo % WORD == 0);
    let mut p = lo as *const usize;
    while (p as usize) + WORD <= hi {
        let w = p.read() & PTR_MASK;
        if w >= data.min_val() && w <= data.max_val() {
            if let Some(i) = data.lookup(w) {
                data.refs(i).fetch_add(1, Ordering::Relaxed);
            }
        }
        p = p.add(1);
    }
    hi - lo
}

/// Treats every candidate block as a potential root and scans its
/// contents. References between candidates end up counted, which is what
/// lets the sweep cascade when a referencing block turns out to be dead.
pub(crate) unsafe fn scan_candidate_blocks(data: &AggregateData) -> usize {
    let mut bytes = 0;
    for i in 0..data.len() {
        let base = data.addr(i) & PTR_MASK;
        bytes += scan_range(data, base, base + data.alloc_sz(i) as usize);
    }
    bytes
}

/// Child entry point: scan every registered stack and every candidate
/// block, report the byte total through the packet pipe, and exit. Never
/// returns. The registry is read without locking; the child is single
/// threaded and the snapshot is frozen.
pub(crate) unsafe fn child_scan(data: &AggregateData, write_fd: libc::c_int) -> ! {
    let mut bytes = 0usize;

    thread::each_registered_unlocked(|td| {
        bytes += scan_range(data, td.saved_sp(), td.stack_high());
    });
    bytes += scan_candidate_blocks(data);

    let written = libc::write(
        write_fd,
        &bytes as *const usize as *const libc::c_void,
        WORD,
    );
    libc::_exit(if written == WORD as isize { 0 } else { 1 });
}
