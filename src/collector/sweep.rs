//! Parallel reference-count sweep, run in the parent after the child
//! exits.
//!
//! Workers claim candidates whose counters reached zero by setting the
//! collected bit with a CAS on the address slot itself; the CAS is the one
//! linearization point for "this block will be freed", so no block is ever
//! freed twice. A claimed block's contents are unreferenced, which can
//! drive further counters to zero and cascade, bounded by a recursion
//! depth cap; the outer loop re-runs passes until a pass frees nothing.
//! Cycles of retired blocks keep each other's counters above zero forever,
//! so once the passes go dry a cycle-reclaim step separates the survivors
//! that stacks can actually reach from closed loops of garbage.

use std::sync::atomic::Ordering;

use scoped_thread_pool::Pool;

use crate::collector::gc_data::{AggregateData, PTR_MASK};

pub(crate) const MAX_SWEEP_RANGES: usize = 80;
pub(crate) const ADDRS_PER_RANGE: usize = 128 * 1024;
const MAX_UNREF_DEPTH: i32 = 30;

const WORD: usize = core::mem::size_of::<usize>();

/// Unreferences everything a claimed block points at, then frees the
/// block. Words naming a candidate are zeroed as they are deducted. A
/// deduction that zeroes a counter claims the target and recurses while
/// `max_depth` allows; chains longer than the cap are finished by later
/// passes.
unsafe fn unref_block(data: &AggregateData, n: usize, max_depth: i32) {
    let addr = data.addr(n);
    debug_assert!(addr & 1 == 1);
    let base = addr & PTR_MASK;
    let p = base as *mut usize;
    let elements = data.alloc_sz(n) as usize / WORD;

    for i in 0..elements {
        let deep_addr = p.add(i).read() & PTR_MASK;
        if deep_addr >= data.min_val() && deep_addr <= data.max_val() {
            // A value within the candidate range. See if it is in the
            // set. Also, null it.
            p.add(i).write(0);
            let loc = if deep_addr < base {
                data.search(deep_addr, 0, n)
            } else {
                data.search(deep_addr, n, data.len())
            };

            if data.is_ref(loc, deep_addr) {
                let remaining = data.refs(loc).fetch_sub(1, Ordering::AcqRel) - 1;
                debug_assert!(remaining >= 0);
                if max_depth > 0 && remaining == 0 && data.claim(loc, deep_addr) {
                    unref_block(data, loc, max_depth - 1);
                }
            }
        }
    }

    libc::free(p as *mut libc::c_void);
}

fn sweep_range(data: &AggregateData, range_begin: usize, range_end: usize) {
    for i in range_begin..range_end {
        let addr = data.addr(i);
        debug_assert!(addr != 0);
        debug_assert!(data.refs(i).load(Ordering::Relaxed) >= 0);
        if addr & 1 == 0 && data.refs(i).load(Ordering::Acquire) == 0 {
            if data.claim(i, addr) {
                unsafe {
                    unref_block(data, i, MAX_UNREF_DEPTH);
                }
            }
        }
    }
}

/// Drops every claimed entry, left-packing the survivors and keeping the
/// three arrays parallel. Returns the number of entries removed.
unsafe fn compact(data: &mut AggregateData) -> usize {
    let n = data.len();
    let mut write_position = 0;
    let mut savings = 0;

    for i in 0..n {
        if data.addr(i) & 1 == 1 {
            savings += 1;
            continue;
        }
        if write_position != i {
            data.set_addr(write_position, data.addr(i));
            let refs = data.refs(i).load(Ordering::Relaxed);
            data.refs(write_position).store(refs, Ordering::Relaxed);
            data.set_alloc_sz(write_position, data.alloc_sz(i));
        }
        write_position += 1;
    }

    data.set_len(write_position);
    savings
}

/// One parallel pass: partition the index space, let the workers claim and
/// cascade, then compact. Returns how many blocks the pass freed.
pub(crate) unsafe fn find_unreferenced(data: &mut AggregateData, pool: &Pool) -> usize {
    if data.is_empty() {
        return 0;
    }

    let mut range_count = data.len() / ADDRS_PER_RANGE + 1;
    if range_count > MAX_SWEEP_RANGES {
        range_count = MAX_SWEEP_RANGES;
    }
    let per_range = data.len() / range_count;

    {
        let data = &*data;
        pool.scoped(|scope| {
            for r in 0..range_count {
                let begin = r * per_range;
                let end = if r == range_count - 1 {
                    data.len()
                } else {
                    (r + 1) * per_range
                };
                scope.execute(move || sweep_range(data, begin, end));
            }
        });
    }

    compact(data)
}

/// Walks the in-set references of survivor `i` without modifying the
/// block, feeding each referenced index to `f`.
unsafe fn for_each_inset_ref(data: &AggregateData, i: usize, mut f: impl FnMut(usize)) {
    let base = data.addr(i) & PTR_MASK;
    let p = base as *const usize;
    let elements = data.alloc_sz(i) as usize / WORD;
    for k in 0..elements {
        let deep_addr = p.add(k).read() & PTR_MASK;
        if deep_addr >= data.min_val() && deep_addr <= data.max_val() {
            let loc = data.search(deep_addr, 0, data.len());
            if data.is_ref(loc, deep_addr) {
                f(loc);
            }
        }
    }
}

/// Frees closed loops of retired blocks that the claim-at-zero passes can
/// never reach. A survivor's counter is the sum of stack references and
/// references from other surviving candidates; survivors whose counters
/// are fully explained by in-set references, and that no externally
/// referenced survivor can reach, are garbage cycles. They are claimed
/// with the ordinary CAS and cascaded, so the deduction bookkeeping stays
/// exact. Returns the number of blocks freed.
pub(crate) unsafe fn reclaim_cycles(data: &mut AggregateData) -> usize {
    let n = data.len();
    if n == 0 {
        return 0;
    }

    let mut inset = vec![0i32; n];
    for i in 0..n {
        for_each_inset_ref(data, i, |loc| inset[loc] += 1);
    }

    // Everything a stack can reach, directly or through survivors.
    let mut live = vec![false; n];
    let mut work = Vec::new();
    for i in 0..n {
        debug_assert!(data.refs(i).load(Ordering::Relaxed) >= inset[i]);
        if data.refs(i).load(Ordering::Relaxed) > inset[i] {
            live[i] = true;
            work.push(i);
        }
    }
    while let Some(i) = work.pop() {
        for_each_inset_ref(data, i, |loc| {
            if !live[loc] {
                live[loc] = true;
                work.push(loc);
            }
        });
    }

    for i in 0..n {
        if !live[i] {
            let addr = data.addr(i);
            if addr & 1 == 0 && data.claim(i, addr) {
                unref_block(data, i, MAX_UNREF_DEPTH);
            }
        }
    }

    compact(data)
}

/// Runs passes until nothing moves: claim-at-zero passes to a fixpoint,
/// then cycle reclaim, then back if the reclaim unblocked anything.
/// Returns the total number of blocks freed.
pub(crate) unsafe fn sweep_to_fixpoint(data: &mut AggregateData, pool: &Pool) -> usize {
    let mut freed = 0;
    let mut iters = 0;
    loop {
        loop {
            iters += 1;
            let savings = find_unreferenced(data, pool);
            freed += savings;
            if savings == 0 || data.is_empty() {
                break;
            }
        }
        if data.is_empty() {
            break;
        }
        let reclaimed = reclaim_cycles(data);
        freed += reclaimed;
        if reclaimed == 0 {
            break;
        }
    }

    log::debug!(
        target: "gc-sweeper",
        "swept in {} pass(es): {} freed, {} retained",
        iters,
        freed,
        data.len()
    );

    freed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::aggregate::aggregate;
    use crate::collector::gc_data::GcData;
    use crate::collector::scan;
    use crate::env;

    fn pool() -> Pool {
        Pool::new(env::sweep_threads())
    }

    unsafe fn dataset_of(blocks: &[usize]) -> *mut AggregateData {
        let batch = GcData::create(blocks.len());
        for &b in blocks {
            (*batch).push(b);
        }
        let data = aggregate(batch);
        GcData::destroy(batch);
        data
    }

    fn alloc_blocks(count: usize, size: usize) -> Vec<usize> {
        (0..count)
            .map(|_| unsafe { libc::calloc(1, size) as usize })
            .collect()
    }

    #[test]
    fn unreferenced_leaf_is_freed() {
        unsafe {
            let blocks = alloc_blocks(1, 16);
            let data = dataset_of(&blocks);
            let freed = sweep_to_fixpoint(&mut *data, &pool());
            assert_eq!(freed, 1);
            assert!((*data).is_empty());
            AggregateData::destroy(data);
        }
    }

    #[test]
    fn stack_rooted_block_survives_untouched() {
        unsafe {
            let blocks = alloc_blocks(1, 16);
            let data = dataset_of(&blocks);
            (*data).refs(0).store(1, Ordering::Relaxed);

            let freed = sweep_to_fixpoint(&mut *data, &pool());
            assert_eq!(freed, 0);
            assert_eq!((*data).len(), 1);
            assert_eq!((*data).addr(0), blocks[0]);
            assert_eq!((*data).refs(0).load(Ordering::Relaxed), 1);

            libc::free(blocks[0] as *mut libc::c_void);
            AggregateData::destroy(data);
        }
    }

    #[test]
    fn fully_referenced_dataset_is_left_unchanged() {
        unsafe {
            let blocks = alloc_blocks(8, 16);
            let data = dataset_of(&blocks);
            for i in 0..8 {
                (*data).refs(i).store(1, Ordering::Relaxed);
            }
            let before: Vec<usize> = (*data).addrs_slice().to_vec();

            assert_eq!(find_unreferenced(&mut *data, &pool()), 0);
            assert_eq!((*data).addrs_slice(), &before[..]);

            for b in blocks {
                libc::free(b as *mut libc::c_void);
            }
            AggregateData::destroy(data);
        }
    }

    #[test]
    fn mutually_referencing_blocks_are_freed() {
        unsafe {
            let blocks = alloc_blocks(2, 32);
            (blocks[0] as *mut usize).write(blocks[1]);
            (blocks[1] as *mut usize).write(blocks[0]);

            let data = dataset_of(&blocks);
            scan::scan_candidate_blocks(&*data);
            assert_eq!((*data).refs(0).load(Ordering::Relaxed), 1);
            assert_eq!((*data).refs(1).load(Ordering::Relaxed), 1);

            let freed = sweep_to_fixpoint(&mut *data, &pool());
            assert_eq!(freed, 2);
            assert!((*data).is_empty());
            AggregateData::destroy(data);
        }
    }

    #[test]
    fn cycle_reachable_from_a_stack_survives() {
        unsafe {
            let blocks = alloc_blocks(2, 32);
            (blocks[0] as *mut usize).write(blocks[1]);
            (blocks[1] as *mut usize).write(blocks[0]);

            let data = dataset_of(&blocks);
            scan::scan_candidate_blocks(&*data);
            // One of the two additionally sits in somebody's stack frame.
            let rooted = (*data).lookup(blocks[0]).unwrap();
            (*data).refs(rooted).fetch_add(1, Ordering::Relaxed);

            let freed = sweep_to_fixpoint(&mut *data, &pool());
            assert_eq!(freed, 0);
            assert_eq!((*data).len(), 2);

            for b in blocks {
                libc::free(b as *mut libc::c_void);
            }
            AggregateData::destroy(data);
        }
    }

    #[test]
    fn deep_chain_converges_under_the_depth_cap() {
        unsafe {
            const CHAIN: usize = 35;
            let mut blocks = alloc_blocks(CHAIN, 32);
            blocks.sort_unstable();
            // Chain runs from the highest address down to the lowest, so a
            // single pass can only peel off what the recursion cap allows.
            for k in (1..CHAIN).rev() {
                (blocks[k] as *mut usize).write(blocks[k - 1]);
            }

            let data = dataset_of(&blocks);
            scan::scan_candidate_blocks(&*data);

            let pool = pool();
            let mut passes = 0;
            loop {
                let savings = find_unreferenced(&mut *data, &pool);
                if savings == 0 {
                    break;
                }
                passes += 1;
            }
            assert_eq!(passes, 2);
            assert!((*data).is_empty());
            AggregateData::destroy(data);
        }
    }

    #[test]
    fn mixed_dataset_frees_exactly_the_unreferenced() {
        unsafe {
            let blocks = alloc_blocks(1000, 16);
            let data = dataset_of(&blocks);

            // Every tenth candidate also lives in a stack frame somewhere.
            let mut rooted = Vec::new();
            for i in (0..1000).step_by(10) {
                (*data).refs(i).fetch_add(1, Ordering::Relaxed);
                rooted.push((*data).addr(i));
            }

            let freed = sweep_to_fixpoint(&mut *data, &pool());
            assert_eq!(freed, 900);
            assert_eq!((*data).len(), 100);
            let survivors: Vec<usize> = (*data).addrs_slice().to_vec();
            assert_eq!(survivors, rooted);
            assert!(survivors.iter().all(|a| a & 1 == 0));

            for addr in survivors {
                libc::free(addr as *mut libc::c_void);
            }
            AggregateData::destroy(data);
        }
    }

    // Survivors of one cycle ride a retained batch into the next cycle,
    // where they must merge with fresh retirements into one sorted,
    // duplicate-free dataset.
    #[test]
    fn survivors_carry_over_into_the_next_cycle() {
        unsafe {
            let blocks = alloc_blocks(1000, 16);
            let data = dataset_of(&blocks);
            for i in (0..1000).step_by(10) {
                (*data).refs(i).fetch_add(1, Ordering::Relaxed);
            }
            assert_eq!(sweep_to_fixpoint(&mut *data, &pool()), 900);

            // The collector packs what survived back into a batch and
            // keeps it as carry-over.
            let carry = GcData::create((*data).len());
            for &addr in (*data).addrs_slice() {
                (*carry).push(addr);
            }
            let survivors: Vec<usize> = (*data).addrs_slice().to_vec();
            AggregateData::destroy(data);

            // Next cycle: the carry-over chain is prepended to a fresh
            // hand-off before aggregation.
            let fresh = alloc_blocks(500, 16);
            let incoming = GcData::create(fresh.len());
            for &addr in &fresh {
                (*incoming).push(addr);
            }
            (*carry).next = incoming;

            let merged = aggregate(carry);
            assert_eq!((*merged).len(), 600);
            crate::utils::sort::assert_monotonic((*merged).addrs_slice());
            for &addr in survivors.iter().chain(fresh.iter()) {
                assert!((*merged).lookup(addr).is_some());
            }

            GcData::destroy(incoming);
            GcData::destroy(carry);
            AggregateData::destroy(merged);
            for addr in survivors.into_iter().chain(fresh) {
                libc::free(addr as *mut libc::c_void);
            }
        }
    }
}
