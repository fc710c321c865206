//! Turns a chain of per-thread batches into the scan-ready dataset.

use crate::collector::gc_data::{AggregateData, GcData};
use crate::memory;
use crate::utils::sort;

/// Merges every batch in `list` into one freshly mapped [`AggregateData`]:
/// copy, sort, drop duplicates, sample the minimap, record block sizes.
/// The reference counters stay zero; the child scanner owns them next.
pub unsafe fn aggregate(list: *mut GcData) -> *mut AggregateData {
    let (batches, total) = GcData::chain_totals(list);
    assert!(total != 0);

    let ret = AggregateData::create(total);
    let data = &mut *ret;

    let mut dest = 0;
    let mut tmp = list;
    while !tmp.is_null() {
        for &addr in (*tmp).as_slice() {
            data.set_addr(dest, addr);
            dest += 1;
        }
        tmp = (*tmp).next;
    }
    debug_assert_eq!(dest, total);

    sort::sort(data.addrs_slice_mut());
    let savings = sort::compact_sorted(data.addrs_slice_mut());
    data.set_len(total - savings);
    sort::assert_monotonic(data.addrs_slice());

    data.rebuild_minimap();
    data.set_bounds();

    for i in 0..data.len() {
        debug_assert_eq!(data.alloc_sz(i), 0);
        let sz = memory::usable_size(data.addr(i));
        assert!(sz > 0);
        data.set_alloc_sz(i, sz as i32);
    }

    #[cfg(debug_assertions)]
    for i in 0..data.len() {
        debug_assert_eq!(data.refs(i).load(std::sync::atomic::Ordering::Relaxed), 0);
        debug_assert_eq!(data.addr(i) & 1, 0);
    }

    log::debug!(
        target: "gc",
        "aggregated {} candidates from {} batches ({} duplicates dropped, {} bytes mapped)",
        data.len(),
        batches,
        savings,
        data.map_size()
    );

    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    unsafe fn batch_of(addrs: &[usize]) -> *mut GcData {
        let batch = GcData::create(addrs.len());
        for &a in addrs {
            (*batch).push(a);
        }
        batch
    }

    #[test]
    fn merges_sorts_and_dedups() {
        unsafe {
            let blocks: Vec<usize> = (0..6).map(|_| libc::calloc(1, 32) as usize).collect();

            // Two batches, unsorted, with one address retired twice.
            let a = batch_of(&[blocks[4], blocks[0], blocks[2]]);
            let b = batch_of(&[blocks[5], blocks[1], blocks[3], blocks[0]]);
            (*a).next = b;

            let data = aggregate(a);
            assert_eq!((*data).len(), 6);
            sort::assert_monotonic((*data).addrs_slice());
            assert_eq!((*data).min_val(), (*data).addr(0));
            assert_eq!((*data).max_val(), (*data).addr(5));
            for i in 0..6 {
                assert!((*data).alloc_sz(i) >= 32);
                assert_eq!((*data).refs(i).load(Ordering::Relaxed), 0);
            }
            assert_eq!((*data).n_minimap(), 1);

            AggregateData::destroy(data);
            GcData::destroy(a);
            GcData::destroy(b);
            for block in blocks {
                libc::free(block as *mut libc::c_void);
            }
        }
    }

    #[test]
    fn single_candidate_dataset() {
        unsafe {
            let block = libc::calloc(1, 16) as usize;
            let batch = batch_of(&[block]);
            let data = aggregate(batch);
            assert_eq!((*data).len(), 1);
            assert_eq!((*data).n_minimap(), 1);
            assert_eq!((*data).min_val(), block);
            assert_eq!((*data).max_val(), block);
            AggregateData::destroy(data);
            GcData::destroy(batch);
            libc::free(block as *mut libc::c_void);
        }
    }
}
