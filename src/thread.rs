//! Registered mutator threads.
//!
//! Every thread that retires pointers is registered here with its stack
//! range, so the forked child knows which memory to treat as roots. The
//! records carry a reference count: a stack walk in flight keeps the record
//! (and the stack it describes) alive, and a thread exiting while somebody
//! still holds its record is a fatal race.

use std::cell::{Cell, UnsafeCell};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::collector::{self, gc_data::GcData};
use crate::env;
use crate::gc_fatal;
use crate::queue::PtrRing;

pub struct ThreadData {
    pthread: libc::pthread_t,
    stack_low: usize,
    stack_high: usize,
    last_sp: AtomicUsize,
    ref_count: AtomicI32,
    ring: UnsafeCell<PtrRing>,
    stack_is_ours: bool,
}

unsafe impl Send for ThreadData {}
unsafe impl Sync for ThreadData {}

impl ThreadData {
    fn new() -> Box<ThreadData> {
        let (low, high) = unsafe { current_stack_bounds() };
        Box::new(ThreadData {
            pthread: unsafe { libc::pthread_self() },
            stack_low: low,
            stack_high: high,
            last_sp: AtomicUsize::new(approximate_stack_pointer()),
            ref_count: AtomicI32::new(1),
            ring: UnsafeCell::new(PtrRing::new(env::ptrs_per_thread())),
            stack_is_ours: false,
        })
    }

    pub fn stack_low(&self) -> usize {
        self.stack_low
    }

    pub fn stack_high(&self) -> usize {
        self.stack_high
    }

    /// Stack pointer recorded at the most recent snapshot checkpoint (or
    /// at registration). Everything live sits above it.
    pub fn saved_sp(&self) -> usize {
        self.last_sp.load(Ordering::Acquire)
    }

    pub(crate) fn record_sp(&self, sp: usize) {
        debug_assert!(sp >= self.stack_low && sp < self.stack_high);
        self.last_sp.store(sp, Ordering::Release);
    }

    pub fn stack_is_ours(&self) -> bool {
        self.stack_is_ours
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        unsafe fn current_stack_bounds() -> (usize, usize) {
            let this = libc::pthread_self();
            let high = libc::pthread_get_stackaddr_np(this) as usize;
            let size = libc::pthread_get_stacksize_np(this);
            (high - size, high)
        }
    } else {
        unsafe fn current_stack_bounds() -> (usize, usize) {
            let mut low = core::ptr::null_mut::<libc::c_void>();
            let mut size = 0;
            let mut attr: libc::pthread_attr_t =
                core::mem::MaybeUninit::zeroed().assume_init();
            libc::pthread_attr_init(&mut attr);
            libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
            libc::pthread_attr_getstack(&mut attr, &mut low, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            (low as usize, low as usize + size)
        }
    }
}

#[inline(never)]
pub fn approximate_stack_pointer() -> usize {
    let mut x: *const u8 = core::ptr::null();
    x = &x as *const *const u8 as *const u8;
    x as usize
}

struct Registry {
    threads: Mutex<Vec<*mut ThreadData>>,
}

unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
    threads: Mutex::new(Vec::new()),
});

thread_local! {
    static TDATA: Cell<*mut ThreadData> = const { Cell::new(null_mut()) };
    static TDATA_GUARD: UnregisterGuard = const { UnregisterGuard };
}

struct UnregisterGuard;

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        if !TDATA.with(|c| c.get()).is_null() {
            unregister_current();
        }
    }
}

/// Registers the calling thread as a mutator. Idempotent. The ring
/// capacity comes from the environment at first registration.
pub fn register_current() {
    if !TDATA.with(|c| c.get()).is_null() {
        return;
    }
    let td = Box::into_raw(ThreadData::new());
    TDATA.with(|c| c.set(td));
    TDATA_GUARD.with(|_| {});
    REGISTRY.threads.lock().push(td);
    log::trace!(target: "gc", "registered thread {:?}", std::thread::current().id());
}

/// Removes the calling thread from the registry, handing off any pending
/// retirements first. Fatal if a stack walk still holds the record: the
/// stack is about to disappear under it.
pub fn unregister_current() {
    let td = TDATA.with(|c| c.replace(null_mut()));
    if td.is_null() {
        return;
    }

    unsafe {
        let ring = &mut *(*td).ring.get();
        if !ring.is_empty() {
            hand_off(ring);
        }
    }

    REGISTRY.threads.lock().retain(|&t| t != td);

    unsafe {
        if (*td).ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            gc_fatal!("detected data race on exiting thread");
        }
        drop(Box::from_raw(td));
    }
    log::trace!(target: "gc", "unregistered thread {:?}", std::thread::current().id());
}

pub fn try_current() -> Option<&'static ThreadData> {
    let td = TDATA.with(|c| c.get());
    if td.is_null() {
        None
    } else {
        Some(unsafe { &*td })
    }
}

fn current() -> &'static ThreadData {
    if TDATA.with(|c| c.get()).is_null() {
        register_current();
    }
    unsafe { &*TDATA.with(|c| c.get()) }
}

unsafe fn hand_off(ring: &mut PtrRing) {
    let batch = GcData::create(ring.capacity());
    for &addr in ring.as_slice() {
        (*batch).push(addr);
    }
    ring.clear();
    collector::initiate_collection(batch);
}

/// Retires one heap pointer: the block is out of every shared structure
/// but concurrent readers may still reach it. Registers the thread on
/// first use. A full ring triggers a synchronous hand-off to the
/// collector; nothing is ever dropped.
pub fn retire(ptr: *mut libc::c_void) {
    debug_assert!(ptr as usize & 1 == 0);
    let td = current();
    unsafe {
        let ring = &mut *td.ring.get();
        if !ring.push(ptr as usize) {
            hand_off(ring);
            ring.push(ptr as usize);
        }
    }
}

/// Pushes whatever the calling thread has retired so far to the collector,
/// even if the ring is not full.
pub fn flush_retired() {
    if let Some(td) = try_current() {
        unsafe {
            let ring = &mut *td.ring.get();
            if !ring.is_empty() {
                hand_off(ring);
            }
        }
    }
}

/// Finds the registered thread whose stack contains `addr`, bumping its
/// reference count so the record outlives the caller's walk. Pair with
/// [`release`].
pub fn find_by_address(addr: usize) -> Option<&'static ThreadData> {
    let threads = REGISTRY.threads.lock();
    for &td in threads.iter() {
        let td = unsafe { &*td };
        if addr >= td.stack_low && addr < td.stack_high {
            td.ref_count.fetch_add(1, Ordering::AcqRel);
            return Some(td);
        }
    }
    None
}

pub fn release(td: &ThreadData) {
    td.ref_count.fetch_sub(1, Ordering::AcqRel);
}

/// Delivers `sig` to every registered thread and returns how many signals
/// went out. The collector spins until that many acknowledgements arrive.
pub(crate) fn signal_all(sig: i32) -> usize {
    let threads = REGISTRY.threads.lock();
    let mut delivered = 0;
    for &td in threads.iter() {
        if unsafe { libc::pthread_kill((*td).pthread, sig) } == 0 {
            delivered += 1;
        }
    }
    delivered
}

/// Walks the registry without taking its lock. Only the forked child may
/// do this: it is single threaded and works on a frozen snapshot, and the
/// lock may have been held by some parent thread at fork time.
pub(crate) unsafe fn each_registered_unlocked(mut f: impl FnMut(&ThreadData)) {
    let threads = &*REGISTRY.threads.data_ptr();
    for &td in threads.iter() {
        f(&*td);
    }
}

static FREE_STASH: Mutex<Vec<Vec<usize>>> = Mutex::new(Vec::new());

/// Stashes a list of blocks whose free must happen on a mutator (the
/// allocator shim pulls these when its arenas require same-thread frees).
pub fn push_free_list(list: Vec<usize>) {
    FREE_STASH.lock().push(list);
}

/// Pops the most recently stashed free list, if any.
pub fn pop_free_list() -> Option<Vec<usize>> {
    FREE_STASH.lock().pop()
}
