//! The collector thread and the cycle it runs.

use std::cell::UnsafeCell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use scoped_thread_pool::Pool;

use crate::collector::gc_data::{AggregateData, GcData};
use crate::collector::{aggregate, barrier, scan, sweep};
use crate::gc_fatal;
use crate::sync::Monitor;
use crate::{env, thread};

struct Incoming {
    head: *mut GcData,
    waiting: bool,
}

/// Process-wide collector context: the batch queue, the carry-over chain,
/// the barrier counters, the outstanding child, and the statistics. One
/// instance exists for the life of the process.
pub struct Collector {
    incoming: Monitor<Incoming>,
    // Touched only from the collector thread.
    uncollected: UnsafeCell<*mut GcData>,
    pub(crate) received_signal: AtomicUsize,
    pub(crate) cleanup_counter: AtomicUsize,
    child_pid: AtomicI32,
    scan_max: AtomicUsize,
    signum: i32,
    pool: Pool,
    started: AtomicBool,
}

unsafe impl Send for Collector {}
unsafe impl Sync for Collector {}

static COLLECTOR: Lazy<Collector> = Lazy::new(|| Collector {
    incoming: Monitor::new(Incoming {
        head: null_mut(),
        waiting: false,
    }),
    uncollected: UnsafeCell::new(null_mut()),
    received_signal: AtomicUsize::new(0),
    cleanup_counter: AtomicUsize::new(0),
    child_pid: AtomicI32::new(-1),
    scan_max: AtomicUsize::new(0),
    signum: env::checkpoint_signal(),
    pool: Pool::new(env::sweep_threads()),
    started: AtomicBool::new(false),
});

pub fn ctx() -> &'static Collector {
    &COLLECTOR
}

impl Collector {
    pub(crate) fn signum(&self) -> i32 {
        self.signum
    }

    /// Number of snapshots taken so far.
    pub fn fork_count(&self) -> usize {
        self.cleanup_counter.load(Ordering::Acquire)
    }

    /// Largest byte count one child scan has covered.
    pub fn scan_max(&self) -> usize {
        self.scan_max.load(Ordering::Acquire)
    }

    /// Installs the checkpoint handler and the process-death hook, then
    /// spawns the collector thread. Idempotent.
    pub fn start() {
        let c = ctx();
        if c.started.swap(true, Ordering::SeqCst) {
            return;
        }

        barrier::install_checkpoint_handler(c.signum);
        unsafe {
            libc::atexit(process_death_hook);
        }

        let sync_with_child = Arc::new((Mutex::new(false), Condvar::new()));
        let sync_with_child_2 = sync_with_child.clone();
        let spawned = std::thread::Builder::new()
            .name("forkgc-collector".into())
            .spawn(move || {
                {
                    let mut lock = sync_with_child_2.0.lock();
                    *lock = true;
                    sync_with_child_2.1.notify_one();
                }
                collector_thread_main();
            });
        if spawned.is_err() {
            gc_fatal!("unable to spawn the collector thread");
        }

        // Wait for the collector thread to be actually running.
        let mut lock = sync_with_child.0.lock();
        if !*lock {
            sync_with_child.1.wait(&mut lock);
        }
    }
}

extern "C" fn process_death_hook() {
    on_process_death();
}

/// Kills any outstanding child scanner. Registered with `atexit`; safe to
/// call at any time.
pub fn on_process_death() {
    let pid = ctx().child_pid.load(Ordering::Acquire);
    if pid > 0 {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

/// Hands a batch of retirement records to the collector and wakes it. The
/// batch (and its mapping) belongs to the collector from here on.
pub fn initiate_collection(batch: *mut GcData) {
    let c = ctx();
    let mut ml = c.incoming.lock();
    unsafe {
        (*batch).next = ml.head;
    }
    ml.head = batch;
    if ml.waiting {
        ml.notify_one();
    }
}

/// Long-running collector loop: wait for batches, detach the whole chain,
/// run one cycle, repeat.
pub fn collector_thread_main() -> ! {
    let c = ctx();
    loop {
        let head;
        {
            let mut ml = c.incoming.lock();
            while ml.head.is_null() {
                // Wait for somebody to come up with a set of addresses
                // for us to collect.
                ml.waiting = true;
                ml.wait();
                ml.waiting = false;
            }
            head = ml.head;
            ml.head = null_mut();
        }

        if log::log_enabled!(target: "gc", log::Level::Debug) {
            let (batches, addrs) = unsafe { GcData::chain_totals(head) };
            log::debug!(target: "gc", "{} collect(s) waiting, {} candidates", batches, addrs);
        }

        unsafe {
            garbage_collect(c, head);
        }
    }
}

/// One full cycle over `gc_data`, a detached chain of batches.
unsafe fn garbage_collect(c: &Collector, mut gc_data: *mut GcData) {
    // Include the addrs from the last collection iteration.
    let uncollected = c.uncollected.get();
    if !(*uncollected).is_null() {
        let mut tmp = *uncollected;
        while !(*tmp).next.is_null() {
            tmp = (*tmp).next;
        }
        (*tmp).next = gc_data;
        gc_data = *uncollected;
        *uncollected = null_mut();
    }

    let working = aggregate::aggregate(gc_data);
    let data = &mut *working;

    // Open a pipe for communication between parent and child. Packet
    // semantics: one write, one read.
    let mut pipefd = [0 as libc::c_int; 2];
    if open_pipe(&mut pipefd) != 0 {
        gc_fatal!("collector was unable to open a pipe");
    }

    // Send out signals. When everybody is waiting at the line, fork the
    // process for the snapshot.
    barrier::quiesce_mutators(c);
    let child_pid = libc::fork();

    if child_pid == -1 {
        gc_fatal!("collection failed (fork)");
    } else if child_pid == 0 {
        // Child: scan the snapshot, report the byte count, and exit.
        libc::close(pipefd[0]);
        scan::child_scan(data, pipefd[1]);
    }

    c.child_pid.store(child_pid, Ordering::Release);
    barrier::release_mutators(c);
    libc::close(pipefd[1]);

    // Wait for the child to complete the scan. The counters in the shared
    // dataset are not ours to read until this byte count arrives.
    let mut bytes_scanned = 0usize;
    let got = libc::read(
        pipefd[0],
        &mut bytes_scanned as *mut usize as *mut libc::c_void,
        core::mem::size_of::<usize>(),
    );
    if got != core::mem::size_of::<usize>() as isize {
        gc_fatal!("failed to read from child");
    }
    let mut status = 0;
    libc::waitpid(child_pid, &mut status, 0);
    c.child_pid.store(-1, Ordering::Release);

    if bytes_scanned > c.scan_max.load(Ordering::Relaxed) {
        c.scan_max.store(bytes_scanned, Ordering::Relaxed);
    }
    log::debug!(target: "gc", "child scanned {} bytes", bytes_scanned);

    // Identify unreferenced memory and free it.
    let freed = sweep::sweep_to_fixpoint(data, &c.pool);

    // Pack the survivors back into the front of the batch chain; their
    // capacity is reused as next cycle's carry-over.
    let mut dst = gc_data;
    (*dst).clear();
    for i in 0..data.len() {
        if (*uncollected).is_null() {
            *uncollected = gc_data;
        }
        if (*dst).len() >= (*dst).capacity() {
            dst = (*dst).next;
            debug_assert!(!dst.is_null());
            (*dst).clear();
        }
        (*dst).push(data.addr(i));
    }

    log::info!(
        target: "gc",
        "cycle complete: {} freed, {} retained for the next cycle",
        freed,
        data.len()
    );

    libc::close(pipefd[0]);
    // The shared dataset and the exhausted batches are released only now,
    // after the sweep has fully converged.
    AggregateData::destroy(working);

    let mut rest;
    if (*dst).len() != 0 {
        rest = (*dst).next;
        (*dst).next = null_mut();
    } else {
        debug_assert!((*uncollected).is_null());
        rest = gc_data;
    }
    while !rest.is_null() {
        let next = (*rest).next;
        GcData::destroy(rest);
        rest = next;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        unsafe fn open_pipe(fds: &mut [libc::c_int; 2]) -> libc::c_int {
            libc::pipe2(fds.as_mut_ptr(), libc::O_DIRECT)
        }
    } else {
        unsafe fn open_pipe(fds: &mut [libc::c_int; 2]) -> libc::c_int {
            libc::pipe(fds.as_mut_ptr())
        }
    }
}

/// Prints the memory footprint, the cumulative fork count, and the peak
/// bytes scanned by one snapshot.
pub fn print_statistics() {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/proc/self/statm") {
            Ok(statm) => println!("statm: {}", statm.trim_end()),
            Err(_) => gc_fatal!("unable to open /proc/self/statm"),
        }
    }
    let c = ctx();
    println!("fork-count: {}", c.fork_count());
    println!("scan-max: {}", c.scan_max());
}
