//! The quiescence barrier in front of the snapshot.
//!
//! The collector posts a signal to every registered mutator and forks only
//! once each of them has acknowledged from inside the handler. The handler
//! spills the register file to the stack before acknowledging, so any live
//! pointer that existed only in a register is on the stack by the time the
//! snapshot is taken. `cleanup_counter` is a counter rather than a flag so
//! back-to-back cycles cannot release a straggler from the previous one.

use std::sync::atomic::Ordering;

use crate::collector::{ctx, Collector};
use crate::gc_fatal;
use crate::thread;

extern "C" {
    #[allow(improper_ctypes)]
    fn getcontext(ctx: *mut libc::ucontext_t) -> libc::c_int;
}

pub(crate) fn install_checkpoint_handler(signum: i32) {
    unsafe {
        let mut act: libc::sigaction =
            core::mem::MaybeUninit::<libc::sigaction>::zeroed().assume_init();
        libc::sigemptyset(&mut act.sa_mask);
        act.sa_sigaction = checkpoint_handler as usize;
        act.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;

        if libc::sigaction(signum, &act, core::ptr::null_mut()) < 0 {
            gc_fatal!("failed to install the snapshot checkpoint handler");
        }
    }
}

unsafe extern "C" fn checkpoint_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    wait_for_snapshot();
}

/// Mutator-side checkpoint. Spills the register file to the stack, records
/// the stack pointer for the scanner, acknowledges the collector, and
/// parks until the parent reports that the fork happened. Runs inside the
/// signal handler; everything here is async-signal-tolerant (atomics,
/// yields, one `getcontext`).
pub fn wait_for_snapshot() {
    let c = ctx();
    let old_counter = c.cleanup_counter.load(Ordering::Acquire);

    // Spilled registers. The ucontext lives on this stack frame until the
    // wait below finishes, which is after the fork.
    let mut regs = core::mem::MaybeUninit::<libc::ucontext_t>::uninit();
    unsafe {
        getcontext(regs.as_mut_ptr());
    }

    if let Some(td) = thread::try_current() {
        td.record_sp(thread::approximate_stack_pointer());
    }

    c.received_signal.fetch_add(1, Ordering::SeqCst);
    while old_counter == c.cleanup_counter.load(Ordering::Acquire) {
        std::thread::yield_now();
    }

    std::hint::black_box(&regs);
}

/// Collector-side half of the barrier: signal everybody, then spin until
/// every signalled mutator has passed the checkpoint. On return the world
/// is quiescent and it is safe to fork.
pub(crate) fn quiesce_mutators(c: &Collector) {
    c.received_signal.store(0, Ordering::SeqCst);
    let sig_count = thread::signal_all(c.signum());
    while c.received_signal.load(Ordering::SeqCst) < sig_count {
        std::thread::yield_now();
    }
    log::trace!(target: "gc-barrier", "{} mutator(s) parked at the checkpoint", sig_count);
}

/// Releases every mutator parked at the checkpoint.
pub(crate) fn release_mutators(c: &Collector) {
    c.cleanup_counter.fetch_add(1, Ordering::SeqCst);
}
