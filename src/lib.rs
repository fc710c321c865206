//! Fork-based conservative reclamation for manually retired heap pointers.
//!
//! Mutator threads hand pointers they have unlinked from their data
//! structures to a collector thread. The collector quiesces the mutators,
//! forks a copy-on-write snapshot of the process, and lets the child scan
//! the frozen stacks and candidate blocks for references. Candidates that
//! nobody references are freed in the parent; the rest are retried on the
//! next cycle.

pub mod collector;
pub mod env;
pub mod memory;
pub mod queue;
pub mod sync;
pub mod thread;
pub mod utils;

pub use crate::collector::barrier::wait_for_snapshot;
pub use crate::collector::gc_data::{AggregateData, GcData, PTR_MASK};
pub use crate::collector::{
    collector_thread_main, initiate_collection, on_process_death, print_statistics, Collector,
};
pub use crate::thread::{register_current, retire, unregister_current};

/// Unrecoverable failure: print a diagnostic and abort the process. The
/// engine admits no partial progress, so every resource failure lands here.
#[macro_export]
macro_rules! gc_fatal {
    ($($arg:tt)*) => {{
        eprintln!("forkgc fatal: {}", format_args!($($arg)*));
        ::std::process::abort()
    }};
}
