pub mod aggregate;
pub mod barrier;
#[allow(clippy::module_inception)]
pub mod collector;
pub mod gc_data;
pub mod scan;
pub mod sweep;

pub use self::collector::{
    collector_thread_main, ctx, initiate_collection, on_process_death, print_statistics,
    Collector,
};
