pub mod monitor;

pub use self::monitor::Monitor;
