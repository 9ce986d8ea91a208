pub mod clear;
pub mod stats;

pub use clear::{run_clear, run_evict_expired};
pub use stats::run_stats;
