//! CLI command implementations.

mod scan;
mod start;

pub use scan::run_scan;
pub use start::run_start;
