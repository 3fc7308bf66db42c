//! Subprocess runner that streams output live while capturing it.

pub mod result;
pub mod tee;

pub use result::{Captured, ProcessResult, RunError};
pub use tee::{Input, RunOptions, run_with_sinks, run_with_tee};
