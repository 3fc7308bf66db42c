//! Following a submitted job's output.

pub mod cancel;
pub mod scheduler;
pub mod watch;

pub use cancel::{CancelToken, install_signal_handlers};
pub use scheduler::{JobHandle, ResolutionError, Scheduler, Slurm, parse_stdout_path, resolve};
pub use watch::{WatchOptions, WatchOutcome, WatchState, Watcher};
