//! Cancellation token shared between the watch loop and signal delivery.

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const NOT_CANCELLED: i32 = 0;
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Records the first signal that cancelled it; later cancels are ignored.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    signal: Arc<AtomicI32>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with `signal`. Returns false if already cancelled.
    pub fn cancel(&self, signal: i32) -> bool {
        self.signal
            .compare_exchange(NOT_CANCELLED, signal, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn signal(&self) -> Option<i32> {
        match self.signal.load(Ordering::SeqCst) {
            NOT_CANCELLED => None,
            sig => Some(sig),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal().is_some()
    }

    /// Sleep for `dur`, waking early on cancellation. Returns true if cancelled.
    pub fn sleep(&self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Cancel `token` on SIGINT, SIGTERM or SIGHUP.
pub fn install_signal_handlers(token: CancelToken) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    thread::spawn(move || {
        for sig in signals.forever() {
            debug!(signal = sig, "received signal");
            token.cancel(sig);
        }
    });
    Ok(())
}
