//! Cooperative shutdown flag and process signal wiring.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Exit status used when a second stop signal forces the process down.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Shared "please stop" flag, checked by the worker between jobs.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless shutdown is requested first.
    ///
    /// Returns `true` when the sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
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

/// Route SIGINT, SIGTERM and SIGHUP to `signal`.
///
/// The first signal requests a cooperative stop. Any further signal exits
/// the process at once; leases held at that point expire after their TTL,
/// and a table lock file left behind is reclaimed by the next writer once
/// this process is gone.
/// Can only be installed once per process.
pub fn install_process_handlers(signal: &ShutdownSignal) -> Result<(), ctrlc::Error> {
    let signal = signal.clone();
    let received = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if received.fetch_add(1, Ordering::SeqCst) == 0 {
            info!("stop signal received, finishing current job");
            signal.request();
        } else {
            warn!("second stop signal received, exiting immediately");
            std::process::exit(FORCED_EXIT_CODE);
        }
    })
}
