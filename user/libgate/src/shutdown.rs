//! Cooperative shutdown.
//!
//! Signals and the run timer both funnel into [`Shutdown::trigger`]. Loops
//! poll [`Shutdown::is_triggered`] once per iteration; nothing is forcibly
//! terminated. [`Shutdown::finalize`] guards the one-time flush of output
//! files against repeated signals.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gatesched_kernel::sync::Notify;
use hostal::HalError;
use log::info;

#[derive(Debug, Default)]
pub struct Shutdown {
    triggered: AtomicBool,
    finalized: AtomicBool,
    requests: AtomicUsize,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request shutdown. Returns `true` for the first request only.
    pub fn trigger(&self) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let first = !self.triggered.swap(true, Ordering::SeqCst);
        self.notify.notify();
        first
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// How many times shutdown was requested.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for a trigger. Returns whether one arrived.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.notify.wait_until(|| self.is_triggered(), timeout)
    }

    /// Wait for a trigger or until `deadline`, also returning early when
    /// `done()` holds (checked every `poll`).
    pub fn wait_until(&self, deadline: Option<Instant>, poll: Duration, mut done: impl FnMut() -> bool) {
        loop {
            if self.is_triggered() || done() {
                return;
            }
            let step = match deadline {
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return;
                    }
                    poll.min(at - now)
                }
                None => poll,
            };
            self.wait(step);
        }
    }

    /// Route SIGINT/SIGTERM to [`Shutdown::trigger`].
    pub fn install_signal_handler(self: &Arc<Self>) -> Result<(), HalError> {
        let shutdown = Arc::clone(self);
        hostal::signal::install(move || {
            if shutdown.trigger() {
                info!("signal received, shutting down");
            }
        })
    }

    /// Run `flush` unless a previous call already did. Returns its result,
    /// or `None` on later calls.
    pub fn finalize<R>(&self, flush: impl FnOnce() -> R) -> Option<R> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(flush())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }
}
