//! Epoch-counting notifier.
//!
//! Wakes every waiter whenever [`Notify::notify`] is called. Waiters check
//! their condition under the epoch lock and notifiers bump the epoch under
//! it, so a notification that lands between a check and the wait is never
//! lost.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A broadcast wake-up with a monotonically increasing epoch.
#[derive(Debug, Default)]
pub struct Notify {
	epoch: Mutex<u64>,
	cond: Condvar,
}

impl Notify {
	pub fn new() -> Self {
		Self { epoch: Mutex::new(0), cond: Condvar::new() }
	}

	/// Bump the epoch and wake all waiters.
	pub fn notify(&self) {
		let mut epoch = self.epoch.lock();
		*epoch = epoch.wrapping_add(1);
		self.cond.notify_all();
	}

	/// Block until `done()` holds or `timeout` elapses. Returns `done()`.
	///
	/// `done` is re-evaluated after every notification; it must not call
	/// back into this notifier.
	pub fn wait_until(&self, mut done: impl FnMut() -> bool, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		let mut epoch = self.epoch.lock();
		loop {
			if done() {
				return true;
			}
			if self.cond.wait_until(&mut epoch, deadline).timed_out() {
				return done();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, Ordering};
	use std::sync::Arc;
	use std::thread;

	#[test]
	fn wait_until_returns_on_notify() {
		let n = Arc::new(Notify::new());
		let flag = Arc::new(AtomicBool::new(false));
		let waker = {
			let n = Arc::clone(&n);
			let flag = Arc::clone(&flag);
			thread::spawn(move || {
				thread::sleep(Duration::from_millis(10));
				flag.store(true, Ordering::SeqCst);
				n.notify();
			})
		};
		assert!(n.wait_until(|| flag.load(Ordering::SeqCst), Duration::from_secs(5)));
		waker.join().unwrap();
	}

	#[test]
	fn wait_until_times_out() {
		let n = Notify::new();
		let start = Instant::now();
		assert!(!n.wait_until(|| false, Duration::from_millis(20)));
		assert!(start.elapsed() >= Duration::from_millis(20));
	}

	#[test]
	fn wait_until_predicate() {
		let n = Notify::new();
		assert!(n.wait_until(|| true, Duration::ZERO));
		assert!(!n.wait_until(|| false, Duration::from_millis(5)));
	}
}
