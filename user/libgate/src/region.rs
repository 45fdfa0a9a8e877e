//! The region every node of the workload tree shares.
//!
//! One lock guards the active slot and the activity log; it is held only for
//! the read-modify-write of a single record. The running flag sits outside
//! the lock so workers can poll it cheaply, and a notifier lets sleepers
//! return as soon as it drops.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use gatesched_kernel::sync::Notify;
use gatesched_kernel::task::{Pid, Tid};
use parking_lot::Mutex;
use thiserror::Error;

/// Activity log capacity unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 100_000;

#[derive(Debug, Error)]
pub enum RegionError {
	#[error("activity log capacity must be at least 1")]
	ZeroCapacity,
	#[error("cannot reserve {0} activity records")]
	Alloc(usize),
}

/// Which worker last touched the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSlot {
	/// Node id in the tree.
	pub process: usize,
	/// Worker index within the node.
	pub thread: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityRecord {
	pub pid: Pid,
	pub tid: Tid,
}

struct Inner {
	active: Option<ActiveSlot>,
	log: Vec<ActivityRecord>,
}

pub struct SharedRegion {
	inner: Mutex<Inner>,
	capacity: usize,
	running: AtomicBool,
	changed: Notify,
}

impl SharedRegion {
	/// Reserve the whole log up front so recording never allocates.
	pub fn new(capacity: usize) -> Result<Self, RegionError> {
		if capacity == 0 {
			return Err(RegionError::ZeroCapacity);
		}
		let mut log = Vec::new();
		log.try_reserve_exact(capacity)
			.map_err(|_| RegionError::Alloc(capacity))?;
		Ok(Self {
			inner: Mutex::new(Inner { active: None, log }),
			capacity,
			running: AtomicBool::new(true),
			changed: Notify::new(),
		})
	}

	/// Mark `slot` active and append `(pid, tid)` if there is room.
	///
	/// Returns whether the record was appended. A full log drops the record;
	/// the active slot is still updated.
	pub fn record(&self, slot: ActiveSlot, pid: Pid, tid: Tid) -> bool {
		let mut inner = self.inner.lock();
		inner.active = Some(slot);
		if inner.log.len() >= self.capacity {
			return false;
		}
		inner.log.push(ActivityRecord { pid, tid });
		true
	}

	pub fn active(&self) -> Option<ActiveSlot> {
		self.inner.lock().active
	}

	/// Next write index, i.e. the number of records.
	pub fn len(&self) -> usize {
		self.inner.lock().log.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn is_full(&self) -> bool {
		self.len() >= self.capacity
	}

	#[inline]
	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	/// Clear the running flag and wake every sleeper.
	///
	/// Returns `true` only for the call that actually stopped the region.
	pub fn stop(&self) -> bool {
		let was_running = self.running.swap(false, Ordering::SeqCst);
		self.changed.notify();
		was_running
	}

	pub fn notifier(&self) -> &Notify {
		&self.changed
	}

	/// Sleep up to `period`. Returns `true` if the region stopped meanwhile.
	pub fn sleep(&self, period: Duration) -> bool {
		self.changed.wait_until(|| !self.is_running(), period)
	}

	pub fn snapshot(&self) -> Vec<ActivityRecord> {
		self.inner.lock().log.clone()
	}

	/// Write `<index> <pid> <tid>` lines, index from 1.
	pub fn write_log<W: Write>(&self, mut out: W) -> io::Result<usize> {
		let records = self.snapshot();
		for (i, r) in records.iter().enumerate() {
			writeln!(out, "{} {} {}", i + 1, r.pid, r.tid)?;
		}
		out.flush()?;
		Ok(records.len())
	}

	/// Persist the log to `path`. Returns the number of lines written.
	pub fn persist(&self, path: &Path) -> io::Result<usize> {
		self.write_log(BufWriter::new(File::create(path)?))
	}
}
