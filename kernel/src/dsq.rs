//! Dispatch queues.
//!
//! User-created FIFOs holding runnable tasks until a CPU's `dispatch`
//! moves one into its local queue.  Capacity is unbounded; the number of
//! queues is not (see [`DsqTable::with_limit`]).

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::ops::{DsqId, EnqFlags, ScxError};
use crate::task::Tid;

/// Default cap on the number of user-created queues.
pub const DEFAULT_MAX_DSQS: usize = 64;

/// One queued task and the slice it was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedTask {
	pub tid: Tid,
	pub slice: Duration,
}

/// A FIFO of runnable tasks.
#[derive(Debug, Default)]
pub struct DispatchQueue {
	entries: VecDeque<QueuedTask>,
}

impl DispatchQueue {
	pub fn new() -> Self {
		Self { entries: VecDeque::new() }
	}

	/// Queue a task at the tail, or at the head with `EnqFlags::HEAD`.
	pub fn push(&mut self, entry: QueuedTask, flags: EnqFlags) {
		if flags.contains(EnqFlags::HEAD) {
			self.entries.push_front(entry);
		} else {
			self.entries.push_back(entry);
		}
	}

	/// Remove the first task accepted by `eligible` (FIFO order).
	///
	/// Tasks that are skipped keep their position.
	pub fn pop_first(&mut self, mut eligible: impl FnMut(Tid) -> bool) -> Option<QueuedTask> {
		let index = self.entries.iter().position(|e| eligible(e.tid))?;
		self.entries.remove(index)
	}

	/// Drop a task wherever it sits. Returns whether it was queued.
	pub fn remove(&mut self, tid: Tid) -> bool {
		let before = self.entries.len();
		self.entries.retain(|e| e.tid != tid);
		self.entries.len() != before
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Queued task ids, head first.
	pub fn tids(&self) -> Vec<Tid> {
		self.entries.iter().map(|e| e.tid).collect()
	}
}

/// All user-created dispatch queues of one host.
#[derive(Debug)]
pub struct DsqTable {
	queues: BTreeMap<DsqId, DispatchQueue>,
	limit: usize,
}

impl DsqTable {
	pub fn new() -> Self {
		Self::with_limit(DEFAULT_MAX_DSQS)
	}

	/// A table that refuses to create more than `limit` queues.
	pub fn with_limit(limit: usize) -> Self {
		Self { queues: BTreeMap::new(), limit }
	}

	pub fn create(&mut self, id: DsqId) -> Result<(), ScxError> {
		if id.is_builtin() {
			return Err(ScxError::DsqBuiltin(id));
		}
		if self.queues.contains_key(&id) {
			return Err(ScxError::DsqExists(id));
		}
		if self.queues.len() >= self.limit {
			return Err(ScxError::NoSpace(self.limit));
		}
		self.queues.insert(id, DispatchQueue::new());
		Ok(())
	}

	pub fn get(&self, id: DsqId) -> Result<&DispatchQueue, ScxError> {
		self.queues.get(&id).ok_or(ScxError::DsqNotFound(id))
	}

	pub fn get_mut(&mut self, id: DsqId) -> Result<&mut DispatchQueue, ScxError> {
		self.queues.get_mut(&id).ok_or(ScxError::DsqNotFound(id))
	}

	/// Remove a task from whichever queue holds it.
	pub fn remove_task(&mut self, tid: Tid) -> bool {
		self.queues.values_mut().any(|q| q.remove(tid))
	}

	/// Destroy every queue. Returns the tasks that were still queued.
	pub fn clear(&mut self) -> Vec<Tid> {
		let stranded = self.queues.values().flat_map(|q| q.tids()).collect();
		self.queues.clear();
		stranded
	}

	pub fn len(&self) -> usize {
		self.queues.len()
	}

	pub fn is_empty(&self) -> bool {
		self.queues.is_empty()
	}
}

impl Default for DsqTable {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn queued(tid: u32) -> QueuedTask {
		QueuedTask { tid: Tid(tid), slice: Duration::from_millis(20) }
	}

	#[test]
	fn fifo_order_with_head_insert() {
		let mut q = DispatchQueue::new();
		q.push(queued(1), EnqFlags::empty());
		q.push(queued(2), EnqFlags::WAKEUP);
		q.push(queued(3), EnqFlags::HEAD);
		assert_eq!(q.tids(), vec![Tid(3), Tid(1), Tid(2)]);
		assert_eq!(q.pop_first(|_| true).map(|e| e.tid), Some(Tid(3)));
		assert_eq!(q.pop_first(|_| true).map(|e| e.tid), Some(Tid(1)));
	}

	#[test]
	fn pop_first_skips_ineligible_without_reordering() {
		let mut q = DispatchQueue::new();
		for tid in 1..=3 {
			q.push(queued(tid), EnqFlags::empty());
		}
		let got = q.pop_first(|tid| tid != Tid(1));
		assert_eq!(got.map(|e| e.tid), Some(Tid(2)));
		assert_eq!(q.tids(), vec![Tid(1), Tid(3)]);
		assert!(q.pop_first(|_| false).is_none());
	}

	#[test]
	fn create_rejects_duplicates_builtins_and_overflow() {
		let mut table = DsqTable::with_limit(1);
		table.create(DsqId(0)).unwrap();
		assert_eq!(table.create(DsqId(0)), Err(ScxError::DsqExists(DsqId(0))));
		assert_eq!(table.create(DsqId::LOCAL), Err(ScxError::DsqBuiltin(DsqId::LOCAL)));
		assert_eq!(table.create(DsqId(1)), Err(ScxError::NoSpace(1)));
		assert!(matches!(table.get(DsqId(7)), Err(ScxError::DsqNotFound(_))));
	}

	#[test]
	fn remove_task_from_any_queue() {
		let mut table = DsqTable::new();
		table.create(DsqId(0)).unwrap();
		table.create(DsqId(1)).unwrap();
		table.get_mut(DsqId(1)).unwrap().push(queued(9), EnqFlags::empty());
		assert_eq!(table.get(DsqId(1)).unwrap().len(), 1);
		assert!(table.remove_task(Tid(9)));
		assert!(table.get(DsqId(1)).unwrap().is_empty());
		assert!(!table.remove_task(Tid(9)));
	}
}
