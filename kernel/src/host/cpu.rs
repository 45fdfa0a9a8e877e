//! Simulated CPUs.

use crate::dsq::DispatchQueue;
use crate::task::{CpuId, Task, Tid};

/// One simulated CPU.
#[derive(Debug)]
pub struct SimCpu {
	pub id: CpuId,
	/// Task currently holding this CPU.
	pub current: Option<Tid>,
	/// Task that last left this CPU; handed to `dispatch` as `prev`.
	pub prev: Option<Task>,
	/// The CPU's local queue. Tasks here run next, without `dispatch`.
	pub local: DispatchQueue,
	/// Set by a kick, consumed by the CPU's dispatcher loop.
	pub kicked: bool,
	/// Set by a preempting kick; the current task should yield.
	pub preempt: bool,
}

impl SimCpu {
	pub fn new(id: CpuId) -> Self {
		Self {
			id,
			current: None,
			prev: None,
			local: DispatchQueue::new(),
			kicked: false,
			preempt: false,
		}
	}

	#[inline]
	pub fn is_idle(&self) -> bool {
		self.current.is_none()
	}
}
