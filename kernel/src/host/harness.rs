//! Deterministic, single-threaded driver for the host state machine.
//!
//! Tests script every event by hand: spawn a task, let a CPU pick, switch a
//! task out, advance the clock. Nothing happens in between, so the outcome
//! of each hook is fully determined by the script.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::state::{HostState, ScxState, SwitchOut};
use crate::dsq::DEFAULT_MAX_DSQS;
use crate::ops::{DsqId, ExitInfo, SchedOps, ScxError};
use crate::task::{alloc_tid, CpuId, CpuMask, Pid, Task, TaskEntry, TaskState, Tid};

pub struct Harness {
    ops: Arc<dyn SchedOps>,
    state: HostState,
    now: Instant,
}

impl Harness {
    /// Attach `ops` to a fresh host with `nr_cpus` CPUs.
    pub fn new(nr_cpus: usize, ops: Arc<dyn SchedOps>) -> Result<Self, ScxError> {
        Self::with_limit(nr_cpus, DEFAULT_MAX_DSQS, ops)
    }

    /// Like [`Harness::new`] with a cap on user-created queues.
    pub fn with_limit(nr_cpus: usize, max_dsqs: usize, ops: Arc<dyn SchedOps>) -> Result<Self, ScxError> {
        let mut state = HostState::new(nr_cpus, max_dsqs);
        state.enable(&*ops)?;
        Ok(Self { ops, state, now: Instant::now() })
    }

    pub fn state(&self) -> &HostState {
        &self.state
    }

    pub fn scx(&self) -> ScxState {
        self.state.scx()
    }

    /// Create a task and wake it.
    pub fn spawn(&mut self, pid: Pid, name: &str, affinity: CpuMask) -> Result<Tid, ScxError> {
        let tid = alloc_tid();
        let cpu = affinity.first(self.state.nr_cpus()).unwrap_or(0);
        let task = Task { pid, tid, cpu };
        self.state.add_task(TaskEntry::new(task, name, affinity))?;
        self.state.wake(&*self.ops, tid)?;
        Ok(tid)
    }

    /// Let `cpu` pick a task if it is idle. Returns what it is running.
    pub fn schedule(&mut self, cpu: CpuId) -> Option<Tid> {
        self.state.balance(&*self.ops, cpu, self.now);
        self.state.current(cpu)
    }

    /// Schedule every CPU once, lowest id first.
    pub fn schedule_all(&mut self) -> Vec<Option<Tid>> {
        (0..self.state.nr_cpus() as CpuId)
            .map(|cpu| self.schedule(cpu))
            .collect()
    }

    pub fn yield_task(&mut self, tid: Tid) -> Result<(), ScxError> {
        self.state.switch_out(&*self.ops, tid, SwitchOut::Yield)
    }

    pub fn sleep_task(&mut self, tid: Tid) -> Result<(), ScxError> {
        self.state.switch_out(&*self.ops, tid, SwitchOut::Sleep)
    }

    pub fn wake_task(&mut self, tid: Tid) -> Result<(), ScxError> {
        self.state.wake(&*self.ops, tid)
    }

    pub fn exit_task(&mut self, tid: Tid) -> Result<(), ScxError> {
        self.state.switch_out(&*self.ops, tid, SwitchOut::Exit)
    }

    /// Move the clock forward and run every CPU's tick.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        for cpu in 0..self.state.nr_cpus() as CpuId {
            self.state.tick(cpu, self.now);
        }
    }

    pub fn current(&self, cpu: CpuId) -> Option<Tid> {
        self.state.current(cpu)
    }

    pub fn task_state(&self, tid: Tid) -> Option<TaskState> {
        self.state.task(tid).map(|e| e.state)
    }

    pub fn need_resched(&self, tid: Tid) -> bool {
        self.state.should_yield(tid)
    }

    pub fn nr_queued(&self, dsq: DsqId) -> Result<usize, ScxError> {
        self.state.nr_queued(dsq)
    }

    /// CPUs kicked since the last call.
    pub fn take_kicks(&mut self) -> Vec<CpuId> {
        self.state.take_kicks()
    }

    pub fn detach(&mut self, reason: &str) {
        self.state.disable(&*self.ops, &ExitInfo::unregistered(reason));
    }
}
