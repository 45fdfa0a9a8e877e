// =============================================================================
// gatesched — Host State Machine
// =============================================================================
//
// Everything the host knows lives in one `HostState`: the CPUs, the
// user-created dispatch queues and the task table. Both drivers (the
// threaded `Host` and the deterministic `Harness`) own exactly one of these
// and call its methods; the methods are where policy hooks get invoked.
//
// Event flow for one task:
//
//   wake ──► select_cpu ──► enqueue ──► [DSQ] ──► dispatch ──► [local]
//                                                                 │
//   switch_out ◄── (task code runs) ◄── running ◄── balance ◄─────┘
//       │
//       └──► stopping ──► Yield: enqueue again
//                         Sleep: wait for the next wake
//                         Exit:  forget the task
//
// Every method runs to completion before the next one starts (the caller
// holds the host lock), so a hook never observes a half-applied event.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::cpu::SimCpu;
use crate::dsq::{DsqTable, QueuedTask};
use crate::ops::{
    DsqId, EnqFlags, ExitInfo, ExitKind, KickFlags, OpsFlags, SchedOps, ScxError, SLICE_DFL,
};
use crate::task::{CpuId, Task, TaskEntry, TaskState, Tid};

/// Lifecycle of the attached policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScxState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

impl ScxState {
    /// The word published to the state file.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScxState::Disabled => "disabled",
            ScxState::Enabling => "enabling",
            ScxState::Enabled => "enabled",
            ScxState::Disabling => "disabling",
        }
    }
}

/// Why a running task is leaving its CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOut {
    /// Still runnable; goes straight back through `enqueue`.
    Yield,
    /// Blocks until the next wake.
    Sleep,
    /// Gone for good.
    Exit,
}

// ── Kfuncs ──────────────────────────────────────────────────────

/// The helper surface a policy hook may call.
///
/// Borrowed from `HostState` for the duration of one hook.
pub struct Kfuncs<'a> {
    cpu: CpuId,
    cpus: &'a mut [SimCpu],
    dsqs: &'a mut DsqTable,
    tasks: &'a HashMap<Tid, TaskEntry>,
    inserted: bool,
}

impl<'a> Kfuncs<'a> {
    pub fn create_dsq(&mut self, id: DsqId) -> Result<(), ScxError> {
        self.dsqs.create(id)
    }

    /// Queue `task` on `dsq` with the given slice.
    ///
    /// `DsqId::LOCAL` targets the local queue of the task's CPU.
    pub fn dsq_insert(
        &mut self,
        task: &Task,
        dsq: DsqId,
        slice: Duration,
        flags: EnqFlags,
    ) -> Result<(), ScxError> {
        let entry = QueuedTask { tid: task.tid, slice };
        if dsq == DsqId::LOCAL {
            let cpu = self
                .cpus
                .get_mut(task.cpu as usize)
                .ok_or(ScxError::InvalidCpu(task.cpu))?;
            cpu.local.push(entry, flags);
        } else {
            self.dsqs.get_mut(dsq)?.push(entry, flags);
        }
        self.inserted = true;
        Ok(())
    }

    /// Move the first task on `dsq` that may run here into this CPU's local
    /// queue. Returns whether one was moved.
    pub fn dsq_move_to_local(&mut self, dsq: DsqId) -> bool {
        let cpu = self.cpu;
        let tasks = self.tasks;
        let Ok(queue) = self.dsqs.get_mut(dsq) else {
            return false;
        };
        let eligible = |tid: Tid| {
            tasks
                .get(&tid)
                .is_some_and(|e| e.state == TaskState::Runnable && e.affinity.contains(cpu))
        };
        match queue.pop_first(eligible) {
            Some(entry) => {
                self.cpus[cpu as usize].local.push(entry, EnqFlags::empty());
                true
            }
            None => false,
        }
    }

    pub fn kick_cpu(&mut self, cpu: CpuId, flags: KickFlags) {
        let Some(target) = self.cpus.get_mut(cpu as usize) else {
            warn!("kick_cpu: cpu {} out of range", cpu);
            return;
        };
        if flags.contains(KickFlags::IDLE) && !target.is_idle() {
            return;
        }
        target.kicked = true;
        if flags.contains(KickFlags::PREEMPT) && !target.is_idle() {
            target.preempt = true;
        }
    }

    /// CPU the task last ran on or was assigned to.
    pub fn task_cpu(&self, task: &Task) -> CpuId {
        self.tasks.get(&task.tid).map_or(task.cpu, |e| e.task.cpu)
    }
}

// ── Host state ──────────────────────────────────────────────────

/// CPUs, queues and tasks of one host.
pub struct HostState {
    pub(crate) cpus: Vec<SimCpu>,
    pub(crate) dsqs: DsqTable,
    pub(crate) tasks: HashMap<Tid, TaskEntry>,
    pub(crate) scx: ScxState,
}

impl HostState {
    pub fn new(nr_cpus: usize, max_dsqs: usize) -> Self {
        Self {
            cpus: (0..nr_cpus as CpuId).map(SimCpu::new).collect(),
            dsqs: DsqTable::with_limit(max_dsqs),
            tasks: HashMap::new(),
            scx: ScxState::Disabled,
        }
    }

    #[inline]
    pub fn scx(&self) -> ScxState {
        self.scx
    }

    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    fn kfuncs(&mut self, cpu: CpuId) -> Kfuncs<'_> {
        Kfuncs {
            cpu,
            cpus: &mut self.cpus,
            dsqs: &mut self.dsqs,
            tasks: &self.tasks,
            inserted: false,
        }
    }

    /// Run the policy's `init`. On failure the policy's `exit` runs and the
    /// host stays disabled.
    ///
    /// Only opted-in threads are ever governed, so a policy must ask for
    /// `SWITCH_PARTIAL`; anything else is refused before `init`.
    pub fn enable(&mut self, ops: &dyn SchedOps) -> Result<(), ScxError> {
        let flags = ops.flags();
        if !flags.contains(OpsFlags::SWITCH_PARTIAL) {
            warn!("policy '{}' wants {:?}, refusing", ops.name(), flags);
            return Err(ScxError::Unsupported(flags));
        }
        self.scx = ScxState::Enabling;
        let result = ops.init(&mut self.kfuncs(0));
        match result {
            Ok(()) => {
                self.scx = ScxState::Enabled;
                Ok(())
            }
            Err(err) => {
                self.dsqs.clear();
                self.scx = ScxState::Disabled;
                ops.exit(&ExitInfo {
                    kind: ExitKind::Error,
                    reason: format!("init failed: {}", err),
                });
                Err(err)
            }
        }
    }

    /// Begin detaching: the policy's `exit` runs and every queue is dropped.
    ///
    /// Tasks stay in the table (their owners still hold handles) but are
    /// no longer scheduled; they run unmanaged until they exit.
    pub fn disable(&mut self, ops: &dyn SchedOps, info: &ExitInfo) {
        if matches!(self.scx, ScxState::Disabled | ScxState::Disabling) {
            return;
        }
        self.scx = ScxState::Disabling;
        ops.exit(info);
        let stranded = self.dsqs.clear();
        if !stranded.is_empty() {
            debug!("detach: releasing {} queued tasks", stranded.len());
        }
        for cpu in &mut self.cpus {
            cpu.current = None;
            cpu.prev = None;
            cpu.preempt = false;
            while cpu.local.pop_first(|_| true).is_some() {}
        }
        for entry in self.tasks.values_mut() {
            entry.state = TaskState::Sleeping;
            entry.slice_deadline = None;
        }
        self.scx = ScxState::Disabled;
    }

    /// Register a new task. It starts out sleeping; call [`HostState::wake`].
    pub fn add_task(&mut self, entry: TaskEntry) -> Result<(), ScxError> {
        if self.scx != ScxState::Enabled {
            return Err(ScxError::NotEnabled);
        }
        if entry.affinity.first(self.nr_cpus()).is_none() {
            return Err(ScxError::InvalidCpu(entry.task.cpu));
        }
        self.tasks.insert(entry.task.tid, entry);
        Ok(())
    }

    pub fn task(&self, tid: Tid) -> Option<&TaskEntry> {
        self.tasks.get(&tid)
    }

    pub fn task_mut(&mut self, tid: Tid) -> Option<&mut TaskEntry> {
        self.tasks.get_mut(&tid)
    }

    /// `enqueue` with the fallback for a policy that inserted nothing.
    fn enqueue(&mut self, ops: &dyn SchedOps, task: Task, flags: EnqFlags) {
        let inserted = {
            let mut scx = self.kfuncs(task.cpu);
            ops.enqueue(&mut scx, &task, flags);
            scx.inserted
        };
        if !inserted {
            warn!("{}: enqueue left task {} unqueued, using local queue", ops.name(), task.tid);
            if let Some(cpu) = self.cpus.get_mut(task.cpu as usize) {
                cpu.local.push(QueuedTask { tid: task.tid, slice: SLICE_DFL }, flags);
            }
        }
    }

    /// A sleeping task becomes runnable: `select_cpu`, then `enqueue`.
    pub fn wake(&mut self, ops: &dyn SchedOps, tid: Tid) -> Result<(), ScxError> {
        if self.scx != ScxState::Enabled {
            return Err(ScxError::NotEnabled);
        }
        let nr_cpus = self.nr_cpus();
        let entry = self.tasks.get(&tid).ok_or(ScxError::UnknownTask(tid))?;
        if entry.state != TaskState::Sleeping {
            return Ok(());
        }
        let affinity = entry.affinity;
        let mut task = entry.task;
        let prev_cpu = if (task.cpu as usize) < nr_cpus { task.cpu } else { 0 };

        let picked = ops.select_cpu(&mut self.kfuncs(prev_cpu), &task, prev_cpu, EnqFlags::WAKEUP);
        task.cpu = if (picked as usize) < nr_cpus && affinity.contains(picked) {
            picked
        } else {
            affinity.first(nr_cpus).ok_or(ScxError::InvalidCpu(picked))?
        };

        if let Some(entry) = self.tasks.get_mut(&tid) {
            entry.task = task;
            entry.state = TaskState::Runnable;
        }
        self.enqueue(ops, task, EnqFlags::WAKEUP);

        for cpu in self.cpus.iter_mut() {
            if cpu.is_idle() && affinity.contains(cpu.id) {
                cpu.kicked = true;
            }
        }
        Ok(())
    }

    /// The running task `tid` gives up its CPU.
    pub fn switch_out(&mut self, ops: &dyn SchedOps, tid: Tid, why: SwitchOut) -> Result<(), ScxError> {
        let entry = self.tasks.get_mut(&tid).ok_or(ScxError::UnknownTask(tid))?;
        let TaskState::Running(cpu) = entry.state else {
            if why == SwitchOut::Exit {
                self.forget(tid);
            }
            return Ok(());
        };
        entry.slice_deadline = None;
        entry.need_resched = false;
        entry.state = match why {
            SwitchOut::Yield => TaskState::Runnable,
            SwitchOut::Sleep | SwitchOut::Exit => TaskState::Sleeping,
        };
        let task = entry.task;

        if let Some(sim) = self.cpus.get_mut(cpu as usize) {
            sim.current = None;
            sim.prev = Some(task);
            sim.preempt = false;
            sim.kicked = true;
        }

        ops.stopping(&mut self.kfuncs(cpu), &task, why == SwitchOut::Yield);

        match why {
            SwitchOut::Yield => self.enqueue(ops, task, EnqFlags::empty()),
            SwitchOut::Sleep => {}
            SwitchOut::Exit => self.forget(tid),
        }
        Ok(())
    }

    /// Drop every trace of `tid`.
    pub fn forget(&mut self, tid: Tid) {
        self.dsqs.remove_task(tid);
        for cpu in &mut self.cpus {
            cpu.local.remove(tid);
            if cpu.current == Some(tid) {
                cpu.current = None;
                cpu.kicked = true;
            }
        }
        self.tasks.remove(&tid);
    }

    /// Give an idle CPU something to run.
    ///
    /// Calls `dispatch` when the local queue is empty, then starts the head
    /// of the local queue. Returns the task now running, if any.
    pub fn balance(&mut self, ops: &dyn SchedOps, cpu: CpuId, now: Instant) -> Option<Tid> {
        if self.scx != ScxState::Enabled {
            return None;
        }
        let idx = cpu as usize;
        if self.cpus.get(idx)?.current.is_some() {
            return None;
        }
        let mut dispatched = false;
        loop {
            let Some(next) = self.cpus[idx].local.pop_first(|_| true) else {
                if dispatched {
                    return None;
                }
                dispatched = true;
                let prev = self.cpus[idx].prev.take();
                ops.dispatch(&mut self.kfuncs(cpu), cpu, prev.as_ref());
                continue;
            };
            let Some(entry) = self.tasks.get_mut(&next.tid) else {
                continue;
            };
            if entry.state != TaskState::Runnable {
                continue;
            }
            entry.state = TaskState::Running(cpu);
            entry.task.cpu = cpu;
            entry.slice = next.slice;
            entry.slice_deadline = Some(now + next.slice);
            entry.need_resched = false;
            let task = entry.task;
            self.cpus[idx].current = Some(task.tid);
            ops.running(&mut self.kfuncs(cpu), &task);
            return Some(task.tid);
        }
    }

    /// Flag `cpu`'s current task once its slice has run out.
    pub fn tick(&mut self, cpu: CpuId, now: Instant) {
        let Some(tid) = self.cpus.get(cpu as usize).and_then(|c| c.current) else {
            return;
        };
        if let Some(entry) = self.tasks.get_mut(&tid) {
            if entry.slice_deadline.is_some_and(|d| now >= d) {
                entry.need_resched = true;
            }
        }
    }

    /// Whether `tid` should give up its CPU at the next checkpoint.
    pub fn should_yield(&self, tid: Tid) -> bool {
        match self.tasks.get(&tid) {
            Some(entry) => match entry.state {
                TaskState::Running(cpu) => {
                    entry.need_resched
                        || self.cpus.get(cpu as usize).is_some_and(|c| c.preempt)
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Kick every idle CPU.
    pub fn kick_idle(&mut self) {
        for cpu in self.cpus.iter_mut().filter(|c| c.is_idle()) {
            cpu.kicked = true;
        }
    }

    /// Clear and return the kicked flag of every CPU.
    pub fn take_kicks(&mut self) -> Vec<CpuId> {
        self.cpus
            .iter_mut()
            .filter(|c| c.kicked)
            .map(|c| {
                c.kicked = false;
                c.id
            })
            .collect()
    }

    pub fn current(&self, cpu: CpuId) -> Option<Tid> {
        self.cpus.get(cpu as usize).and_then(|c| c.current)
    }

    pub fn nr_queued(&self, dsq: DsqId) -> Result<usize, ScxError> {
        self.dsqs.get(dsq).map(|q| q.len())
    }

    pub fn local_len(&self, cpu: CpuId) -> usize {
        self.cpus.get(cpu as usize).map_or(0, |c| c.local.len())
    }
}
