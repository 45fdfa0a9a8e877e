//! The gate policy.
//!
//! One shared FIFO for ordinary tasks and one reserved FIFO for the monitor.
//! Every switch-out of an ordinary task closes the gate; while it is closed
//! CPUs only pull from the reserved queue, so the next thing to start is the
//! monitor. The monitor reopens the gate through the map once it has logged
//! the switch.
//!
//! Before a monitor registers, the gate is inert and this is a plain global
//! FIFO scheduler.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;

use crate::gate::GateMap;
use crate::host::Kfuncs;
use crate::ops::{DsqId, EnqFlags, ExitInfo, ExitKind, KickFlags, SchedOps, ScxError, SLICE_DFL};
use crate::task::{CpuId, Task};

/// Shared queue for every non-monitor task.
pub const SHARED_DSQ: DsqId = DsqId(0);
/// Reserved queue the monitor is dispatched from.
pub const MONITOR_DSQ: DsqId = DsqId(1);

/// Whether `dispatch` honors a closed gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    #[default]
    Enforced,
    /// Dispatch ignores the gate; `running` still counts violations.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub name: String,
    pub slice: Duration,
    pub shared_dsq: DsqId,
    pub monitor_dsq: DsqId,
    pub gate: GateMode,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            name: String::from("gate"),
            slice: SLICE_DFL,
            shared_dsq: SHARED_DSQ,
            monitor_dsq: MONITOR_DSQ,
            gate: GateMode::Enforced,
        }
    }
}

pub struct GatePolicy {
    gate: Arc<GateMap>,
    config: PolicyConfig,
}

impl GatePolicy {
    pub fn new(gate: Arc<GateMap>, config: PolicyConfig) -> Self {
        Self { gate, config }
    }

    pub fn gate(&self) -> &Arc<GateMap> {
        &self.gate
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

impl SchedOps for GatePolicy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn init(&self, scx: &mut Kfuncs<'_>) -> Result<(), ScxError> {
        scx.create_dsq(self.config.shared_dsq)?;
        scx.create_dsq(self.config.monitor_dsq)?;
        Ok(())
    }

    fn select_cpu(&self, _scx: &mut Kfuncs<'_>, _task: &Task, prev_cpu: CpuId, _wake_flags: EnqFlags) -> CpuId {
        prev_cpu
    }

    fn enqueue(&self, scx: &mut Kfuncs<'_>, task: &Task, enq_flags: EnqFlags) {
        let is_monitor = self
            .gate
            .cell()
            .map(|cell| cell.monitor() == Some(task.id()))
            .unwrap_or(false);
        let target = if is_monitor { self.config.monitor_dsq } else { self.config.shared_dsq };

        if let Err(err) = scx.dsq_insert(task, target, self.config.slice, enq_flags) {
            warn!("{}: insert into {} failed: {}", self.config.name, target, err);
            if target != self.config.shared_dsq {
                let _ = scx.dsq_insert(task, self.config.shared_dsq, self.config.slice, enq_flags);
            }
        }
    }

    fn dispatch(&self, scx: &mut Kfuncs<'_>, _cpu: CpuId, _prev: Option<&Task>) {
        let Ok(cell) = self.gate.cell() else {
            scx.dsq_move_to_local(self.config.shared_dsq);
            return;
        };

        if cell.is_pending() && cell.monitor().is_some() {
            if scx.dsq_move_to_local(self.config.monitor_dsq) {
                return;
            }
            cell.note_gate_empty();
            if self.config.gate == GateMode::Enforced {
                return;
            }
            scx.dsq_move_to_local(self.config.shared_dsq);
            return;
        }

        if !scx.dsq_move_to_local(self.config.monitor_dsq) {
            scx.dsq_move_to_local(self.config.shared_dsq);
        }
    }

    fn running(&self, _scx: &mut Kfuncs<'_>, task: &Task) {
        let Ok(cell) = self.gate.cell() else {
            return;
        };
        let Some(monitor) = cell.monitor() else {
            return;
        };
        if !cell.is_pending() {
            return;
        }
        if task.id() == monitor {
            cell.note_monitor_run();
        } else {
            cell.note_violation();
        }
    }

    fn stopping(&self, scx: &mut Kfuncs<'_>, task: &Task, _runnable: bool) {
        let Ok(cell) = self.gate.cell() else {
            return;
        };
        match cell.monitor() {
            Some(monitor) if monitor != task.id() => {}
            _ => return,
        }
        cell.close(task.pid, task.tid);
        self.gate.notify();
        let cpu = scx.task_cpu(task);
        scx.kick_cpu(cpu, KickFlags::empty());
    }

    fn exit(&self, info: &ExitInfo) {
        match info.kind {
            ExitKind::Unregistered => info!("{}: unregistered ({})", self.config.name, info.reason),
            ExitKind::Error => warn!("{}: exiting on error: {}", self.config.name, info.reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GATE_KEY;
    use crate::host::Harness;
    use crate::task::{CpuMask, Pid, TaskState};

    fn harness(nr_cpus: usize, gate: GateMode) -> (Harness, Arc<GateMap>) {
        let map = Arc::new(GateMap::new());
        let config = PolicyConfig { gate, ..PolicyConfig::default() };
        let policy = Arc::new(GatePolicy::new(Arc::clone(&map), config));
        (Harness::new(nr_cpus, policy).unwrap(), map)
    }

    #[test]
    fn init_creates_both_queues() {
        let (h, _) = harness(1, GateMode::Enforced);
        assert_eq!(h.nr_queued(SHARED_DSQ), Ok(0));
        assert_eq!(h.nr_queued(MONITOR_DSQ), Ok(0));
    }

    #[test]
    fn init_failure_is_reported() {
        let map = Arc::new(GateMap::new());
        let policy = Arc::new(GatePolicy::new(map, PolicyConfig::default()));
        assert!(matches!(Harness::with_limit(1, 1, policy), Err(ScxError::NoSpace(1))));
    }

    #[test]
    fn gate_is_inert_until_monitor_registers() {
        let (mut h, map) = harness(1, GateMode::Enforced);
        let a = h.spawn(Pid(10), "a", CpuMask::all()).unwrap();
        h.schedule(0);
        h.sleep_task(a).unwrap();
        let state = map.lookup(GATE_KEY).unwrap();
        assert_eq!(state.seq, 0);
        assert!(!state.pending);
        assert_eq!(state.violations, 0);
    }

    #[test]
    fn closed_gate_only_admits_the_monitor() {
        let (mut h, map) = harness(2, GateMode::Enforced);
        let mon = h.spawn(Pid(1), "monitor", CpuMask::single(1)).unwrap();
        map.register_monitor(mon).unwrap();
        assert_eq!(h.schedule(1), Some(mon));
        h.sleep_task(mon).unwrap();

        let a = h.spawn(Pid(10), "a", CpuMask::single(0)).unwrap();
        let b = h.spawn(Pid(10), "b", CpuMask::single(0)).unwrap();
        assert_eq!(h.schedule(0), Some(a));
        h.sleep_task(a).unwrap();

        let state = map.lookup(GATE_KEY).unwrap();
        assert!(state.pending);
        assert_eq!(state.seq, 1);
        assert_eq!(state.last_switched_out, (Pid(10), a));

        // b is runnable but the gate is closed.
        assert_eq!(h.schedule(0), None);
        assert_eq!(h.nr_queued(SHARED_DSQ), Ok(1));
        assert_eq!(map.lookup(GATE_KEY).unwrap().gate_empty_while_closed, 1);

        h.wake_task(mon).unwrap();
        assert_eq!(h.nr_queued(MONITOR_DSQ), Ok(1));
        assert_eq!(h.schedule(1), Some(mon));
        assert_eq!(map.lookup(GATE_KEY).unwrap().monitor_runs, 1);

        // Monitor's own switch-out does not close the gate.
        assert!(map.clear_pending(1).unwrap());
        h.sleep_task(mon).unwrap();
        assert_eq!(map.lookup(GATE_KEY).unwrap().seq, 1);

        assert_eq!(h.schedule(0), Some(b));
        let state = map.lookup(GATE_KEY).unwrap();
        assert_eq!(state.violations, 0);
        assert_eq!(h.task_state(b), Some(TaskState::Running(0)));
    }

    #[test]
    fn disabled_gate_lets_tasks_through_and_counts_violations() {
        let (mut h, map) = harness(2, GateMode::Disabled);
        let mon = h.spawn(Pid(1), "monitor", CpuMask::single(1)).unwrap();
        map.register_monitor(mon).unwrap();
        h.schedule(1);
        h.sleep_task(mon).unwrap();

        let a = h.spawn(Pid(10), "a", CpuMask::single(0)).unwrap();
        let b = h.spawn(Pid(10), "b", CpuMask::single(0)).unwrap();
        assert_eq!(h.schedule(0), Some(a));
        h.sleep_task(a).unwrap();
        assert_eq!(h.schedule(0), Some(b));

        let state = map.lookup(GATE_KEY).unwrap();
        assert!(state.pending);
        assert_eq!(state.violations, 1);
        assert_eq!(state.gate_empty_while_closed, 1);
    }

    #[test]
    fn missing_gate_entry_falls_back_to_shared_queue() {
        let (mut h, map) = harness(1, GateMode::Enforced);
        let mon = h.spawn(Pid(1), "monitor", CpuMask::all()).unwrap();
        map.register_monitor(mon).unwrap();
        h.schedule(0);
        h.sleep_task(mon).unwrap();
        map.delete(GATE_KEY).unwrap();

        // The monitor is no longer recognized and lands on the shared queue.
        h.wake_task(mon).unwrap();
        assert_eq!(h.nr_queued(SHARED_DSQ), Ok(1));
        let a = h.spawn(Pid(10), "a", CpuMask::all()).unwrap();
        assert_eq!(h.schedule(0), Some(mon));
        h.sleep_task(mon).unwrap();
        assert_eq!(h.schedule(0), Some(a));
        h.sleep_task(a).unwrap();
        assert!(map.lookup(GATE_KEY).is_err());
    }

    #[test]
    fn stopping_kicks_the_cpu_it_left() {
        let (mut h, map) = harness(2, GateMode::Enforced);
        let mon = h.spawn(Pid(1), "monitor", CpuMask::single(0)).unwrap();
        map.register_monitor(mon).unwrap();
        h.schedule(0);
        let a = h.spawn(Pid(10), "a", CpuMask::single(1)).unwrap();
        h.schedule(1);
        h.take_kicks();
        h.yield_task(a).unwrap();
        assert!(h.take_kicks().contains(&1));
        assert_eq!(map.lookup(GATE_KEY).unwrap().seq, 1);
    }
}
