//! Property tests for the gate policy under random schedules.

use std::sync::Arc;
use std::time::Duration;

use gatesched_kernel::gate::{GateMap, GATE_KEY};
use gatesched_kernel::host::Harness;
use gatesched_kernel::policy::{GateMode, GatePolicy, PolicyConfig};
use gatesched_kernel::task::{CpuMask, Pid, TaskState, Tid};
use proptest::prelude::*;

const NR_CPUS: usize = 3;
const MONITOR_CPU: u32 = 0;
const WORKERS: usize = 5;

#[derive(Debug, Clone)]
enum Step {
    Schedule(u32),
    Yield(usize),
    Sleep(usize),
    Wake(usize),
    /// The monitor, if running, consumes the record and blocks.
    MonitorPass,
    WakeMonitor,
    Tick,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0..NR_CPUS as u32).prop_map(Step::Schedule),
        2 => (0..WORKERS).prop_map(Step::Yield),
        2 => (0..WORKERS).prop_map(Step::Sleep),
        2 => (0..WORKERS).prop_map(Step::Wake),
        2 => Just(Step::MonitorPass),
        1 => Just(Step::WakeMonitor),
        1 => Just(Step::Tick),
    ]
}

struct World {
    h: Harness,
    map: Arc<GateMap>,
    monitor: Tid,
    workers: Vec<Tid>,
    /// Non-monitor switch-outs since registration.
    closes: u64,
}

impl World {
    fn new(gate: GateMode) -> Self {
        let map = Arc::new(GateMap::new());
        let config = PolicyConfig { gate, ..PolicyConfig::default() };
        let mut h = Harness::new(NR_CPUS, Arc::new(GatePolicy::new(Arc::clone(&map), config))).unwrap();
        let monitor = h.spawn(Pid(1), "monitor", CpuMask::single(MONITOR_CPU)).unwrap();
        map.register_monitor(monitor).unwrap();
        let workers = (0..WORKERS)
            .map(|i| h.spawn(Pid(10 + (i as u32) / 2), "worker", CpuMask::all()).unwrap())
            .collect();
        Self { h, map, monitor, workers, closes: 0 }
    }

    fn is_running(&self, tid: Tid) -> bool {
        matches!(self.h.task_state(tid), Some(TaskState::Running(_)))
    }

    fn apply(&mut self, step: &Step) {
        match *step {
            Step::Schedule(cpu) => {
                self.h.schedule(cpu);
            }
            Step::Yield(i) => {
                let tid = self.workers[i];
                if self.is_running(tid) {
                    self.closes += 1;
                }
                self.h.yield_task(tid).unwrap();
            }
            Step::Sleep(i) => {
                let tid = self.workers[i];
                if self.is_running(tid) {
                    self.closes += 1;
                }
                self.h.sleep_task(tid).unwrap();
            }
            Step::Wake(i) => self.h.wake_task(self.workers[i]).unwrap(),
            Step::MonitorPass => {
                if self.is_running(self.monitor) {
                    let state = self.map.lookup(GATE_KEY).unwrap();
                    if state.pending {
                        assert!(self.map.clear_pending(state.seq).unwrap());
                    }
                    self.h.sleep_task(self.monitor).unwrap();
                }
            }
            Step::WakeMonitor => self.h.wake_task(self.monitor).unwrap(),
            Step::Tick => self.h.advance(Duration::from_millis(5)),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn enforced_gate_never_admits_a_worker(steps in prop::collection::vec(step(), 1..200)) {
        let mut world = World::new(GateMode::Enforced);
        for s in &steps {
            world.apply(s);
            let state = world.map.lookup(GATE_KEY).unwrap();
            prop_assert_eq!(state.violations, 0, "after {:?}", s);
        }
        let state = world.map.lookup(GATE_KEY).unwrap();
        prop_assert_eq!(state.seq, world.closes);
        prop_assert!(state.seq == 0 || state.last_switched_out.0 .0 >= 10);
    }

    #[test]
    fn seq_counts_worker_switch_outs_in_both_modes(steps in prop::collection::vec(step(), 1..200)) {
        let mut world = World::new(GateMode::Disabled);
        for s in &steps {
            world.apply(s);
        }
        let state = world.map.lookup(GATE_KEY).unwrap();
        prop_assert_eq!(state.seq, world.closes);
    }

    #[test]
    fn stale_clears_never_reopen_a_newer_close(extra in 1u64..20) {
        let map = GateMap::new();
        let cell = map.cell().unwrap();
        let first = cell.close(Pid(10), Tid(100));
        for _ in 0..extra {
            cell.close(Pid(11), Tid(101));
        }
        prop_assert!(!map.clear_pending(first).unwrap());
        let state = map.lookup(GATE_KEY).unwrap();
        prop_assert!(state.pending);
        prop_assert_eq!(state.seq, first + extra);
        prop_assert!(map.clear_pending(state.seq).unwrap());
        prop_assert!(!map.lookup(GATE_KEY).unwrap().pending);
    }
}
