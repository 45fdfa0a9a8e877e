//! The gate policy on the threaded host, with a hand-rolled monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gatesched_kernel::gate::{GateMap, GATE_KEY};
use gatesched_kernel::host::{Host, HostConfig, TaskSpec};
use gatesched_kernel::ops::ScxError;
use gatesched_kernel::policy::{GateMode, GatePolicy, PolicyConfig};
use gatesched_kernel::sync::Notify;
use gatesched_kernel::task::{alloc_pid, Pid};
use gatesched_kernel::ScxState;

fn attach(nr_cpus: usize) -> (Arc<Host>, Arc<GateMap>) {
    let map = Arc::new(GateMap::new());
    let policy = Arc::new(GatePolicy::new(Arc::clone(&map), PolicyConfig::default()));
    let config = HostConfig { nr_cpus, ..HostConfig::default() };
    (Host::attach(config, policy).unwrap(), map)
}

#[test]
fn workers_and_monitor_alternate_without_violations() {
    let (host, map) = attach(3);
    let stop = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());

    let monitor = {
        let host = Arc::clone(&host);
        let map = Arc::clone(&map);
        let stop = Arc::clone(&stop);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let task = host.attach_current(TaskSpec::new(Pid(1), "monitor").pinned(0)).unwrap();
            map.register_monitor(task.tid()).unwrap();
            ready_tx.send(()).unwrap();
            let mut last = 0;
            let mut records = 0u64;
            while !stop.load(Ordering::SeqCst) {
                let state = map.lookup(GATE_KEY).unwrap();
                if state.seq != last {
                    last = state.seq;
                    records += 1;
                    map.clear_pending(state.seq).unwrap();
                    task.kick_idle();
                    continue;
                }
                task.block(|| map.wait_for_change(last, Duration::from_millis(1)));
            }
            records
        });
        ready_rx.recv().unwrap();
        handle
    };

    let workers: Vec<_> = (0..6)
        .map(|i| {
            let host = Arc::clone(&host);
            let stop = Arc::clone(&stop);
            let wake = Arc::clone(&wake);
            let pid = alloc_pid();
            thread::spawn(move || {
                let task = host.attach_current(TaskSpec::new(pid, format!("w{}", i))).unwrap();
                let mut rounds = 0u32;
                while !task.sleep(Duration::from_millis(2), &wake, || stop.load(Ordering::SeqCst)) {
                    rounds += 1;
                }
                rounds
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(500));
    stop.store(true, Ordering::SeqCst);
    wake.notify();
    map.notify();
    let state = map.lookup(GATE_KEY).unwrap();
    host.detach("test done");

    let rounds: u32 = workers.into_iter().map(|w| w.join().unwrap()).sum();
    let records = monitor.join().unwrap();

    assert!(rounds > 0);
    assert!(records > 0);
    assert!(state.seq > 0);
    assert_eq!(state.violations, 0, "{:?}", state);
    assert!(state.monitor_runs > 0);
    assert_eq!(host.scx_state(), ScxState::Disabled);
}

#[test]
fn opting_in_after_detach_is_refused() {
    let (host, _) = attach(1);
    host.detach("early");
    host.detach("twice is fine");
    assert!(matches!(
        host.attach_current(TaskSpec::new(Pid(5), "late")),
        Err(ScxError::NotEnabled)
    ));
}

#[test]
fn state_file_tracks_attach_and_detach() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state");
    let map = Arc::new(GateMap::new());
    let policy = Arc::new(GatePolicy::new(map, PolicyConfig::default()));
    let config = HostConfig { nr_cpus: 2, state_file: Some(path.clone()), ..HostConfig::default() };
    let host = Host::attach(config, policy).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "enabled");
    assert_eq!(host.policy_name(), "gate");
    host.detach("done");
    assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "disabled");
}

#[test]
fn busy_task_gives_up_the_cpu_at_a_checkpoint() {
    let map = Arc::new(GateMap::new());
    let policy_config = PolicyConfig {
        slice: Duration::from_millis(2),
        gate: GateMode::Disabled,
        ..PolicyConfig::default()
    };
    let policy = Arc::new(GatePolicy::new(map, policy_config));
    let host = Host::attach(HostConfig { nr_cpus: 1, ..HostConfig::default() }, policy).unwrap();
    let other_ran = Arc::new(AtomicBool::new(false));

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let busy = {
        let host = Arc::clone(&host);
        let other_ran = Arc::clone(&other_ran);
        thread::spawn(move || {
            let task = host.attach_current(TaskSpec::new(alloc_pid(), "busy")).unwrap();
            ready_tx.send(()).unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while !other_ran.load(Ordering::SeqCst) && Instant::now() < deadline {
                task.checkpoint();
            }
            other_ran.load(Ordering::SeqCst)
        })
    };
    ready_rx.recv().unwrap();

    // Only one CPU: this opt-in returns once the busy task has yielded.
    let task = host.attach_current(TaskSpec::new(alloc_pid(), "other")).unwrap();
    other_ran.store(true, Ordering::SeqCst);
    drop(task);

    assert!(busy.join().unwrap());
    host.detach("test done");
}
