//! The simulated scheduler host.
//!
//! [`Host`] drives a [`SchedOps`] policy with one dispatcher thread per
//! simulated CPU. Real OS threads opt in through [`Host::attach_current`]
//! and from then on only execute user code while the host has them in the
//! `Running` state; every blocking point goes through their [`TaskHandle`],
//! which turns it into a switch-out the policy sees.
//!
//! All hooks run under one state lock. CPUs park on their own condvar and
//! are woken by kicks; tasks park on a shared condvar until they are picked.

mod cpu;
pub mod harness;
mod state;

pub use cpu::SimCpu;
pub use harness::Harness;
pub use state::{HostState, Kfuncs, ScxState, SwitchOut};

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::dsq::DEFAULT_MAX_DSQS;
use crate::ops::{ExitInfo, SchedOps, ScxError};
use crate::sync::Notify;
use crate::task::{alloc_tid, CpuId, CpuMask, Pid, Task, TaskEntry, TaskState, Tid, MAX_CPUS};

/// Host parameters.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub nr_cpus: usize,
    /// Dispatcher wake-up period when nothing kicks the CPU.
    pub tick: Duration,
    /// Cap on user-created dispatch queues.
    pub max_dsqs: usize,
    /// Where to publish the host state (`enabled`, ...), if anywhere.
    pub state_file: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 4,
            tick: Duration::from_millis(1),
            max_dsqs: DEFAULT_MAX_DSQS,
            state_file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("cpu count {0} out of range")]
    Cpus(usize),
    #[error("policy init failed: {0}")]
    Init(#[from] ScxError),
    #[error("failed to start dispatcher thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// What a thread supplies when it opts in.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub pid: Pid,
    pub name: String,
    pub affinity: CpuMask,
}

impl TaskSpec {
    pub fn new(pid: Pid, name: impl Into<String>) -> Self {
        Self { pid, name: name.into(), affinity: CpuMask::all() }
    }

    pub fn pinned(mut self, cpu: CpuId) -> Self {
        self.affinity = CpuMask::single(cpu);
        self
    }
}

/// A running host with a policy attached.
///
/// Dispatcher threads hold a reference to the host, so it stays alive until
/// [`Host::detach`] joins them.
pub struct Host {
    config: HostConfig,
    ops: Arc<dyn SchedOps>,
    state: Mutex<HostState>,
    cpu_signal: Vec<Condvar>,
    task_signal: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Host {
    /// Run the policy's `init` and start the dispatchers.
    pub fn attach(config: HostConfig, ops: Arc<dyn SchedOps>) -> Result<Arc<Host>, AttachError> {
        if config.nr_cpus == 0 || config.nr_cpus > MAX_CPUS {
            return Err(AttachError::Cpus(config.nr_cpus));
        }
        let host = Arc::new(Host {
            cpu_signal: (0..config.nr_cpus).map(|_| Condvar::new()).collect(),
            state: Mutex::new(HostState::new(config.nr_cpus, config.max_dsqs)),
            task_signal: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            config,
            ops,
        });

        {
            let mut st = host.state.lock();
            host.publish(ScxState::Enabling);
            if let Err(err) = st.enable(&*host.ops) {
                host.publish(ScxState::Disabled);
                return Err(err.into());
            }
            host.publish(st.scx());
        }
        info!(
            "host: policy '{}' enabled on {} cpus (tick {:?}, {:?})",
            host.ops.name(),
            host.config.nr_cpus,
            host.config.tick,
            host.ops.flags()
        );

        for cpu in 0..host.config.nr_cpus as CpuId {
            let worker = Arc::clone(&host);
            let spawned = thread::Builder::new()
                .name(format!("sim-cpu{}", cpu))
                .spawn(move || worker.cpu_loop(cpu));
            match spawned {
                Ok(handle) => host.threads.lock().push(handle),
                Err(err) => {
                    host.detach("dispatcher spawn failed");
                    return Err(AttachError::Spawn(err));
                }
            }
        }
        Ok(host)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn policy_name(&self) -> &str {
        self.ops.name()
    }

    pub fn scx_state(&self) -> ScxState {
        self.state.lock().scx()
    }

    pub fn is_enabled(&self) -> bool {
        self.scx_state() == ScxState::Enabled
    }

    fn publish(&self, scx: ScxState) {
        let Some(path) = &self.config.state_file else {
            return;
        };
        if let Err(err) = std::fs::write(path, format!("{}\n", scx.as_str())) {
            warn!("host: cannot write state file {}: {}", path.display(), err);
        }
    }

    /// Wake the dispatchers of every kicked CPU. Each dispatcher clears its
    /// own flag.
    fn flush_kicks(&self, st: &HostState) {
        for sim in st.cpus.iter().filter(|c| c.kicked) {
            if let Some(signal) = self.cpu_signal.get(sim.id as usize) {
                signal.notify_one();
            }
        }
    }

    fn cpu_loop(self: Arc<Self>, cpu: CpuId) {
        debug!("sim-cpu{}: dispatcher up", cpu);
        let idx = cpu as usize;
        let mut st = self.state.lock();
        while st.scx() == ScxState::Enabled {
            st.cpus[idx].kicked = false;
            let now = Instant::now();
            st.tick(cpu, now);
            if st.balance(&*self.ops, cpu, now).is_some() {
                self.task_signal.notify_all();
            }
            self.flush_kicks(&st);
            if !st.cpus[idx].kicked {
                self.cpu_signal[idx].wait_for(&mut st, self.config.tick);
            }
        }
        debug!("sim-cpu{}: dispatcher down", cpu);
    }

    /// Park the caller until the host runs `tid` or stops managing tasks.
    fn park(&self, st: &mut MutexGuard<'_, HostState>, tid: Tid) {
        while st.scx() == ScxState::Enabled {
            match st.task(tid).map(|e| e.state) {
                Some(TaskState::Running(_)) | None => return,
                _ => self.task_signal.wait(st),
            }
        }
    }

    /// Opt the calling thread in. Returns once the host first runs it.
    pub fn attach_current(self: &Arc<Self>, spec: TaskSpec) -> Result<TaskHandle, ScxError> {
        let tid = alloc_tid();
        let mut st = self.state.lock();
        let first = spec.affinity.first(st.nr_cpus()).unwrap_or(0);
        let task = Task { pid: spec.pid, tid, cpu: first };
        st.add_task(TaskEntry::new(task, &spec.name, spec.affinity))?;
        st.wake(&*self.ops, tid)?;
        self.flush_kicks(&st);
        self.park(&mut st, tid);
        debug!("host: task {} ({}) opted in", tid, spec.name);
        Ok(TaskHandle { host: Arc::clone(self), task })
    }

    /// Detach the policy: run its `exit`, release every parked task and
    /// join the dispatchers. Later calls do nothing.
    pub fn detach(&self, reason: &str) {
        {
            let mut st = self.state.lock();
            if st.scx() == ScxState::Enabled {
                self.publish(ScxState::Disabling);
                st.disable(&*self.ops, &ExitInfo::unregistered(reason));
                self.publish(st.scx());
                info!("host: policy '{}' detached ({})", self.ops.name(), reason);
            }
            self.task_signal.notify_all();
            for signal in &self.cpu_signal {
                signal.notify_all();
            }
        }
        let current = thread::current().id();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("host: a dispatcher thread panicked");
            }
        }
    }
}

/// A thread's membership in the host. Dropping it exits the task.
pub struct TaskHandle {
    host: Arc<Host>,
    task: Task,
}

impl TaskHandle {
    pub fn task(&self) -> Task {
        self.task
    }

    pub fn tid(&self) -> Tid {
        self.task.tid
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Block outside the scheduler while `wait` runs, then get scheduled
    /// again before returning its result.
    ///
    /// After detach, `wait` simply runs; the thread is unmanaged.
    pub fn block<R>(&self, wait: impl FnOnce() -> R) -> R {
        let host = &*self.host;
        {
            let mut st = host.state.lock();
            if st.scx() == ScxState::Enabled {
                if let Err(err) = st.switch_out(&*host.ops, self.task.tid, SwitchOut::Sleep) {
                    warn!("task {}: switch-out failed: {}", self.task.tid, err);
                }
                host.flush_kicks(&st);
            }
        }
        let out = wait();
        let mut st = host.state.lock();
        if st.scx() == ScxState::Enabled {
            if let Err(err) = st.wake(&*host.ops, self.task.tid) {
                warn!("task {}: wake failed: {}", self.task.tid, err);
            }
            host.flush_kicks(&st);
            host.park(&mut st, self.task.tid);
        }
        out
    }

    /// Sleep for up to `period`, returning early once `stop()` holds after a
    /// notification on `notify`. Returns `stop()`.
    pub fn sleep(&self, period: Duration, notify: &Notify, stop: impl FnMut() -> bool) -> bool {
        self.block(|| notify.wait_until(stop, period))
    }

    /// Give up the CPU but stay runnable.
    pub fn yield_now(&self) {
        let host = &*self.host;
        let mut st = host.state.lock();
        if st.scx() != ScxState::Enabled {
            return;
        }
        if let Err(err) = st.switch_out(&*host.ops, self.task.tid, SwitchOut::Yield) {
            warn!("task {}: yield failed: {}", self.task.tid, err);
            return;
        }
        host.flush_kicks(&st);
        host.park(&mut st, self.task.tid);
    }

    /// Whether the slice ran out or a preempting kick arrived.
    pub fn need_resched(&self) -> bool {
        self.host.state.lock().should_yield(self.task.tid)
    }

    /// Yield if the host asked for it.
    pub fn checkpoint(&self) {
        if self.need_resched() {
            self.yield_now();
        }
    }

    /// Ask idle CPUs to run `dispatch` again.
    pub fn kick_idle(&self) {
        let host = &*self.host;
        let mut st = host.state.lock();
        st.kick_idle();
        host.flush_kicks(&st);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        let host = &*self.host;
        let mut st = host.state.lock();
        if st.scx() == ScxState::Enabled {
            if let Err(err) = st.switch_out(&*host.ops, self.task.tid, SwitchOut::Exit) {
                debug!("task {}: exit: {}", self.task.tid, err);
            }
            host.flush_kicks(&st);
        } else {
            st.forget(self.task.tid);
        }
        host.task_signal.notify_all();
    }
}
