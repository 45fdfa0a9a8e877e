//! One verification run, end to end.
//!
//! Order of events:
//!
//!   1. attach the policy (fatal on failure) and probe the state file
//!   2. start the monitor and wait for it to register
//!   3. start the workload tree (and the renderer, if asked)
//!   4. wait for the run time to elapse or a shutdown request
//!   5. stop the region, detach the policy, join every thread
//!   6. persist the activity log and compute the summary, once

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gatesched_kernel::gate::{GateMap, GATE_KEY};
use gatesched_kernel::host::{AttachError, Host, HostConfig};
use gatesched_kernel::policy::{GatePolicy, PolicyConfig};
use gatesched_kernel::task::{alloc_pid, CpuId};
use log::{error, info, warn};
use thiserror::Error;

use crate::monitor::{Monitor, MonitorConfig, MonitorExit, MonitorReport};
use crate::region::{RegionError, SharedRegion, DEFAULT_CAPACITY};
use crate::render::Renderer;
use crate::shutdown::Shutdown;
use crate::tree::{TreeConfig, TreeReport, WorkloadError, WorkloadTree};
use crate::verify::{Summary, VerifyLog};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("monitor cpu {cpu} out of range (host has {nr_cpus} cpus)")]
    MonitorCpu { cpu: CpuId, nr_cpus: usize },
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error("shared region: {0}")]
    Region(#[from] RegionError),
    #[error("workload: {0}")]
    Workload(#[from] WorkloadError),
    #[error("monitor failed to start: {0:?}")]
    Monitor(MonitorExit),
    #[error("cannot spawn {0} thread: {1}")]
    Spawn(&'static str, #[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub policy: PolicyConfig,
    pub host: HostConfig,
    pub monitor_cpu: CpuId,
    pub monitor_poll: Duration,
    pub pin_monitor: bool,
    pub verify_log: PathBuf,
    pub activity_log: Option<PathBuf>,
    /// Stop after this long; `None` runs until shutdown is triggered.
    pub duration: Option<Duration>,
    pub tree: TreeConfig,
    pub capacity: usize,
    pub display: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            host: HostConfig::default(),
            monitor_cpu: 0,
            monitor_poll: Duration::from_millis(1),
            pin_monitor: false,
            verify_log: PathBuf::from("verify.log"),
            activity_log: None,
            duration: None,
            tree: TreeConfig::default(),
            capacity: DEFAULT_CAPACITY,
            display: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub summary: Summary,
    pub tree: TreeReport,
    pub monitor: MonitorReport,
    /// Lines in the verification log.
    pub verify_records: u64,
    /// Records in the activity log (persisted or not).
    pub activity_records: usize,
}

/// How often the top level re-checks the tree while waiting.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Run one session. `shutdown` may be triggered from a signal handler.
pub fn run_session(config: SessionConfig, shutdown: Arc<Shutdown>) -> Result<SessionReport, SessionError> {
    let nr_cpus = config.host.nr_cpus;
    if config.monitor_cpu as usize >= nr_cpus {
        return Err(SessionError::MonitorCpu { cpu: config.monitor_cpu, nr_cpus });
    }

    let region = Arc::new(SharedRegion::new(config.capacity)?);
    let gate = Arc::new(GateMap::new());
    let policy = Arc::new(GatePolicy::new(Arc::clone(&gate), config.policy.clone()));
    let host = Host::attach(config.host.clone(), policy)?;
    probe_state(&config.host);

    let verify = match VerifyLog::create(&config.verify_log) {
        Ok(log) => log,
        Err(err) => {
            warn!("cannot open {}: {}; continuing without it", config.verify_log.display(), err);
            VerifyLog::disabled()
        }
    };

    // Monitor first, so the gate is armed before any worker runs.
    let mut monitor_config = MonitorConfig::new(config.monitor_cpu, alloc_pid());
    monitor_config.poll = config.monitor_poll;
    monitor_config.pin_thread = config.pin_monitor;
    let (ready_tx, ready_rx) = mpsc::channel();
    let monitor = Monitor::new(monitor_config, Arc::clone(&gate), Arc::clone(&host), verify, Arc::clone(&shutdown))
        .notify_ready(ready_tx);
    let monitor_thread = match thread::Builder::new()
        .name(String::from("monitor"))
        .spawn(move || monitor.run())
    {
        Ok(handle) => handle,
        Err(err) => {
            host.detach("monitor spawn failed");
            return Err(SessionError::Spawn("monitor", err));
        }
    };
    match ready_rx.recv() {
        Ok(Ok(_)) => {}
        Ok(Err(exit)) => {
            host.detach("monitor failed");
            let _ = monitor_thread.join();
            return Err(SessionError::Monitor(exit));
        }
        // The monitor thread died before reporting; its join below says why.
        Err(_) => {}
    }

    let tree = match WorkloadTree::new(config.tree.clone(), Arc::clone(&region))
        .with_host(Arc::clone(&host))
        .spawn()
    {
        Ok(tree) => tree,
        Err(err) => {
            shutdown.trigger();
            host.detach("workload failed to start");
            let _ = monitor_thread.join();
            return Err(err.into());
        }
    };

    let renderer = if config.display {
        let renderer = Renderer::new(Arc::clone(&region), config.tree.shape());
        let shutdown = Arc::clone(&shutdown);
        match thread::Builder::new()
            .name(String::from("render"))
            .spawn(move || renderer.run(&shutdown))
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("cannot start display: {}", err);
                None
            }
        }
    } else {
        None
    };

    info!("session: running{}", match config.duration {
        Some(d) => format!(" for {:?}", d),
        None => String::from(" until interrupted"),
    });
    let deadline = config.duration.map(|d| Instant::now() + d);
    shutdown.wait_until(deadline, WAIT_POLL, || !region.is_running());

    // Teardown: stop everyone, release parked tasks, then join.
    shutdown.trigger();
    region.stop();
    host.detach("loader exiting");

    let tree_result = tree.join();
    let monitor_report = join_monitor(monitor_thread);
    if let Some(handle) = renderer {
        let _ = handle.join();
    }

    let finalized = shutdown.finalize(|| {
        let activity_records = region.len();
        if let Some(path) = &config.activity_log {
            match region.persist(path) {
                Ok(n) => info!("activity log: {} records -> {}", n, path.display()),
                Err(err) => error!("cannot write activity log {}: {}", path.display(), err),
            }
        }
        let summary = match gate.lookup(GATE_KEY) {
            Ok(state) => Summary::from(&state),
            Err(err) => {
                warn!("gate record unavailable at shutdown: {}", err);
                Summary::default()
            }
        };
        (summary, activity_records)
    });
    let (summary, activity_records) = finalized.unwrap_or_default();

    let tree = tree_result?;
    Ok(SessionReport {
        summary,
        tree,
        verify_records: monitor_report.records,
        monitor: monitor_report,
        activity_records,
    })
}

fn probe_state(host: &HostConfig) {
    let Some(path) = &host.state_file else {
        return;
    };
    match hostal::probe::read_state(path) {
        Ok(state) if state == "enabled" => info!("scheduler state: {}", state),
        Ok(state) => warn!("policy attached but state is '{}'", state),
        Err(err) => warn!("cannot read scheduler state {}: {}", path.display(), err),
    }
}

fn join_monitor(handle: JoinHandle<MonitorReport>) -> MonitorReport {
    match handle.join() {
        Ok(report) => report,
        Err(_) => {
            error!("monitor thread panicked");
            MonitorReport {
                tid: None,
                records: 0,
                last_seq: 0,
                stale_clears: 0,
                exit: MonitorExit::Stopped,
            }
        }
    }
}
