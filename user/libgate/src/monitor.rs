//! The gate monitor.
//!
//! A single task pinned to one CPU. It registers itself in the gate map,
//! then loops: read the record; for every new non-zero `seq`, log
//! `(seq, pid, tid)` of the task that switched out and reopen the gate;
//! otherwise block until the seq changes or the poll interval passes.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use gatesched_kernel::gate::{GateMap, MapError, GATE_KEY};
use gatesched_kernel::host::{Host, TaskSpec};
use gatesched_kernel::ops::ScxError;
use gatesched_kernel::task::{CpuId, Pid, Tid};
use log::{debug, error, info};

use crate::shutdown::Shutdown;
use crate::verify::VerifyLog;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// CPU the monitor is confined to.
    pub cpu: CpuId,
    /// Upper bound on one wait for a gate change.
    pub poll: Duration,
    /// Process the monitor task belongs to.
    pub pid: Pid,
    /// Also pin the real OS thread to `cpu` (best effort).
    pub pin_thread: bool,
}

impl MonitorConfig {
    pub fn new(cpu: CpuId, pid: Pid) -> Self {
        Self { cpu, poll: Duration::from_millis(1), pid, pin_thread: false }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// Shutdown was requested.
    Stopped,
    /// The gate record disappeared.
    LookupFailed(MapError),
    /// Could not opt in to the host.
    AttachFailed(ScxError),
    /// Another monitor got there first.
    RegisterFailed(MapError),
}

#[derive(Debug, Clone)]
pub struct MonitorReport {
    pub tid: Option<Tid>,
    /// Verification records produced.
    pub records: u64,
    pub last_seq: u64,
    /// Clears that lost to a newer close.
    pub stale_clears: u64,
    pub exit: MonitorExit,
}

pub struct Monitor {
    config: MonitorConfig,
    gate: Arc<GateMap>,
    host: Arc<Host>,
    log: VerifyLog,
    shutdown: Arc<Shutdown>,
    ready: Option<Sender<Result<Tid, MonitorExit>>>,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        gate: Arc<GateMap>,
        host: Arc<Host>,
        log: VerifyLog,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self { config, gate, host, log, shutdown, ready: None }
    }

    /// Be told once the monitor has registered (or failed to).
    pub fn notify_ready(mut self, ready: Sender<Result<Tid, MonitorExit>>) -> Self {
        self.ready = Some(ready);
        self
    }

    fn report_ready(&mut self, result: Result<Tid, MonitorExit>) {
        if let Some(ready) = self.ready.take() {
            // The receiver may have given up waiting.
            let _ = ready.send(result);
        }
    }

    fn finish(&mut self, exit: MonitorExit) -> MonitorReport {
        self.report_ready(Err(exit.clone()));
        MonitorReport { tid: None, records: 0, last_seq: 0, stale_clears: 0, exit }
    }

    /// Run on the calling thread until shutdown or a lookup failure.
    pub fn run(mut self) -> MonitorReport {
        let cpu = self.config.cpu;
        if self.config.pin_thread {
            hostal::affinity::try_pin_current_thread(cpu as usize);
        }

        let spec = TaskSpec::new(self.config.pid, "monitor").pinned(cpu);
        let task = match self.host.attach_current(spec) {
            Ok(task) => task,
            Err(err) => {
                error!("monitor: cannot opt in on cpu {}: {}", cpu, err);
                return self.finish(MonitorExit::AttachFailed(err));
            }
        };
        let tid = task.tid();
        if let Err(err) = self.gate.register_monitor(tid) {
            error!("monitor: cannot register: {}", err);
            return self.finish(MonitorExit::RegisterFailed(err));
        }
        info!("monitor: registered as task {} on cpu {}", tid, cpu);
        self.report_ready(Ok(tid));

        let mut report = MonitorReport {
            tid: Some(tid),
            records: 0,
            last_seq: 0,
            stale_clears: 0,
            exit: MonitorExit::Stopped,
        };

        while !self.shutdown.is_triggered() {
            let state = match self.gate.lookup(GATE_KEY) {
                Ok(state) => state,
                Err(err) => {
                    error!("monitor: gate lookup failed: {}", err);
                    report.exit = MonitorExit::LookupFailed(err);
                    break;
                }
            };

            if state.seq != report.last_seq && state.seq > 0 {
                let (pid, switched) = state.last_switched_out;
                self.log.record(state.seq, pid, switched);
                report.last_seq = state.seq;
                report.records += 1;
                match self.gate.clear_pending(state.seq) {
                    Ok(true) => {}
                    Ok(false) => report.stale_clears += 1,
                    Err(err) => {
                        error!("monitor: clearing seq {} failed: {}", state.seq, err);
                        report.exit = MonitorExit::LookupFailed(err);
                        break;
                    }
                }
                task.kick_idle();
                continue;
            }

            let last = report.last_seq;
            let poll = self.config.poll;
            let gate = &self.gate;
            task.block(|| gate.wait_for_change(last, poll));
        }

        debug!(
            "monitor: done after {} records (last seq {}, {} stale clears)",
            report.records, report.last_seq, report.stale_clears
        );
        report
    }
}
