//! Verification log and end-of-run summary.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use gatesched_kernel::gate::GateState;
use gatesched_kernel::task::{Pid, Tid};
use log::warn;

/// Append-only `<seq> <pid> <tid>` log, flushed after every line.
///
/// An I/O error disables the log; the run carries on without it.
pub struct VerifyLog {
    out: Option<Box<dyn Write + Send>>,
    path: Option<PathBuf>,
    written: u64,
}

impl VerifyLog {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            out: Some(Box::new(file)),
            path: Some(path.to_path_buf()),
            written: 0,
        })
    }

    /// A log that writes to `out`.
    pub fn from_writer(out: Box<dyn Write + Send>) -> Self {
        Self { out: Some(out), path: None, written: 0 }
    }

    /// A log that drops everything.
    pub fn disabled() -> Self {
        Self { out: None, path: None, written: 0 }
    }

    pub fn is_enabled(&self) -> bool {
        self.out.is_some()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn record(&mut self, seq: u64, pid: Pid, tid: Tid) {
        let Some(out) = self.out.as_mut() else {
            return;
        };
        let result = writeln!(out, "{} {} {}", seq, pid, tid).and_then(|()| out.flush());
        match result {
            Ok(()) => self.written += 1,
            Err(err) => {
                let name = self
                    .path
                    .as_deref()
                    .map_or_else(|| String::from("<writer>"), |p| p.display().to_string());
                warn!("verification log {}: {}; no further records", name, err);
                self.out = None;
            }
        }
    }
}

/// Final counters of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Summary {
    pub seq: u64,
    pub monitor_runs: u64,
    pub gate_empty_while_closed: u64,
    pub violations: u64,
}

impl Summary {
    pub fn passed(&self) -> bool {
        self.violations == 0
    }
}

impl From<&GateState> for Summary {
    fn from(state: &GateState) -> Self {
        Self {
            seq: state.seq,
            monitor_runs: state.monitor_runs,
            gate_empty_while_closed: state.gate_empty_while_closed,
            violations: state.violations,
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==========================================")?;
        writeln!(f, "  Verification summary")?;
        writeln!(f, "==========================================")?;
        writeln!(f, "  seq                  : {}", self.seq)?;
        writeln!(f, "  monitorRuns          : {}", self.monitor_runs)?;
        writeln!(f, "  gateEmptyWhileClosed : {}", self.gate_empty_while_closed)?;
        writeln!(f, "  violations           : {}", self.violations)?;
        write!(f, "  result               : {}", if self.passed() { "PASSED" } else { "FAILED" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Failing;

    impl Write for Failing {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn records_are_written_as_lines() {
        let buf = Shared::default();
        let mut log = VerifyLog::from_writer(Box::new(buf.clone()));
        log.record(1, Pid(3), Tid(4));
        log.record(2, Pid(3), Tid(5));
        assert_eq!(log.written(), 2);
        assert_eq!(String::from_utf8(buf.0.lock().unwrap().clone()).unwrap(), "1 3 4\n2 3 5\n");
    }

    #[test]
    fn io_error_disables_the_log() {
        let mut log = VerifyLog::from_writer(Box::new(Failing));
        log.record(1, Pid(1), Tid(1));
        assert!(!log.is_enabled());
        log.record(2, Pid(1), Tid(1));
        assert_eq!(log.written(), 0);
    }

    #[test]
    fn file_log_is_flushed_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verify.log");
        let mut log = VerifyLog::create(&path).unwrap();
        log.record(7, Pid(2), Tid(9));
        // Still open, already on disk.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "7 2 9\n");
    }

    #[test]
    fn summary_verdict() {
        let mut s = Summary { seq: 10, monitor_runs: 10, ..Summary::default() };
        assert!(s.passed());
        assert!(s.to_string().ends_with("PASSED"));
        s.violations = 1;
        assert!(s.to_string().contains("violations           : 1"));
        assert!(s.to_string().ends_with("FAILED"));
    }
}
