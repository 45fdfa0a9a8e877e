//! The policy ABI: seven callback slots and the flags that travel with them.
//!
//! A policy is any `SchedOps` implementation. It never touches host state
//! directly; every side effect goes through the [`Kfuncs`] handle the host
//! passes into the hook, the same way a BPF scheduler only acts through
//! kfuncs. This keeps policies testable against the deterministic harness
//! and independent of how (or whether) they are registered.

use core::fmt;
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use crate::host::Kfuncs;
use crate::task::{CpuId, Task, Tid};

/// Default time slice granted on enqueue.
pub const SLICE_DFL: Duration = Duration::from_millis(20);

// ── Flags ───────────────────────────────────────────────────────

bitflags! {
    /// Flags passed to `enqueue` and `dsq_insert`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnqFlags: u64 {
        /// The task is being enqueued because it woke up.
        const WAKEUP = 1 << 0;
        /// Insert at the head of the queue instead of the tail.
        const HEAD   = 1 << 1;
    }
}

bitflags! {
    /// Policy-wide behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpsFlags: u64 {
        /// Only tasks that explicitly opt in are governed by the policy.
        const SWITCH_PARTIAL = 1 << 3;
    }
}

bitflags! {
    /// Flags for `kick_cpu`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KickFlags: u64 {
        /// Only kick if the CPU is idle.
        const IDLE    = 1 << 0;
        /// Ask the current task to give up the CPU at its next checkpoint.
        const PREEMPT = 1 << 1;
    }
}

// ── Dispatch queue ids ──────────────────────────────────────────

/// Identifier of a dispatch queue.
///
/// Bit 63 marks built-in queues; user-created queues must leave it clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DsqId(pub u64);

impl DsqId {
    const BUILTIN: u64 = 1 << 63;

    /// The local queue of the CPU the task is assigned to.
    pub const LOCAL: DsqId = DsqId(Self::BUILTIN | 2);

    #[inline]
    pub fn is_builtin(&self) -> bool {
        self.0 & Self::BUILTIN != 0
    }
}

impl fmt::Display for DsqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == DsqId::LOCAL {
            write!(f, "LOCAL")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────

/// Errors surfaced through the kfunc surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScxError {
    #[error("dispatch queue {0} already exists")]
    DsqExists(DsqId),
    #[error("dispatch queue {0} not found")]
    DsqNotFound(DsqId),
    #[error("dispatch queue {0} is a built-in id")]
    DsqBuiltin(DsqId),
    #[error("dispatch queue table is full ({0} queues)")]
    NoSpace(usize),
    #[error("cpu {0} out of range")]
    InvalidCpu(CpuId),
    #[error("task {0} is not managed by this host")]
    UnknownTask(Tid),
    #[error("no scheduler policy is enabled")]
    NotEnabled,
    #[error("unsupported ops flags {0:?}: the host only switches opted-in tasks")]
    Unsupported(OpsFlags),
}

// ── Exit info ───────────────────────────────────────────────────

/// Why the policy is being detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Orderly unload requested by the loader.
    Unregistered,
    /// The host hit an error it could not recover from.
    Error,
}

/// Passed to `SchedOps::exit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub kind: ExitKind,
    pub reason: String,
}

impl ExitInfo {
    pub fn unregistered(reason: &str) -> Self {
        Self {
            kind: ExitKind::Unregistered,
            reason: String::from(reason),
        }
    }
}

// ── Callbacks ───────────────────────────────────────────────────

/// A pluggable scheduling policy.
///
/// The host calls every hook with its state lock held, so hooks run to
/// completion one at a time and must not block.
pub trait SchedOps: Send + Sync {
    /// Policy name, reported in logs.
    fn name(&self) -> &str;

    /// Policy-wide flags.
    fn flags(&self) -> OpsFlags {
        OpsFlags::SWITCH_PARTIAL
    }

    /// Create dispatch queues. An error aborts attachment.
    fn init(&self, scx: &mut Kfuncs<'_>) -> Result<(), ScxError>;

    /// Pick a CPU for a waking task.
    fn select_cpu(
        &self,
        scx: &mut Kfuncs<'_>,
        task: &Task,
        prev_cpu: CpuId,
        wake_flags: EnqFlags,
    ) -> CpuId;

    /// Queue a runnable task. Must insert it into some dispatch queue.
    fn enqueue(&self, scx: &mut Kfuncs<'_>, task: &Task, enq_flags: EnqFlags);

    /// Fill `cpu`'s local queue; called when the CPU has nothing to run.
    fn dispatch(&self, scx: &mut Kfuncs<'_>, cpu: CpuId, prev: Option<&Task>);

    /// `task` is starting to execute.
    fn running(&self, scx: &mut Kfuncs<'_>, task: &Task);

    /// `task` is leaving its CPU. `runnable` is false when it blocks or exits.
    fn stopping(&self, scx: &mut Kfuncs<'_>, task: &Task, runnable: bool);

    /// The policy is being detached.
    fn exit(&self, info: &ExitInfo);
}
