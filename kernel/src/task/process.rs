//! Task identity and per-task scheduling state.
//!
//! A task is one thread of execution the host schedules. Tasks belong to a
//! process (a node of the workload tree, or the loader itself for the
//! monitor); both ids are allocated here from process-wide counters so every
//! (pid, tid) pair in a run is unique.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Maximum number of simulated CPUs a host can drive (width of [`CpuMask`]).
pub const MAX_CPUS: usize = 64;

/// Index of a simulated CPU.
pub type CpuId = u32;

// ── Identifiers ─────────────────────────────────────────────────

/// Monotonically increasing PID counter.
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Monotonically increasing TID counter. TIDs are unique across processes.
static NEXT_TID: AtomicU32 = AtomicU32::new(1);

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(pub u32);

/// Thread identifier. Also serves as the task id the gate compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocate a unique PID.
pub fn alloc_pid() -> Pid {
    Pid(NEXT_PID.fetch_add(1, Ordering::Relaxed))
}

/// Allocate a unique TID.
pub fn alloc_tid() -> Tid {
    Tid(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

// ── CPU mask ────────────────────────────────────────────────────

/// Set of CPUs a task may run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    /// Every CPU.
    pub const fn all() -> Self {
        Self(u64::MAX)
    }

    /// Exactly one CPU. Empty if `cpu` is out of range.
    pub const fn single(cpu: CpuId) -> Self {
        if (cpu as usize) < MAX_CPUS {
            Self(1u64 << cpu)
        } else {
            Self(0)
        }
    }

    #[inline]
    pub fn contains(&self, cpu: CpuId) -> bool {
        (cpu as usize) < MAX_CPUS && self.0 & (1u64 << cpu) != 0
    }

    /// Lowest CPU in the mask that is below `nr_cpus`.
    pub fn first(&self, nr_cpus: usize) -> Option<CpuId> {
        (0..nr_cpus.min(MAX_CPUS) as CpuId).find(|&cpu| self.contains(cpu))
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::all()
    }
}

// ── Task ────────────────────────────────────────────────────────

/// The view of a task handed to policy hooks.
///
/// Hooks receive a copy; the host owns the authoritative [`TaskEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub pid: Pid,
    pub tid: Tid,
    /// CPU the task last ran on (or was selected for).
    pub cpu: CpuId,
}

impl Task {
    /// Task id used by the gate.
    #[inline]
    pub fn id(&self) -> Tid {
        self.tid
    }
}

/// The possible states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in a dispatch queue or a CPU's local queue.
    Runnable,
    /// Currently executing on the given CPU.
    Running(CpuId),
    /// Blocked outside the scheduler (sleep, wait-on-change).
    Sleeping,
}

/// Host-side record for one task.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub task: Task,
    /// Human-readable name (e.g. "monitor", "P3/T1").
    pub name: String,
    pub state: TaskState,
    pub affinity: CpuMask,
    /// Slice granted by the last `dsq_insert`.
    pub slice: std::time::Duration,
    /// When the current run exhausts its slice.
    pub slice_deadline: Option<Instant>,
    /// Set by the CPU tick once the slice is exhausted.
    pub need_resched: bool,
}

impl TaskEntry {
    pub fn new(task: Task, name: &str, affinity: CpuMask) -> Self {
        Self {
            task,
            name: String::from(name),
            state: TaskState::Sleeping,
            affinity,
            slice: std::time::Duration::ZERO,
            slice_deadline: None,
            need_resched: false,
        }
    }
}
