//! Task identity and state.

pub mod process;

pub use process::{
    alloc_pid, alloc_tid, CpuId, CpuMask, Pid, Task, TaskEntry, TaskState, Tid, MAX_CPUS,
};
