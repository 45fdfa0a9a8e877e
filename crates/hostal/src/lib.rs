//! Host Abstraction Layer.
//!
//! The few places the workspace touches the real machine: how many CPUs it
//! has, pinning a thread to one of them, termination signals, and reading
//! the scheduler state file.

pub mod affinity;
pub mod cpu;
pub mod probe;
pub mod signal;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HalError {
    #[error("cpu {cpu} is not available (online: {online})")]
    NoSuchCpu { cpu: usize, online: usize },
    #[error("sched_setaffinity failed: {0}")]
    Affinity(String),
    #[error("pinning is not supported on this platform")]
    Unsupported,
    #[error("cannot install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("cannot read state file: {0}")]
    Io(#[from] std::io::Error),
}
