//! Thread CPU affinity.

use crate::HalError;

/// Pin the calling thread to `cpu`.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> Result<(), HalError> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let online = crate::cpu::online_cpus();
    let mut set = CpuSet::new();
    set.set(cpu)
        .map_err(|_| HalError::NoSuchCpu { cpu, online })?;
    // Pid 0 is the calling thread.
    sched_setaffinity(Pid::from_raw(0), &set).map_err(|e| HalError::Affinity(e.to_string()))
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> Result<(), HalError> {
    Err(HalError::Unsupported)
}

/// Pin if possible; log and carry on otherwise.
pub fn try_pin_current_thread(cpu: usize) -> bool {
    if !crate::cpu::is_online(cpu) {
        log::debug!("not pinning to cpu {}: only {} online", cpu, crate::cpu::online_cpus());
        return false;
    }
    match pin_current_thread(cpu) {
        Ok(()) => true,
        Err(err) => {
            log::debug!("not pinning to cpu {}: {}", cpu, err);
            false
        }
    }
}
