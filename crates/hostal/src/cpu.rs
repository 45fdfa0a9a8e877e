//! CPU discovery.

/// Number of CPUs this process may use. Falls back to 1.
pub fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Whether `cpu` names an online CPU.
pub fn is_online(cpu: usize) -> bool {
    cpu < online_cpus()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_least_one_cpu() {
        assert!(online_cpus() >= 1);
        assert!(is_online(0));
        assert!(!is_online(usize::MAX));
    }
}
