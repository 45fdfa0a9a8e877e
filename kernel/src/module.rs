//! Policy module discovery and loading.
//!
//! The "module" a loader attaches is a TOML manifest describing which policy
//! to build and with what parameters:
//!
//! ```toml
//! name = "gate"
//! slice_us = 20000
//! shared_dsq = 0
//! monitor_dsq = 1
//! gate = "enforced"
//!
//! [host]
//! cpus = 4
//! tick_us = 1000
//! ```
//!
//! Every field is optional.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::host::HostConfig;
use crate::ops::DsqId;
use crate::policy::{GateMode, PolicyConfig, MONITOR_DSQ, SHARED_DSQ};

/// File name the loader looks for.
pub const MODULE_FILE: &str = "gatesched.policy.toml";

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("policy module gatesched.policy.toml not found (searched: {searched})")]
    NotFound { searched: String },
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{}: shared and monitor queues must differ (both {id})", path.display())]
    SameQueue { path: PathBuf, id: u64 },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSection {
    pub cpus: Option<usize>,
    pub tick_us: Option<u64>,
}

/// The parsed manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyModule {
    pub name: Option<String>,
    pub slice_us: Option<u64>,
    pub shared_dsq: Option<u64>,
    pub monitor_dsq: Option<u64>,
    pub gate: Option<GateMode>,
    #[serde(default)]
    pub host: HostSection,
}

impl PolicyModule {
    pub fn load(path: &Path) -> Result<Self, ModuleError> {
        let text = fs::read_to_string(path).map_err(|source| ModuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let module: PolicyModule = toml::from_str(&text).map_err(|source| ModuleError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let config = module.policy_config();
        if config.shared_dsq == config.monitor_dsq {
            return Err(ModuleError::SameQueue {
                path: path.to_path_buf(),
                id: config.shared_dsq.0,
            });
        }
        Ok(module)
    }

    pub fn policy_config(&self) -> PolicyConfig {
        let defaults = PolicyConfig::default();
        PolicyConfig {
            name: self.name.clone().unwrap_or(defaults.name),
            slice: self.slice_us.map(Duration::from_micros).unwrap_or(defaults.slice),
            shared_dsq: self.shared_dsq.map(DsqId).unwrap_or(SHARED_DSQ),
            monitor_dsq: self.monitor_dsq.map(DsqId).unwrap_or(MONITOR_DSQ),
            gate: self.gate.unwrap_or(defaults.gate),
        }
    }

    /// Host parameters, with the manifest's values over the defaults.
    pub fn host_config(&self) -> HostConfig {
        let mut config = HostConfig::default();
        if let Some(cpus) = self.host.cpus {
            config.nr_cpus = cpus;
        }
        if let Some(tick) = self.host.tick_us {
            config.tick = Duration::from_micros(tick.max(1));
        }
        config
    }
}

/// Candidate locations, in search order: next to the executable, the
/// current directory, then `build/`.
pub fn search_paths(exe: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = exe.and_then(Path::parent) {
        paths.push(dir.join(MODULE_FILE));
    }
    paths.push(PathBuf::from(MODULE_FILE));
    paths.push(Path::new("build").join(MODULE_FILE));
    paths
}

/// First existing candidate from [`search_paths`].
pub fn find_policy_module(exe: Option<&Path>) -> Result<PathBuf, ModuleError> {
    let candidates = search_paths(exe);
    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| ModuleError::NotFound {
            searched: candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_manifest_uses_defaults() {
        let module: PolicyModule = toml::from_str("").unwrap();
        let config = module.policy_config();
        assert_eq!(config.name, "gate");
        assert_eq!(config.gate, GateMode::Enforced);
        assert_eq!(config.shared_dsq, SHARED_DSQ);
        assert_eq!(module.host_config().nr_cpus, HostConfig::default().nr_cpus);
    }

    #[test]
    fn manifest_fields_are_applied() {
        let text = r#"
            name = "gate-test"
            slice_us = 5000
            gate = "disabled"

            [host]
            cpus = 2
            tick_us = 500
        "#;
        let module: PolicyModule = toml::from_str(text).unwrap();
        let config = module.policy_config();
        assert_eq!(config.name, "gate-test");
        assert_eq!(config.slice, Duration::from_millis(5));
        assert_eq!(config.gate, GateMode::Disabled);
        let host = module.host_config();
        assert_eq!(host.nr_cpus, 2);
        assert_eq!(host.tick, Duration::from_micros(500));
    }

    #[test]
    fn load_rejects_bad_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MODULE_FILE);

        std::fs::write(&path, "gate = \"sometimes\"").unwrap();
        assert!(matches!(PolicyModule::load(&path), Err(ModuleError::Parse { .. })));

        std::fs::write(&path, "shared_dsq = 3\nmonitor_dsq = 3").unwrap();
        assert!(matches!(PolicyModule::load(&path), Err(ModuleError::SameQueue { id: 3, .. })));

        assert!(matches!(
            PolicyModule::load(&dir.path().join("missing.toml")),
            Err(ModuleError::Io { .. })
        ));
    }

    #[test]
    fn search_starts_next_to_the_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("gatesched-loader");
        std::fs::write(dir.path().join(MODULE_FILE), "").unwrap();
        let found = find_policy_module(Some(&exe)).unwrap();
        assert_eq!(found, dir.path().join(MODULE_FILE));

        let paths = search_paths(None);
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[1], Path::new("build").join(MODULE_FILE));
    }
}
