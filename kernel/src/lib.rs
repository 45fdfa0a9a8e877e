// =============================================================================
// gatesched — Scheduling Side
// =============================================================================
//
// The pieces a pluggable-scheduler kernel would own, runnable in-process:
//
//   task    — task identity (pid/tid), CPU masks, per-task scheduling state
//   ops     — the policy ABI: `SchedOps`, flags, dispatch queue ids, errors
//   dsq     — user-created dispatch queues (FIFOs)
//   host    — the host that drives a policy: threaded `Host` for real
//             workloads, deterministic `Harness` for tests
//   gate    — the single-entry gate map shared by policy and monitor
//   policy  — the gate policy itself
//   module  — locating and parsing the policy module manifest
//   sync    — the wait/notify primitive used for bounded waits
//
// A typical attach:
//
//   let gate = Arc::new(GateMap::new());
//   let policy = Arc::new(GatePolicy::new(Arc::clone(&gate), config));
//   let host = Host::attach(host_config, policy)?;
//   let me = host.attach_current(TaskSpec::new(pid, "worker"))?;
//   ...
//   host.detach("done");
//
// =============================================================================

pub mod dsq;
pub mod gate;
pub mod host;
pub mod module;
pub mod ops;
pub mod policy;
pub mod sync;
pub mod task;

pub use gate::{GateMap, GateState, MapError, GATE_KEY};
pub use host::{AttachError, Harness, Host, HostConfig, ScxState, TaskHandle, TaskSpec};
pub use ops::{DsqId, SchedOps, ScxError};
pub use policy::{GateMode, GatePolicy, PolicyConfig};
