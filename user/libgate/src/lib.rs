//! Userspace side of gatesched.
//!
//! The loader calls [`session::run_session`]; the standalone workload
//! generator uses [`tree::WorkloadTree`] and [`render::Renderer`] directly.

pub mod monitor;
pub mod region;
pub mod render;
pub mod session;
pub mod shutdown;
pub mod tree;
pub mod verify;

pub use monitor::{Monitor, MonitorConfig, MonitorExit, MonitorReport};
pub use region::{ActiveSlot, ActivityRecord, RegionError, SharedRegion, DEFAULT_CAPACITY};
pub use session::{run_session, SessionConfig, SessionError, SessionReport};
pub use shutdown::Shutdown;
pub use tree::{SleepPolicy, TreeConfig, TreeReport, WorkloadError, WorkloadTree};
pub use verify::{Summary, VerifyLog};
