//! The workload tree.
//!
//! A complete k-ary tree of nodes. Each node is a supervised group of
//! threads standing in for one process: it gets its own pid, spawns its
//! children, then runs `threads - 1` extra workers plus worker 0 on its own
//! thread. A node returns only after its workers and then its children have
//! been joined.
//!
//! ```text
//!   Layer 0:            [P:0]
//!                   ┌─────┴─────┐
//!   Layer 1:      [P:1]       [P:2]
//!                ┌──┴──┐     ┌──┴──┐
//!   Layer 2:   [P:3] [P:4] [P:5] [P:6]
//! ```
//!
//! Node `i`'s children are `k*i + 1 ..= k*i + k`.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gatesched_kernel::host::{Host, TaskHandle, TaskSpec};
use gatesched_kernel::ops::ScxError;
use gatesched_kernel::task::{alloc_pid, alloc_tid, Pid, Tid};
use log::{debug, error, warn};
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;

use crate::region::{ActiveSlot, SharedRegion};

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("invalid tree shape: {0}")]
    Shape(&'static str),
    #[error("cannot spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: io::Error,
    },
    #[error("worker {what} could not opt in: {source}")]
    Attach {
        what: String,
        #[source]
        source: ScxError,
    },
}

/// How long a worker sleeps between records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepPolicy {
    Fixed(Duration),
    /// Uniform in `[min, max)`.
    Uniform { min: Duration, max: Duration },
}

impl Default for SleepPolicy {
    fn default() -> Self {
        SleepPolicy::Uniform {
            min: Duration::from_millis(200),
            max: Duration::from_millis(500),
        }
    }
}

impl SleepPolicy {
    pub fn pick<R: Rng>(&self, rng: &mut R) -> Duration {
        match *self {
            SleepPolicy::Fixed(d) => d,
            SleepPolicy::Uniform { min, max } if max > min => rng.gen_range(min..max),
            SleepPolicy::Uniform { min, .. } => min,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TreeConfig {
    pub depth: usize,
    pub fanout: usize,
    /// Workers per node, including worker 0.
    pub threads: usize,
    pub sleep: SleepPolicy,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            depth: 3,
            fanout: 2,
            threads: 3,
            sleep: SleepPolicy::default(),
        }
    }
}

impl TreeConfig {
    pub fn node_count(&self) -> usize {
        (0..self.depth).map(|l| self.fanout.pow(l as u32)).sum()
    }

    pub fn shape(&self) -> treeview::Shape {
        treeview::Shape { depth: self.depth, fanout: self.fanout, threads: self.threads }
    }

    fn validate(&self) -> Result<(), WorkloadError> {
        if self.depth == 0 {
            return Err(WorkloadError::Shape("depth must be at least 1"));
        }
        if self.fanout == 0 {
            return Err(WorkloadError::Shape("fanout must be at least 1"));
        }
        if self.threads == 0 {
            return Err(WorkloadError::Shape("each node needs at least one worker"));
        }
        Ok(())
    }
}

/// One finished node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: usize,
    pub layer: usize,
    pub pid: Pid,
    pub children: Vec<usize>,
    /// Worker thread ids, worker 0 first. Workers that panicked are missing.
    pub tids: Vec<Tid>,
}

/// What the tree did, for tests and the loader's final report.
#[derive(Debug, Clone, Default)]
pub struct TreeReport {
    /// Sorted by node id.
    pub nodes: Vec<NodeInfo>,
    pub panicked: usize,
}

impl TreeReport {
    pub fn worker_count(&self) -> usize {
        self.nodes.iter().map(|n| n.tids.len()).sum()
    }

    /// Every (pid, tid) pair the tree used.
    pub fn pairs(&self) -> Vec<(Pid, Tid)> {
        self.nodes
            .iter()
            .flat_map(|n| n.tids.iter().map(move |t| (n.pid, *t)))
            .collect()
    }
}

struct Ctx {
    config: TreeConfig,
    region: Arc<SharedRegion>,
    host: Option<Arc<Host>>,
    failure: Mutex<Option<WorkloadError>>,
    panicked: Mutex<usize>,
}

impl Ctx {
    /// Record the first failure and stop the whole tree.
    fn fail(&self, err: WorkloadError) {
        error!("workload: {}", err);
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
        drop(failure);
        self.region.stop();
    }
}

pub struct WorkloadTree {
    config: TreeConfig,
    region: Arc<SharedRegion>,
    host: Option<Arc<Host>>,
}

/// A running tree.
pub struct TreeHandle {
    root: JoinHandle<Vec<NodeInfo>>,
    ctx: Arc<Ctx>,
}

impl WorkloadTree {
    pub fn new(config: TreeConfig, region: Arc<SharedRegion>) -> Self {
        Self { config, region, host: None }
    }

    /// Run every worker as a task of `host`.
    pub fn with_host(mut self, host: Arc<Host>) -> Self {
        self.host = Some(host);
        self
    }

    /// Start the root node and return immediately.
    pub fn spawn(self) -> Result<TreeHandle, WorkloadError> {
        self.config.validate()?;
        let ctx = Arc::new(Ctx {
            config: self.config,
            region: self.region,
            host: self.host,
            failure: Mutex::new(None),
            panicked: Mutex::new(0),
        });
        let root_ctx = Arc::clone(&ctx);
        let root = thread::Builder::new()
            .name(String::from("P0"))
            .spawn(move || run_node(&root_ctx, 0, 0))
            .map_err(|source| WorkloadError::Spawn { what: String::from("node 0"), source })?;
        Ok(TreeHandle { root, ctx })
    }

    /// Spawn and wait for the tree to finish.
    pub fn run(self) -> Result<TreeReport, WorkloadError> {
        self.spawn()?.join()
    }
}

impl TreeHandle {
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.ctx.region
    }

    /// Wait for every node. Returns the first failure, if any.
    pub fn join(self) -> Result<TreeReport, WorkloadError> {
        let mut nodes = match self.root.join() {
            Ok(nodes) => nodes,
            Err(_) => {
                *self.ctx.panicked.lock() += 1;
                Vec::new()
            }
        };
        if let Some(err) = self.ctx.failure.lock().take() {
            return Err(err);
        }
        nodes.sort_by_key(|n| n.id);
        let panicked = *self.ctx.panicked.lock();
        Ok(TreeReport { nodes, panicked })
    }
}

fn run_node(ctx: &Arc<Ctx>, id: usize, layer: usize) -> Vec<NodeInfo> {
    let pid = alloc_pid();
    let fanout = ctx.config.fanout;
    debug!("node {} (layer {}) up as pid {}", id, layer, pid);

    let mut children = Vec::new();
    if layer + 1 < ctx.config.depth {
        for k in 0..fanout {
            let child = fanout * id + 1 + k;
            let child_ctx = Arc::clone(ctx);
            let spawned = thread::Builder::new()
                .name(format!("P{}", child))
                .spawn(move || run_node(&child_ctx, child, layer + 1));
            match spawned {
                Ok(handle) => children.push((child, handle)),
                Err(source) => {
                    ctx.fail(WorkloadError::Spawn { what: format!("node {}", child), source });
                    break;
                }
            }
        }
    }

    let mut workers = Vec::new();
    for index in 1..ctx.config.threads {
        let worker_ctx = Arc::clone(ctx);
        let spawned = thread::Builder::new()
            .name(format!("P{}/T{}", id, index))
            .spawn(move || run_worker(&worker_ctx, id, index, pid));
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(source) => {
                ctx.fail(WorkloadError::Spawn { what: format!("P{}/T{}", id, index), source });
                break;
            }
        }
    }

    let mut tids = Vec::with_capacity(ctx.config.threads);
    tids.extend(run_worker(ctx, id, 0, pid));
    for handle in workers {
        match handle.join() {
            Ok(tid) => tids.extend(tid),
            Err(_) => {
                warn!("node {}: a worker panicked", id);
                *ctx.panicked.lock() += 1;
            }
        }
    }

    let mut info = vec![NodeInfo {
        id,
        layer,
        pid,
        children: children.iter().map(|(c, _)| *c).collect(),
        tids,
    }];
    for (child, handle) in children {
        match handle.join() {
            Ok(nodes) => info.extend(nodes),
            Err(_) => {
                warn!("node {}: child {} panicked", id, child);
                *ctx.panicked.lock() += 1;
            }
        }
    }
    debug!("node {} done", id);
    info
}

/// Opt in to the host if there is one. A host that is already gone means
/// the run is ending; the worker carries on unmanaged.
fn opt_in(ctx: &Ctx, node: usize, index: usize, pid: Pid) -> Result<Option<TaskHandle>, WorkloadError> {
    let Some(host) = &ctx.host else {
        return Ok(None);
    };
    let name = format!("P{}/T{}", node, index);
    match host.attach_current(TaskSpec::new(pid, name.clone())) {
        Ok(handle) => Ok(Some(handle)),
        Err(ScxError::NotEnabled) => {
            debug!("{}: policy not enabled, running unmanaged", name);
            Ok(None)
        }
        Err(source) => Err(WorkloadError::Attach { what: name, source }),
    }
}

/// The worker loop. Returns the worker's tid, or `None` if it never ran.
fn run_worker(ctx: &Ctx, node: usize, index: usize, pid: Pid) -> Option<Tid> {
    let region = &ctx.region;
    let task = match opt_in(ctx, node, index, pid) {
        Ok(task) => task,
        Err(err) => {
            ctx.fail(err);
            return None;
        }
    };
    let tid = task.as_ref().map_or_else(alloc_tid, TaskHandle::tid);
    let slot = ActiveSlot { process: node, thread: index };
    let mut rng = rand::thread_rng();

    while region.is_running() {
        region.record(slot, pid, tid);
        if let Some(task) = &task {
            task.checkpoint();
        }
        let period = ctx.config.sleep.pick(&mut rng);
        let stopped = match &task {
            Some(task) => task.sleep(period, region.notifier(), || !region.is_running()),
            None => region.sleep(period),
        };
        if stopped {
            break;
        }
    }
    Some(tid)
}
