//! gatesched-loader — attach the gate policy, run the workload, verify.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use gatesched_kernel::module::{find_policy_module, PolicyModule};
use gatesched_kernel::policy::GateMode;
use gatesched_kernel::task::CpuId;
use libgate::{run_session, SessionConfig, Shutdown, SleepPolicy, TreeConfig, DEFAULT_CAPACITY};
use log::{info, LevelFilter};

#[derive(Debug, Parser)]
#[command(
    name = "gatesched-loader",
    version,
    about = "Attach the gate policy, run the workload tree and verify the gate"
)]
struct Args {
    /// CPU the monitor runs on (required).
    #[arg(short = 'c', long = "cpu", allow_negative_numbers = true)]
    cpu: Option<i64>,

    /// Verification log (`<seq> <pid> <tid>` per line).
    #[arg(short = 'o', long = "verify-log", default_value = "verify.log")]
    verify_log: PathBuf,

    /// Workload activity log, written at shutdown.
    #[arg(short = 'a', long = "activity-log", default_value = "activity.log")]
    activity_log: PathBuf,

    /// Stop after this many seconds instead of waiting for Ctrl+C.
    #[arg(short = 't', long = "duration", value_parser = parse_seconds)]
    duration: Option<Duration>,

    /// Simulated CPU count (overrides the module's `[host] cpus`).
    #[arg(long)]
    cpus: Option<usize>,

    /// Fixed worker sleep in milliseconds (default: random 200-500 ms).
    #[arg(long = "interval-ms")]
    interval_ms: Option<u64>,

    /// Run with the gate disabled (control experiment).
    #[arg(long = "no-gate")]
    no_gate: bool,

    /// Activity log capacity.
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,

    /// Draw the process tree while running.
    #[arg(short = 'd', long = "display")]
    display: bool,

    /// Policy module to load instead of searching for one.
    #[arg(long, env = "GATESCHED_MODULE")]
    module: Option<PathBuf>,

    /// Where the host publishes its state.
    #[arg(long = "state-file")]
    state_file: Option<PathBuf>,

    /// Pin the monitor's OS thread to the same real CPU.
    #[arg(long = "pin")]
    pin: bool,

    /// More logging (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn usage_error(message: &str) -> ExitCode {
    eprintln!("error: {}\n", message);
    eprintln!("{}", Args::command().render_usage());
    eprintln!("  -c, --cpu <CPU>  CPU the monitor runs on (0..N-1)");
    ExitCode::from(1)
}

/// Seconds as a duration. Zero or negative means no limit.
fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|err| format!("{}: {}", value, err))?;
    if secs <= 0.0 {
        return Ok(Duration::ZERO);
    }
    Duration::try_from_secs_f64(secs).map_err(|err| format!("{} seconds: {}", value, err))
}

/// `-c` must be given and non-negative. Checked before anything is loaded.
fn requested_cpu(cpu: Option<i64>) -> Result<u64, String> {
    match cpu {
        None => Err(String::from("the monitor CPU (-c) is required")),
        Some(c) if c < 0 => Err(format!("cpu {} is negative", c)),
        Some(c) => Ok(c as u64),
    }
}

/// Range-check the requested CPU against the host's CPU count.
fn monitor_cpu(cpu: u64, nr_cpus: usize) -> Result<CpuId, String> {
    match CpuId::try_from(cpu) {
        Ok(id) if cpu < nr_cpus as u64 => Ok(id),
        _ => Err(format!("cpu {} out of range (host has {} cpus)", cpu, nr_cpus)),
    }
}

#[derive(Debug)]
enum StartupError {
    /// Bad command line: print usage.
    Usage(String),
    Module(anyhow::Error),
}

/// Validate the command line and load the policy module, in that order.
fn startup(args: &Args) -> Result<(PolicyModule, CpuId), StartupError> {
    let requested = requested_cpu(args.cpu).map_err(StartupError::Usage)?;
    let module = load_module(args).map_err(StartupError::Module)?;
    let nr_cpus = args.cpus.unwrap_or(module.host_config().nr_cpus);
    let cpu = monitor_cpu(requested, nr_cpus).map_err(StartupError::Usage)?;
    Ok((module, cpu))
}

fn load_module(args: &Args) -> Result<PolicyModule> {
    let path = match &args.module {
        Some(path) => path.clone(),
        None => {
            let exe = std::env::current_exe()
                .ok()
                .or_else(|| std::env::args_os().next().map(PathBuf::from));
            find_policy_module(exe.as_deref())?
        }
    };
    info!("policy module: {}", path.display());
    Ok(PolicyModule::load(&path)?)
}

fn build_config(args: &Args, module: &PolicyModule, cpu: CpuId) -> SessionConfig {
    let mut policy = module.policy_config();
    if args.no_gate {
        policy.gate = GateMode::Disabled;
    }
    let mut host = module.host_config();
    if let Some(cpus) = args.cpus {
        host.nr_cpus = cpus;
    }
    host.state_file = Some(
        args.state_file
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("gatesched-{}.state", std::process::id()))),
    );

    let sleep = match args.interval_ms {
        Some(ms) => SleepPolicy::Fixed(Duration::from_millis(ms)),
        None => SleepPolicy::default(),
    };

    SessionConfig {
        policy,
        host,
        monitor_cpu: cpu,
        pin_monitor: args.pin,
        verify_log: args.verify_log.clone(),
        activity_log: Some(args.activity_log.clone()),
        duration: args.duration.filter(|d| !d.is_zero()),
        tree: TreeConfig { sleep, ..TreeConfig::default() },
        capacity: args.capacity,
        display: args.display,
        ..SessionConfig::default()
    }
}

fn run(config: SessionConfig) -> Result<bool> {
    let state_file = config.host.state_file.clone();
    let gate = config.policy.gate;
    let shutdown = Shutdown::new();
    shutdown
        .install_signal_handler()
        .context("installing signal handlers")?;

    println!("==========================================");
    println!("  gate policy loaded ({:?} gate, monitor on cpu {})", gate, config.monitor_cpu);
    println!("==========================================");
    println!("Press Ctrl+C to unload...\n");

    let result = run_session(config, shutdown);
    if let Some(path) = state_file {
        // Best effort; the file only matters while the policy is attached.
        let _ = std::fs::remove_file(path);
    }
    let report = result.context("verification run failed")?;

    println!("\nScheduler unloaded.");
    println!(
        "monitor: {} records, {} stale clears; workload: {} nodes, {} activity records",
        report.verify_records,
        report.monitor.stale_clears,
        report.tree.nodes.len(),
        report.activity_records
    );
    println!("{}", report.summary);
    Ok(report.summary.passed())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = gatelog::level_from_verbosity(gatelog::level_from_env(LevelFilter::Warn), args.verbose);
    if let Err(err) = gatelog::init(level) {
        eprintln!("warning: logger already set: {}", err);
    }

    let (module, cpu) = match startup(&args) {
        Ok(ready) => ready,
        Err(StartupError::Usage(message)) => return usage_error(&message),
        Err(StartupError::Module(err)) => {
            eprintln!("error: {:#}", err);
            return ExitCode::from(1);
        }
    };

    match run(build_config(&args, &module, cpu)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(1)
        }
    }
}
