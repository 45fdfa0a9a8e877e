//! process-tree — run the workload tree on its own.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use libgate::render::Renderer;
use libgate::{SharedRegion, Shutdown, SleepPolicy, TreeConfig, WorkloadTree, DEFAULT_CAPACITY};
use log::{info, LevelFilter};

#[derive(Debug, Parser)]
#[command(name = "process-tree", version, about = "Spawn the workload tree and let it run")]
struct Args {
    /// Draw the tree, highlighting the most recent worker.
    #[arg(short = 'd', long = "display")]
    display: bool,

    /// Stop after this many seconds instead of waiting for Ctrl+C.
    #[arg(short = 't', long = "duration", value_parser = parse_seconds)]
    duration: Option<Duration>,

    /// Fixed worker sleep in milliseconds (default: random 200-500 ms).
    #[arg(long = "interval-ms")]
    interval_ms: Option<u64>,

    /// Write the activity log here on exit.
    #[arg(short = 'a', long = "activity-log")]
    activity_log: Option<PathBuf>,

    /// Activity log capacity; once full, new records are dropped and the
    /// workers keep running.
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,

    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Seconds as a duration. Zero or negative means no limit.
fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|err| format!("{}: {}", value, err))?;
    if secs <= 0.0 {
        return Ok(Duration::ZERO);
    }
    Duration::try_from_secs_f64(secs).map_err(|err| format!("{} seconds: {}", value, err))
}

impl Args {
    fn tree_config(&self) -> TreeConfig {
        let sleep = match self.interval_ms {
            Some(ms) => SleepPolicy::Fixed(Duration::from_millis(ms)),
            None => SleepPolicy::default(),
        };
        TreeConfig { sleep, ..TreeConfig::default() }
    }
}

fn run(args: Args) -> Result<()> {
    let shutdown = Shutdown::new();
    shutdown
        .install_signal_handler()
        .context("installing signal handlers")?;

    let region = Arc::new(SharedRegion::new(args.capacity)?);
    let config = args.tree_config();
    let shape = config.shape();
    println!(
        "Spawning {} processes x {} threads (Ctrl+C to stop)",
        config.node_count(),
        config.threads
    );

    let tree = WorkloadTree::new(config, Arc::clone(&region)).spawn()?;

    let renderer = if args.display {
        let renderer = Renderer::new(Arc::clone(&region), shape);
        let shutdown = Arc::clone(&shutdown);
        Some(
            thread::Builder::new()
                .name(String::from("render"))
                .spawn(move || renderer.run(&shutdown))
                .context("starting the display")?,
        )
    } else {
        None
    };

    let deadline = args
        .duration
        .filter(|d| !d.is_zero())
        .and_then(|d| Instant::now().checked_add(d));
    shutdown.wait_until(deadline, Duration::from_millis(50), || !region.is_running());
    shutdown.trigger();
    region.stop();

    let report = tree.join()?;
    if let Some(handle) = renderer {
        let _ = handle.join();
    }

    let written = shutdown.finalize(|| match &args.activity_log {
        Some(path) => region
            .persist(path)
            .with_context(|| format!("writing {}", path.display()))
            .map(Some),
        None => Ok(None),
    });
    if let Some(Some(n)) = written.transpose()? {
        info!("activity log: {} records", n);
    }

    println!("\nProcess tree terminated.");
    println!(
        "{} workers across {} processes, {} activity records",
        report.worker_count(),
        report.nodes.len(),
        region.len()
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = gatelog::level_from_verbosity(gatelog::level_from_env(LevelFilter::Warn), args.verbose);
    if let Err(err) = gatelog::init(level) {
        eprintln!("warning: logger already set: {}", err);
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn display_defaults_off() {
        let args = Args::try_parse_from(["process-tree"]).unwrap();
        assert!(!args.display);
        assert_eq!(args.tree_config().sleep, SleepPolicy::default());
        let args = Args::try_parse_from(["process-tree", "-d", "--interval-ms", "5"]).unwrap();
        assert!(args.display);
        assert_eq!(args.tree_config().sleep, SleepPolicy::Fixed(Duration::from_millis(5)));
    }

    #[test]
    fn help_is_not_an_error_exit() {
        let err = Args::try_parse_from(["process-tree", "-h"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
        assert_eq!(err.exit_code(), 0);
    }

    #[test]
    fn duration_must_fit() {
        let args = Args::try_parse_from(["process-tree", "-t", "1.5"]).unwrap();
        assert_eq!(args.duration, Some(Duration::from_millis(1500)));
        for bad in ["inf", "1e30", "-"] {
            assert!(Args::try_parse_from(["process-tree", "-t", bad]).is_err(), "-t {}", bad);
        }
    }

    #[test]
    fn capacity_help_says_workers_keep_running() {
        let help = Args::command().render_long_help().to_string();
        assert!(help.contains("workers keep running"));
        assert!(!help.contains("workload stops"));
    }

    #[test]
    fn clap_definition_is_consistent() {
        Args::command().debug_assert();
    }
}
