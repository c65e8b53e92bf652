//! cgreapd - cgroup reaper daemon.
//!
//! Watches the managed spawner scopes under the cgroup2 hierarchy.  When a
//! cgroup in one of them becomes empty, its final accounting counters are
//! sampled, a summary line is printed, the Lua handler is invoked and the
//! empty directory is deleted (children before parents).

mod instance;
mod script;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use inotify::Inotify;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use cgreap_core::cgwatch::CgroupWatch;
use cgreap_core::scopes::MANAGED_SCOPES;
use cgreap_core::sd;

use instance::Instance;
use script::LuaAccounting;

/// Cgroup reaper daemon.
#[derive(Parser)]
#[command(name = "cgreapd", about = "Cgroup reaper daemon", version)]
struct Args {
    /// Path to the accounting handler script.
    #[arg(long, default_value = "/etc/cm4all/spawn/accounting.lua")]
    script: PathBuf,

    /// Path to the cgroup2 mount point.
    #[arg(long, default_value = "/sys/fs/cgroup")]
    cgroup_root: PathBuf,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("cgreapd={}", level).parse().unwrap())
        .add_directive(format!("cgreap_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let root_cgroup = nix::fcntl::open(
        &args.cgroup_root,
        OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("Failed to open {}", args.cgroup_root.display()))?;

    let accounting =
        LuaAccounting::load(&args.script).context("Failed to load accounting script")?;
    info!("Accounting script: {}", args.script.display());

    let inotify = Inotify::init().context("Failed to initialize inotify")?;
    let (empty_tx, empty_rx) = tokio::sync::mpsc::unbounded_channel();

    let mut watch = CgroupWatch::new(
        inotify.watches(),
        root_cgroup.try_clone()?,
        empty_tx,
    )
    .context("Failed to watch cgroup hierarchy")?;

    for scope in MANAGED_SCOPES {
        let relative_path = scope.strip_prefix('/').unwrap_or(scope);
        watch.add_cgroup(relative_path);
        info!("Managing scope {}", scope);
    }

    let events = inotify
        .into_event_stream(vec![0u8; 4096])
        .context("Failed to start inotify stream")?;

    sd::notify_ready();

    Instance::new(root_cgroup, watch, accounting)
        .run(events, empty_rx)
        .await
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("cgreapd {} starting", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    runtime.block_on(local.run_until(run(args)))?;

    info!("Shutdown complete");
    Ok(())
}
