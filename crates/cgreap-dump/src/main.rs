//! cgreap-dump - manual tree watcher runner.
//!
//! Watches a base directory (plus optional target relative paths) and
//! prints one line per created/deleted directory.  Debugging aid for the
//! reaper's watcher; it performs no cgroup-specific processing.

use std::os::fd::BorrowedFd;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use futures_util::StreamExt;
use inotify::Inotify;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::Level;

use cgreap_core::treewatch::{TreeWatch, TreeWatchHandler};

/// Watch a directory tree and print create/delete events.
#[derive(Parser)]
#[command(name = "cgreap-dump", version)]
struct Args {
    /// Base directory to watch.
    base: PathBuf,

    /// Target paths relative to the base; the subtree below each target is
    /// watched recursively.
    #[arg(required = true)]
    targets: Vec<String>,
}

struct Printer;

impl TreeWatchHandler for Printer {
    fn on_directory_created(&mut self, relative_path: &str, _directory_fd: BorrowedFd<'_>) {
        println!("+ {}", relative_path);
    }

    fn on_directory_deleted(&mut self, relative_path: &str) {
        println!("- {}", relative_path);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let inotify = Inotify::init().context("Failed to initialize inotify")?;

        let root_fd = nix::fcntl::open(
            &args.base,
            OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .with_context(|| format!("Failed to open {}", args.base.display()))?;

        let mut printer = Printer;
        let mut tree = TreeWatch::new(inotify.watches(), root_fd)?;

        for target in &args.targets {
            tree.add(target, &mut printer);
        }

        let mut events = inotify.into_event_stream(vec![0u8; 4096])?;

        loop {
            tokio::select! {
                maybe_event = events.next() => match maybe_event {
                    Some(Ok(event)) => tree.handle_event(&event, &mut printer),
                    Some(Err(err)) => return Err(err.into()),
                    None => return Ok(()),
                },
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        }
    })
}
