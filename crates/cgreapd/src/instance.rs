//! Reaper orchestration: wires the cgroup watcher to the accounting
//! sampler, the Lua bridge and the deferred-delete queue.

use std::collections::BTreeSet;
use std::os::fd::{AsFd, OwnedFd};
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use inotify::EventStream;
use nix::errno::Errno;
use nix::fcntl::{openat, OFlag};
use nix::sys::stat::Mode;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cgreap_core::accounting::{read_resource_usage, CgroupResourceUsage};
use cgreap_core::cgwatch::CgroupWatch;
use cgreap_core::scopes::managed_suffix;
use cgreap_core::summary::format_released;
use cgreap_core::sys;

use crate::script::LuaAccounting;

/// Deletion is deferred briefly so unpopulated children can queue up first
/// (their removal must precede the parent's) and so the accounting handler
/// gets a chance to read further data from the cgroup.
const DELETE_DELAY: Duration = Duration::from_millis(50);

pub struct Instance {
    root_cgroup: OwnedFd,
    watch: CgroupWatch,
    accounting: LuaAccounting,

    /// Absolute cgroup paths awaiting rmdir, drained in reverse
    /// lexicographic order so children go before their parents.
    delete_queue: BTreeSet<String>,

    /// One-shot deadline of the pending deletion pass; arming while armed
    /// does not reset it.
    delete_at: Option<Instant>,
}

impl Instance {
    pub fn new(root_cgroup: OwnedFd, watch: CgroupWatch, accounting: LuaAccounting) -> Self {
        Self {
            root_cgroup,
            watch,
            accounting,
            delete_queue: BTreeSet::new(),
            delete_at: None,
        }
    }

    pub async fn run(
        mut self,
        mut events: EventStream<Vec<u8>>,
        mut empty_rx: UnboundedReceiver<String>,
    ) -> anyhow::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            let delete_at = self.delete_at;

            tokio::select! {
                maybe_event = events.next() => match maybe_event {
                    Some(Ok(event)) => self.watch.handle_event(&event),
                    Some(Err(err)) => anyhow::bail!("inotify failure: {}", err),
                    None => break,
                },

                Some(path) = empty_rx.recv() => self.on_cgroup_empty(&path),

                _ = async { tokio::time::sleep_until(delete_at.unwrap()).await },
                    if delete_at.is_some() => self.on_deferred_delete(),

                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading script");
                    self.accounting.reload();
                }
            }
        }

        // flush whatever is already queued before tearing down
        if !self.delete_queue.is_empty() {
            self.on_deferred_delete();
        }

        Ok(())
    }

    /// A watched cgroup reported `populated 0`.  `path` is absolute within
    /// the cgroup hierarchy (leading slash).
    fn on_cgroup_empty(&mut self, path: &str) {
        self.watch.group_emptied(path);

        let Some(suffix) = managed_suffix(path) else {
            // not ours
            debug!("Ignoring unmanaged '{}'", path);
            return;
        };

        let relative_path = &path[1..];

        // may already be gone; then we proceed with an empty sample
        let cgroup_fd = openat(
            &self.root_cgroup,
            relative_path,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .ok();

        let btime = cgroup_fd
            .as_ref()
            .and_then(|fd| sys::statx_birth_time(fd.as_fd()));

        let usage = cgroup_fd
            .as_ref()
            .map(read_resource_usage)
            .unwrap_or_else(CgroupResourceUsage::default);

        if let Some(line) = format_released(suffix, btime, &usage, SystemTime::now()) {
            eprintln!("{}", line);
        }

        // the handler coroutine runs concurrently; it owns the fd now
        let _ = self
            .accounting
            .invoke_cgroup_released(cgroup_fd, suffix, btime, usage);

        self.delete_queue.insert(path.to_owned());
        if self.delete_at.is_none() {
            self.delete_at = Some(Instant::now() + DELETE_DELAY);
        }
    }

    /// Deletes everything queued, deepest paths first.
    fn on_deferred_delete(&mut self) {
        self.delete_at = None;

        let queue = std::mem::take(&mut self.delete_queue);
        for path in queue.iter().rev() {
            let relative_path = &path[1..];

            match sys::unlinkat_rmdir(self.root_cgroup.as_fd(), relative_path) {
                Ok(()) => debug!("Deleted '{}'", path),

                // already gone
                Err(err) if err.raw_os_error() == Some(Errno::ENOENT as i32) => {}

                Err(err) if err.raw_os_error() == Some(Errno::EBUSY as i32) => {
                    // a new process slipped in before the rmdir; start
                    // watching the cgroup again
                    warn!("Failed to delete '{}': {}; watching it again", path, err);
                    self.watch.re_add(relative_path);
                }

                Err(err) => warn!("Failed to delete '{}': {}", path, err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_queue_drains_children_before_parents() {
        let mut queue = BTreeSet::new();
        queue.insert("/scope/X".to_owned());
        queue.insert("/scope/X/Y/Z".to_owned());
        queue.insert("/scope/X/Y".to_owned());
        queue.insert("/other".to_owned());

        let order: Vec<_> = queue.iter().rev().collect();
        assert_eq!(
            order,
            vec!["/scope/X/Y/Z", "/scope/X/Y", "/scope/X", "/other"]
        );

        // the ordering property: no extension of a path may be deleted
        // after the path itself
        for (i, path) in order.iter().enumerate() {
            for later in &order[i + 1..] {
                assert!(
                    !later.starts_with(*path),
                    "{} must be deleted before {}",
                    later,
                    path
                );
            }
        }
    }
}
