//! Watcher for the unified (v2) cgroup hierarchy.
//!
//! Builds on [`TreeWatch`]: for every tracked cgroup directory an
//! additional poll registration on its `cgroup.events` file detects the
//! populated→empty transition.  The kernel signals a change of the
//! populated bit as priority ("exceptional") readiness on that file.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::fs::FileExt;

use inotify::{Event, Watches};
use nix::fcntl::{openat, OFlag};
use nix::sys::stat::Mode;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::treewatch::{TreeWatch, TreeWatchHandler};

/// Well-known cgroup control file names, skipped while scanning for new
/// subdirectories so they are not pointlessly open()ed.
///
/// Must stay sorted; the lookup is a binary search.
const SKIP_NAMES: &[&str] = &[
    "cgroup.controllers",
    "cgroup.events",
    "cgroup.freeze",
    "cgroup.kill",
    "cgroup.max.depth",
    "cgroup.max.descendants",
    "cgroup.pressure",
    "cgroup.procs",
    "cgroup.stat",
    "cgroup.subtree_control",
    "cgroup.threads",
    "cgroup.type",
    "cpu.idle",
    "cpu.max",
    "cpu.max.burst",
    "cpu.pressure",
    "cpu.stat",
    "cpu.stat.local",
    "cpu.weight",
    "cpu.weight.nice",
    "io.bfq.weight",
    "io.latency",
    "io.pressure",
    "io.prio.class",
    "io.stat",
    "io.weight",
    "memory.current",
    "memory.events",
    "memory.events.local",
    "memory.high",
    "memory.low",
    "memory.max",
    "memory.min",
    "memory.numa_stat",
    "memory.oom.group",
    "memory.peak",
    "memory.pressure",
    "memory.reclaim",
    "memory.stat",
    "pids.current",
    "pids.events",
    "pids.events.local",
    "pids.forks",
    "pids.max",
    "pids.peak",
];

/// Reads `cgroup.events` and reports whether the cgroup (or any
/// descendant) still contains processes.  Read failures count as "not
/// populated".
fn is_populated(events_file: &File) -> bool {
    let mut buffer = [0u8; 4096];
    let Ok(nbytes) = events_file.read_at(&mut buffer, 0) else {
        return false;
    };

    const NEEDLE: &[u8] = b"populated 0";
    !buffer[..nbytes]
        .windows(NEEDLE.len())
        .any(|window| window == NEEDLE)
}

/// One populated-watch registration; dropping it cancels the poll task.
struct Group {
    task: JoinHandle<()>,
}

impl Drop for Group {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_group(
    events_file: File,
    relative_path: String,
    empty_tx: UnboundedSender<String>,
    check_now: bool,
) {
    // after a lost deletion race the file's current state is
    // authoritative: the cgroup may have emptied again before the watch
    // was re-created, and no further transition would be signaled
    if check_now && !is_populated(&events_file) {
        let _ = empty_tx.send(format!("/{}", relative_path));
        return;
    }

    let events_fd = match AsyncFd::with_interest(events_file, Interest::PRIORITY | Interest::ERROR)
    {
        Ok(fd) => fd,
        Err(err) => {
            warn!("Failed to poll cgroup.events of '{}': {}", relative_path, err);
            return;
        }
    };

    loop {
        let mut guard = match events_fd.ready(Interest::PRIORITY | Interest::ERROR).await {
            Ok(guard) => guard,
            Err(_) => return,
        };
        guard.clear_ready();

        if !is_populated(events_fd.get_ref()) {
            let _ = empty_tx.send(format!("/{}", relative_path));
            return;
        }

        // the populated bit flipped to 1: spurious for our purposes
        debug!("'{}' became populated", relative_path);
    }
}

/// Per-cgroup bookkeeping, fed by [`TreeWatch`] callbacks.
struct GroupTable {
    groups: HashMap<String, Group>,

    /// Set while an explicit `add_cgroup()` initial scan is running; a
    /// pre-existing cgroup that is already empty must not be reaped solely
    /// by virtue of its prior state, so the initial event is discarded.
    in_add: bool,

    empty_tx: UnboundedSender<String>,
}

impl GroupTable {
    fn insert_group(
        &mut self,
        relative_path: &str,
        directory_fd: BorrowedFd<'_>,
        discard: bool,
        check_now: bool,
    ) {
        let events_fd = match openat(
            directory_fd,
            "cgroup.events",
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        ) {
            Ok(fd) => fd,
            Err(err) => {
                warn!(
                    "Failed to open cgroup.events of '{}': {}",
                    relative_path, err
                );
                return;
            }
        };

        let events_file = File::from(events_fd);
        if discard {
            // reading resets the pending notification on this open file
            let _ = is_populated(&events_file);
        }

        let task = tokio::task::spawn_local(watch_group(
            events_file,
            relative_path.to_owned(),
            self.empty_tx.clone(),
            check_now,
        ));

        self.groups.insert(relative_path.to_owned(), Group { task });
    }
}

impl TreeWatchHandler for GroupTable {
    fn on_directory_created(&mut self, relative_path: &str, directory_fd: BorrowedFd<'_>) {
        self.insert_group(relative_path, directory_fd, self.in_add, false);
    }

    fn on_directory_deleted(&mut self, relative_path: &str) {
        self.groups.remove(relative_path);
    }

    fn should_skip_name(&self, name: &str) -> bool {
        SKIP_NAMES.binary_search(&name).is_ok()
    }
}

/// Detects cgroups becoming empty below a set of managed scopes.  Emits
/// the absolute ("/"-prefixed) cgroup path on the channel passed to
/// [`CgroupWatch::new`] whenever a watched cgroup reports `populated 0`.
pub struct CgroupWatch {
    tree: TreeWatch,
    table: GroupTable,
}

impl CgroupWatch {
    /// `cgroup_root` is an `O_PATH` descriptor of the cgroup2 mount point;
    /// `watches` must belong to the inotify instance whose events are fed
    /// into [`CgroupWatch::handle_event`].
    ///
    /// Must be called within a tokio `LocalSet`; the per-group poll tasks
    /// are spawned locally.
    pub fn new(
        watches: Watches,
        cgroup_root: OwnedFd,
        empty_tx: UnboundedSender<String>,
    ) -> io::Result<Self> {
        Ok(Self {
            tree: TreeWatch::new(watches, cgroup_root)?,
            table: GroupTable {
                groups: HashMap::new(),
                in_add: false,
                empty_tx,
            },
        })
    }

    /// Registers a managed scope (relative path, no leading slash) and
    /// scans whatever exists below it.
    pub fn add_cgroup(&mut self, relative_path: &str) {
        self.table.in_add = true;
        self.tree.add(relative_path, &mut self.table);
        self.table.in_add = false;
    }

    /// Re-creates the populated watch for a cgroup that is still tracked
    /// by the tree watcher.  Used after a deletion attempt lost the race
    /// against a new process entering the cgroup: the file's current state
    /// is authoritative, so no event is discarded.
    pub fn re_add(&mut self, relative_path: &str) {
        if let Some(fd) = self.tree.find(relative_path) {
            self.table.insert_group(relative_path, fd, false, true);
        }
    }

    /// Forgets the populated watch of a cgroup whose emptiness was just
    /// reported.  The entry is re-inserted if the directory reappears.
    pub fn group_emptied(&mut self, absolute_path: &str) {
        let relative_path = absolute_path.strip_prefix('/').unwrap_or(absolute_path);
        self.table.groups.remove(relative_path);
    }

    /// Feeds one inotify event into the watcher.
    pub fn handle_event<S: AsRef<std::ffi::OsStr>>(&mut self, event: &Event<S>) {
        self.tree.handle_event(event, &mut self.table);
    }

    #[cfg(test)]
    fn has_group(&self, relative_path: &str) -> bool {
        self.table.groups.contains_key(relative_path)
    }

    #[cfg(test)]
    fn group_count(&self) -> usize {
        self.table.groups.len()
    }
}
