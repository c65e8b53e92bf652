//! Recursive inotify watcher over a directory tree.
//!
//! The watcher keeps a tree of [`Directory`] nodes below a base directory.
//! Nodes come in two flavors:
//!
//! - *persist* nodes form the skeleton path towards a target registered
//!   with [`TreeWatch::add`]; they survive the disappearance of the
//!   directory they mirror, so the watcher can pick the path up again when
//!   it is re-created.
//! - *all* nodes cover a fully scanned subtree; every directory appearing
//!   or disappearing below them is reported through the handler.
//!
//! Each open node holds an `O_PATH` descriptor and one inotify watch.  The
//! watch is attached through the `/proc/self/fd/N` magic link so it is
//! pinned to the descriptor we already hold instead of re-resolving the
//! path.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use inotify::{Event, EventMask, WatchDescriptor, WatchMask, Watches};
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{openat, OFlag};
use nix::sys::stat::Mode;
use tracing::{debug, warn};

/// Callbacks invoked by [`TreeWatch`] while processing filesystem events.
pub trait TreeWatchHandler {
    /// A directory appeared (or was found during a scan).  `directory_fd`
    /// is the watcher's `O_PATH` descriptor for it; it stays valid for the
    /// duration of the call.
    fn on_directory_created(&mut self, relative_path: &str, directory_fd: BorrowedFd<'_>);

    /// A tracked directory disappeared.
    fn on_directory_deleted(&mut self, relative_path: &str);

    /// Well-known non-directory names the scan may skip without attempting
    /// to open them.
    fn should_skip_name(&self, _name: &str) -> bool {
        false
    }
}

fn watch_mask() -> WatchMask {
    WatchMask::EXCL_UNLINK
        | WatchMask::ONLYDIR
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
}

fn open_path(parent: BorrowedFd<'_>, name: &str) -> nix::Result<OwnedFd> {
    openat(
        parent,
        name,
        OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{}/{}", parent, name)
    }
}

struct Directory {
    /// `O_PATH` handle, open iff the directory currently exists on disk
    /// (as far as the watcher knows).
    fd: Option<OwnedFd>,

    /// Set iff `fd` is set.
    watch: Option<WatchDescriptor>,

    children: BTreeMap<String, Directory>,

    /// Keep this node across the disappearance of its directory; it lies
    /// on the path to an explicitly added target.
    persist: bool,

    /// Scan and report the entire subtree below this node.
    all: bool,
}

impl Directory {
    fn new(persist: bool, all: bool) -> Self {
        Self {
            fd: None,
            watch: None,
            children: BTreeMap::new(),
            persist,
            all,
        }
    }
}

/// Watches a directory tree below a base directory; see the module
/// documentation.
pub struct TreeWatch {
    watches: Watches,
    root: Directory,

    /// Reverse map from inotify watch to the node's path components
    /// (empty for the root).
    by_watch: HashMap<WatchDescriptor, Vec<String>>,
}

impl TreeWatch {
    /// Creates a watcher rooted at `root_fd`, an `O_PATH` descriptor of
    /// the base directory.  `watches` must belong to the inotify instance
    /// whose events are fed into [`TreeWatch::handle_event`].
    pub fn new(mut watches: Watches, root_fd: OwnedFd) -> std::io::Result<Self> {
        let wd = Self::attach_watch(&mut watches, &root_fd)?;

        let mut root = Directory::new(true, false);
        root.fd = Some(root_fd);
        root.watch = Some(wd.clone());

        let mut by_watch = HashMap::new();
        by_watch.insert(wd, Vec::new());

        Ok(Self {
            watches,
            root,
            by_watch,
        })
    }

    fn attach_watch(watches: &mut Watches, fd: &OwnedFd) -> std::io::Result<WatchDescriptor> {
        watches.add(
            format!("/proc/self/fd/{}", fd.as_raw_fd()),
            watch_mask(),
        )
    }

    /// Registers a target path.  Skeleton nodes on the way are persistent;
    /// the terminal node's whole subtree is scanned and reported.
    pub fn add(&mut self, relative_path: &str, handler: &mut dyn TreeWatchHandler) {
        let Self {
            watches,
            root,
            by_watch,
        } = self;

        let mut dir: &mut Directory = root;
        let mut components: Vec<String> = Vec::new();

        for name in relative_path.split('/').filter(|name| !name.is_empty()) {
            let parent_fd = dir.fd.as_ref().map(|fd| fd.as_fd());
            let child = dir
                .children
                .entry(name.to_owned())
                .or_insert_with(|| Directory::new(true, false));

            components.push(name.to_owned());

            if child.fd.is_none() {
                if let Some(parent_fd) = parent_fd {
                    match open_path(parent_fd, name) {
                        Ok(fd) => {
                            Self::install(child, fd, &components, watches, by_watch)
                        }
                        Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => {}
                        Err(err) => {
                            warn!("Failed to open '{}': {}", components.join("/"), err)
                        }
                    }
                }
            }

            dir = child;
        }

        if components.is_empty() {
            return;
        }

        dir.all = true;

        if dir.fd.is_some() && dir.children.is_empty() {
            let relative_path = components.join("/");
            if let Some(fd) = dir.fd.as_ref() {
                handler.on_directory_created(&relative_path, fd.as_fd());
            }
            Self::scan_directory(dir, &components, watches, by_watch, handler);
        }
    }

    /// Assigns an open descriptor to `dir` and subscribes it.  On watch
    /// failure the descriptor is dropped again so the node stays closed.
    fn install(
        dir: &mut Directory,
        fd: OwnedFd,
        components: &[String],
        watches: &mut Watches,
        by_watch: &mut HashMap<WatchDescriptor, Vec<String>>,
    ) {
        match Self::attach_watch(watches, &fd) {
            Ok(wd) => {
                by_watch.insert(wd.clone(), components.to_vec());
                dir.watch = Some(wd);
                dir.fd = Some(fd);
            }
            Err(err) => {
                warn!("Failed to watch '{}': {}", components.join("/"), err);
            }
        }
    }

    /// Returns the open descriptor of the node at `relative_path`, if the
    /// node exists and its directory is currently open.
    pub fn find(&self, relative_path: &str) -> Option<BorrowedFd<'_>> {
        let mut dir = &self.root;
        for name in relative_path.split('/').filter(|name| !name.is_empty()) {
            dir = dir.children.get(name)?;
        }
        dir.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Feeds one inotify event into the tree.
    pub fn handle_event<S: AsRef<OsStr>>(
        &mut self,
        event: &Event<S>,
        handler: &mut dyn TreeWatchHandler,
    ) {
        // IN_IGNORED means the kernel already forgot the watch; the node
        // teardown that caused it has removed our bookkeeping too
        if !event.mask.contains(EventMask::ISDIR) || event.mask.contains(EventMask::IGNORED) {
            return;
        }

        let Some(name) = event.name.as_ref().and_then(|name| name.as_ref().to_str()) else {
            return;
        };
        if name.is_empty() {
            return;
        }

        let Some(components) = self.by_watch.get(&event.wd).cloned() else {
            return;
        };

        let Self {
            watches,
            root,
            by_watch,
        } = self;

        let Some(dir) = Self::node_mut(root, &components) else {
            return;
        };

        if event
            .mask
            .intersects(EventMask::CREATE | EventMask::MOVED_TO)
        {
            Self::handle_new_directory(dir, &components, name, watches, by_watch, handler);
        } else if event
            .mask
            .intersects(EventMask::DELETE | EventMask::MOVED_FROM)
        {
            Self::handle_deleted_directory(dir, &components, name, watches, by_watch, handler);
        }
    }

    fn node_mut<'a>(root: &'a mut Directory, components: &[String]) -> Option<&'a mut Directory> {
        let mut dir = root;
        for name in components {
            dir = dir.children.get_mut(name)?;
        }
        Some(dir)
    }

    fn handle_new_directory(
        parent: &mut Directory,
        parent_components: &[String],
        name: &str,
        watches: &mut Watches,
        by_watch: &mut HashMap<WatchDescriptor, Vec<String>>,
        handler: &mut dyn TreeWatchHandler,
    ) {
        let parent_fd = match parent.fd.as_ref() {
            Some(fd) => fd.as_fd(),
            None => return,
        };

        let child = if parent.all {
            parent
                .children
                .entry(name.to_owned())
                .or_insert_with(|| Directory::new(false, true))
        } else {
            // below a skeleton node, only expected names are of interest;
            // anything else is a transient racing path
            match parent.children.get_mut(name) {
                Some(child) => child,
                None => return,
            }
        };

        if child.fd.is_some() {
            return;
        }

        let mut components = parent_components.to_vec();
        components.push(name.to_owned());

        let fd = match open_path(parent_fd, name) {
            Ok(fd) => fd,
            Err(err) => {
                // the directory may be gone again already
                debug!("Failed to open new '{}': {}", components.join("/"), err);
                return;
            }
        };

        Self::install(child, fd, &components, watches, by_watch);
        if child.fd.is_none() {
            return;
        }

        let relative_path = components.join("/");
        if let Some(fd) = child.fd.as_ref() {
            handler.on_directory_created(&relative_path, fd.as_fd());
        }

        if child.all {
            Self::scan_directory(child, &components, watches, by_watch, handler);
        }
    }

    fn handle_deleted_directory(
        parent: &mut Directory,
        parent_components: &[String],
        name: &str,
        watches: &mut Watches,
        by_watch: &mut HashMap<WatchDescriptor, Vec<String>>,
        handler: &mut dyn TreeWatchHandler,
    ) {
        let Some(child) = parent.children.get_mut(name) else {
            return;
        };

        let relative_path = join_path(&parent_components.join("/"), name);
        Self::teardown(child, &relative_path, watches, by_watch, handler);

        if !child.persist {
            parent.children.remove(name);
        }
    }

    /// Closes a vanished node and recursively disposes its non-persistent
    /// descendants.
    fn teardown(
        dir: &mut Directory,
        relative_path: &str,
        watches: &mut Watches,
        by_watch: &mut HashMap<WatchDescriptor, Vec<String>>,
        handler: &mut dyn TreeWatchHandler,
    ) {
        if dir.all {
            handler.on_directory_deleted(relative_path);
        }

        dir.fd = None;
        if let Some(wd) = dir.watch.take() {
            by_watch.remove(&wd);
            // the kernel may have dropped the watch already (IN_IGNORED)
            let _ = watches.remove(wd);
        }

        for (name, child) in dir.children.iter_mut() {
            let child_path = join_path(relative_path, name);
            Self::teardown(child, &child_path, watches, by_watch, handler);
        }

        dir.children.retain(|_, child| child.persist);
    }

    /// Opens and reports everything below a freshly opened node.
    fn scan_directory(
        dir: &mut Directory,
        components: &[String],
        watches: &mut Watches,
        by_watch: &mut HashMap<WatchDescriptor, Vec<String>>,
        handler: &mut dyn TreeWatchHandler,
    ) {
        let dir_fd = match dir.fd.as_ref() {
            Some(fd) => fd.as_fd(),
            None => return,
        };

        let mut reader = match Dir::openat(
            dir_fd,
            ".",
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        ) {
            Ok(reader) => reader,
            Err(err) => {
                warn!("Failed to scan '{}': {}", components.join("/"), err);
                return;
            }
        };

        for entry in reader.iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Failed to read '{}': {}", components.join("/"), err);
                    break;
                }
            };

            let Ok(name) = entry.file_name().to_str() else {
                continue;
            };
            if name.starts_with('.') || handler.should_skip_name(name) {
                continue;
            }

            let fd = match open_path(dir_fd, name) {
                Ok(fd) => fd,
                // not a directory (or gone again): not an error
                Err(Errno::ENOTDIR) | Err(Errno::ENOENT) => continue,
                Err(err) => {
                    warn!(
                        "Failed to open '{}': {}",
                        join_path(&components.join("/"), name),
                        err
                    );
                    continue;
                }
            };

            let child = dir
                .children
                .entry(name.to_owned())
                .or_insert_with(|| Directory::new(false, true));
            if child.fd.is_some() {
                continue;
            }

            let mut child_components = components.to_vec();
            child_components.push(name.to_owned());

            Self::install(child, fd, &child_components, watches, by_watch);
            if child.fd.is_none() {
                continue;
            }

            let relative_path = child_components.join("/");
            if let Some(fd) = child.fd.as_ref() {
                handler.on_directory_created(&relative_path, fd.as_fd());
            }

            Self::scan_directory(child, &child_components, watches, by_watch, handler);
        }
    }

    #[cfg(test)]
    fn consistency_counts(&self) -> (usize, usize) {
        fn open_nodes(dir: &Directory) -> usize {
            usize::from(dir.fd.is_some())
                + dir.children.values().map(open_nodes).sum::<usize>()
        }

        (open_nodes(&self.root), self.by_watch.len())
    }
}
