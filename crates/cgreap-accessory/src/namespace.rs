//! The namespace factory: manufactures and pools kernel namespace handles
//! keyed by client-supplied names.
//!
//! A namespace file descriptor keeps its namespace alive independently of
//! any process, so each handle is created once by a short-lived carrier
//! child and cached until the record expires.  Only the PID namespace
//! needs a long-lived init process; its pidfd is watched so the cache can
//! be invalidated when that init dies.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::rc::Rc;
use std::time::Duration;

use nix::fcntl::{open, OFlag};
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{pipe2, Pid};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cgreap_core::protocol::{CLONE_NEWIPC, CLONE_NEWPID, CLONE_NEWUSER};
use cgreap_core::sys;

use crate::request::{split_user_payload, SpawnRequest};

/// How long an unleased record survives before it is discarded.
const DEFAULT_IDLE_EXPIRY: Duration = Duration::from_secs(60);

/// Stack size for carrier children; they only close an fd and block in
/// read().
const CARRIER_STACK_SIZE: usize = 64 * 1024;

/// Aborts the wrapped task when dropped.
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A short-lived child born into the requested namespaces.  It blocks on a
/// pipe; dropping the carrier closes the pipe (letting the child exit) and
/// reaps it.
struct Carrier {
    pid: Pid,
    release: Option<OwnedFd>,
}

fn spawn_carrier(flags: CloneFlags) -> nix::Result<Carrier> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
    let read_raw = read_end.as_raw_fd();
    let write_raw = write_end.as_raw_fd();

    let mut stack = vec![0u8; CARRIER_STACK_SIZE];
    let pid = unsafe {
        nix::sched::clone(
            Box::new(move || {
                // close the inherited copy of the write end, then wait for
                // the parent to close the real one
                unsafe {
                    libc::close(write_raw);
                    let mut byte = 0u8;
                    libc::read(read_raw, std::ptr::addr_of_mut!(byte).cast(), 1);
                }
                0
            }),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    }?;

    drop(read_end);

    Ok(Carrier {
        pid,
        release: Some(write_end),
    })
}

impl Carrier {
    fn open_ns(&self, kind: &str) -> nix::Result<OwnedFd> {
        open(
            format!("/proc/{}/ns/{}", self.pid, kind).as_str(),
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
    }

    fn write_map(&self, which: &str, payload: &[u8]) -> io::Result<()> {
        std::fs::write(format!("/proc/{}/{}", self.pid, which), payload)
    }
}

impl Drop for Carrier {
    fn drop(&mut self) {
        self.release.take();
        let _ = waitpid(self.pid, None);
    }
}

/// The init process of a pooled PID namespace.
struct PidNamespace {
    ns_fd: OwnedFd,
    init_pid: Pid,
    pidfd: OwnedFd,

    /// Watches the pidfd; clears the cache when the init dies.
    _watch: TaskGuard,
}

impl Drop for PidNamespace {
    fn drop(&mut self) {
        // best effort; the init may already be gone
        let _ = sys::pidfd_send_signal(self.pidfd.as_fd(), libc::SIGTERM);
        let _ = waitpid(self.init_pid, None);
    }
}

/// One lease pipe; the write end is with the client, the read end is
/// watched for hang-up here.
struct Lease {
    _watch: TaskGuard,
}

/// The pooled handles of one name.
struct Namespace {
    name: String,

    ipc_ns: Option<OwnedFd>,
    pid_ns: Option<PidNamespace>,
    user_namespaces: HashMap<Vec<u8>, OwnedFd>,

    leases: HashMap<u64, Lease>,
    next_lease_id: u64,

    /// Pending idle-expiry timer; set iff no lease is held.
    expiry: Option<TaskGuard>,
}

impl Namespace {
    fn new(name: String) -> Self {
        Self {
            name,
            ipc_ns: None,
            pid_ns: None,
            user_namespaces: HashMap::new(),
            leases: HashMap::new(),
            next_lease_id: 0,
            expiry: None,
        }
    }

    fn make_ipc(&mut self) -> Result<&OwnedFd, String> {
        if self.ipc_ns.is_none() {
            let carrier = spawn_carrier(CloneFlags::CLONE_NEWIPC)
                .map_err(|err| format!("clone(CLONE_NEWIPC) failed: {}", err))?;
            let fd = carrier
                .open_ns("ipc")
                .map_err(|err| format!("Failed to open IPC namespace: {}", err))?;

            debug!("'{}': new IPC namespace", self.name);
            self.ipc_ns = Some(fd);
        }

        Ok(self.ipc_ns.as_ref().unwrap())
    }

    fn make_user(&mut self, payload: &[u8]) -> Result<&OwnedFd, String> {
        if !self.user_namespaces.contains_key(payload) {
            let carrier = spawn_carrier(CloneFlags::CLONE_NEWUSER)
                .map_err(|err| format!("clone(CLONE_NEWUSER) failed: {}", err))?;

            let (uid_map, gid_map) = split_user_payload(payload);
            if !uid_map.is_empty() {
                carrier
                    .write_map("uid_map", uid_map)
                    .map_err(|err| format!("Failed to write uid_map: {}", err))?;
            }
            if !gid_map.is_empty() {
                carrier
                    .write_map("gid_map", gid_map)
                    .map_err(|err| format!("Failed to write gid_map: {}", err))?;
            }

            let fd = carrier
                .open_ns("user")
                .map_err(|err| format!("Failed to open user namespace: {}", err))?;

            debug!("'{}': new user namespace", self.name);
            self.user_namespaces.insert(payload.to_vec(), fd);
        }

        Ok(&self.user_namespaces[payload])
    }

    fn make_pid(&mut self, map: &NamespaceMap) -> Result<&OwnedFd, String> {
        if self.pid_ns.is_none() {
            self.pid_ns = Some(
                spawn_pid_init(&self.name, map)
                    .map_err(|err| format!("Failed to create PID namespace: {}", err))?,
            );
        }

        Ok(&self.pid_ns.as_ref().unwrap().ns_fd)
    }

    fn make_lease(&mut self, map: &NamespaceMap) -> Result<OwnedFd, String> {
        let (read_end, write_end) =
            pipe2(OFlag::O_CLOEXEC).map_err(|err| format!("pipe2() failed: {}", err))?;

        // only our end may be non-blocking; the client gets a regular pipe
        unsafe {
            libc::fcntl(read_end.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK);
        }

        let id = self.next_lease_id;
        self.next_lease_id += 1;

        let task = tokio::task::spawn_local(watch_lease(
            read_end,
            self.name.clone(),
            id,
            map.clone(),
        ));
        self.leases.insert(id, Lease { _watch: TaskGuard(task) });

        Ok(write_end)
    }

    /// Re-arms or cancels the idle-expiry timer depending on whether any
    /// lease is held.  Called after every request touching this record and
    /// after every lease release.
    fn update_expiry(&mut self, map: &NamespaceMap) {
        self.expiry = None;

        if self.leases.is_empty() {
            let name = self.name.clone();
            let map = map.clone();
            let idle_expiry = map.idle_expiry;
            let task = tokio::task::spawn_local(async move {
                tokio::time::sleep(idle_expiry).await;
                map.expire(&name);
            });
            self.expiry = Some(TaskGuard(task));
        }
    }
}

fn spawn_pid_init(name: &str, map: &NamespaceMap) -> io::Result<PidNamespace> {
    let mut stack = vec![0u8; CARRIER_STACK_SIZE];
    let init_pid = unsafe {
        nix::sched::clone(
            Box::new(|| {
                // init of the new PID namespace: let the kernel reap its
                // orphans, then sleep until SIGTERM
                unsafe {
                    libc::signal(libc::SIGCHLD, libc::SIG_IGN);
                    loop {
                        libc::pause();
                    }
                }
            }),
            &mut stack,
            CloneFlags::CLONE_NEWPID,
            Some(libc::SIGCHLD),
        )
    }
    .map_err(io::Error::from)?;

    let result = (|| -> io::Result<(OwnedFd, OwnedFd)> {
        let pidfd = sys::pidfd_open(init_pid)?;
        let ns_fd = open(
            format!("/proc/{}/ns/pid", init_pid).as_str(),
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        Ok((pidfd, ns_fd))
    })();

    match result {
        Ok((pidfd, ns_fd)) => {
            let watch = tokio::task::spawn_local(watch_pid_init(
                pidfd.try_clone()?,
                name.to_owned(),
                map.clone(),
            ));

            debug!("'{}': new PID namespace, init pid {}", name, init_pid);
            Ok(PidNamespace {
                ns_fd,
                init_pid,
                pidfd,
                _watch: TaskGuard(watch),
            })
        }
        Err(err) => {
            let _ = nix::sys::signal::kill(init_pid, nix::sys::signal::Signal::SIGTERM);
            let _ = waitpid(init_pid, None);
            Err(err)
        }
    }
}

/// Waits for the PID namespace init to exit, reaps it and invalidates the
/// cached handle so the next request creates a fresh namespace.
async fn watch_pid_init(pidfd: OwnedFd, name: String, map: NamespaceMap) {
    let pidfd = match AsyncFd::with_interest(pidfd, Interest::READABLE) {
        Ok(fd) => fd,
        Err(err) => {
            warn!("Failed to poll pidfd of '{}': {}", name, err);
            return;
        }
    };

    // a pidfd becomes readable when the process exits
    if pidfd.readable().await.is_err() {
        return;
    }

    match waitid(
        Id::PIDFd(pidfd.get_ref().as_fd()),
        WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG,
    ) {
        Ok(WaitStatus::Exited(pid, status)) => {
            info!("'{}': PID namespace init {} exited with status {}", name, pid, status)
        }
        Ok(WaitStatus::Signaled(pid, signal, _)) => {
            info!("'{}': PID namespace init {} killed by {}", name, pid, signal)
        }
        Ok(_) => {}
        Err(err) => debug!("waitid failed for '{}': {}", name, err),
    }

    map.on_pid_init_exit(&name);
}

/// Waits for the client to close its copy of the lease pipe's write end.
async fn watch_lease(read_end: OwnedFd, name: String, id: u64, map: NamespaceMap) {
    let read_end = File::from(read_end);
    let read_end = match AsyncFd::with_interest(read_end, Interest::READABLE) {
        Ok(fd) => fd,
        Err(err) => {
            warn!("Failed to poll lease pipe of '{}': {}", name, err);
            return;
        }
    };

    'outer: loop {
        let mut guard = match read_end.readable().await {
            Ok(guard) => guard,
            Err(_) => break,
        };

        // drain; EOF means every write end is closed
        let mut buffer = [0u8; 64];
        loop {
            match (&*read_end.get_ref()).read(&mut buffer) {
                Ok(0) => break 'outer,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    guard.clear_ready();
                    break;
                }
                Err(_) => break 'outer,
            }
        }
    }

    debug!("'{}': lease {} released", name, id);
    map.on_lease_released(&name, id);
}

/// The handles prepared for one response, already duplicated out of the
/// cache; sending attaches them as `SCM_RIGHTS` and the kernel duplicates
/// them once more into the peer.
#[derive(Default, Debug)]
pub struct PreparedHandles {
    /// nstype values in response order ({IPC, PID, USER} filtered by the
    /// request); `fds` holds the matching descriptors.
    pub nstypes: Vec<u32>,
    pub fds: Vec<OwnedFd>,
    pub lease: Option<OwnedFd>,
}

struct Inner {
    map: HashMap<String, Namespace>,
}

/// The table of pooled namespace records.  Cheaply cloneable; all clones
/// share the same single-threaded state.
#[derive(Clone)]
pub struct NamespaceMap {
    inner: Rc<RefCell<Inner>>,
    idle_expiry: Duration,
}

impl NamespaceMap {
    pub fn new() -> Self {
        Self::with_idle_expiry(DEFAULT_IDLE_EXPIRY)
    }

    /// The idle window is configurable for tests.
    pub fn with_idle_expiry(idle_expiry: Duration) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                map: HashMap::new(),
            })),
            idle_expiry,
        }
    }

    /// Executes a validated request: looks up or creates the record and
    /// materializes the requested handles.  The error string goes back to
    /// the client verbatim.
    pub fn process(&self, request: &SpawnRequest) -> Result<PreparedHandles, String> {
        let name = request.require_name().map_err(|err| err.to_string())?;

        let mut inner = self.inner.borrow_mut();
        let ns = inner
            .map
            .entry(name.to_owned())
            .or_insert_with(|| Namespace::new(name.to_owned()));

        let result = (|| {
            let mut prepared = PreparedHandles::default();

            if request.ipc_namespace {
                let fd = ns.make_ipc()?;
                prepared.nstypes.push(CLONE_NEWIPC);
                prepared
                    .fds
                    .push(fd.try_clone().map_err(|err| err.to_string())?);
            }

            if request.pid_namespace {
                let fd = ns.make_pid(self)?;
                prepared.nstypes.push(CLONE_NEWPID);
                prepared
                    .fds
                    .push(fd.try_clone().map_err(|err| err.to_string())?);
            }

            if let Some(payload) = &request.user_namespace {
                let fd = ns.make_user(payload)?;
                prepared.nstypes.push(CLONE_NEWUSER);
                prepared
                    .fds
                    .push(fd.try_clone().map_err(|err| err.to_string())?);
            }

            if request.lease_pipe {
                prepared.lease = Some(ns.make_lease(self)?);
            }

            Ok(prepared)
        })();

        ns.update_expiry(self);
        result
    }

    /// Discards every record, terminating the pooled PID namespace init
    /// processes.
    pub fn clear(&self) {
        self.inner.borrow_mut().map.clear();
    }

    fn on_pid_init_exit(&self, name: &str) {
        let mut inner = self.inner.borrow_mut();
        if let Some(ns) = inner.map.get_mut(name) {
            // dropping the cache entry; Drop's SIGTERM and waitpid find an
            // already-reaped process and fail silently
            ns.pid_ns = None;
        }
    }

    fn on_lease_released(&self, name: &str, id: u64) {
        let mut inner = self.inner.borrow_mut();
        let Some(ns) = inner.map.get_mut(name) else {
            return;
        };

        ns.leases.remove(&id);
        if ns.leases.is_empty() {
            let map = self.clone();
            ns.update_expiry(&map);
        }
    }

    fn expire(&self, name: &str) {
        let mut inner = self.inner.borrow_mut();
        let Some(ns) = inner.map.get(name) else {
            return;
        };

        if !ns.leases.is_empty() {
            return;
        }

        info!("'{}': expired", name);
        inner.map.remove(name);
    }

    #[cfg(test)]
    fn contains(&self, name: &str) -> bool {
        self.inner.borrow().map.contains_key(name)
    }

    #[cfg(test)]
    fn lease_count(&self, name: &str) -> usize {
        self.inner
            .borrow()
            .map
            .get(name)
            .map_or(0, |ns| ns.leases.len())
    }
}

impl Default for NamespaceMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    fn lease_request(name: &str) -> SpawnRequest {
        SpawnRequest {
            name: Some(name.to_owned()),
            lease_pipe: true,
            ..Default::default()
        }
    }

    #[test]
    fn missing_name_is_rejected() {
        let map = NamespaceMap::new();
        let request = SpawnRequest {
            ipc_namespace: true,
            ..Default::default()
        };
        assert_eq!(map.process(&request).unwrap_err(), "No NAME");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lease_keeps_record_alive() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let idle = Duration::from_millis(50);
                let map = NamespaceMap::with_idle_expiry(idle);

                let prepared = map.process(&lease_request("tenant-c")).unwrap();
                let client_end = prepared.lease.unwrap();
                assert!(prepared.nstypes.is_empty());
                assert!(map.contains("tenant-c"));
                assert_eq!(map.lease_count("tenant-c"), 1);

                // the record survives well past the idle window while the
                // lease is held
                tokio::time::sleep(idle * 3).await;
                assert!(map.contains("tenant-c"));

                // closing the write end releases the lease; the record
                // expires one idle window later
                drop(client_end);
                tokio::time::sleep(idle / 2).await;
                assert_eq!(map.lease_count("tenant-c"), 0);
                assert!(map.contains("tenant-c"));

                tokio::time::sleep(idle * 2).await;
                assert!(!map.contains("tenant-c"));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unleased_record_expires_once() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let idle = Duration::from_millis(50);
                let map = NamespaceMap::with_idle_expiry(idle);

                // a request without a lease arms the expiry immediately
                let request = SpawnRequest {
                    name: Some("tenant-x".to_owned()),
                    ..Default::default()
                };
                let prepared = map.process(&request).unwrap();
                assert!(prepared.nstypes.is_empty());
                assert!(map.contains("tenant-x"));

                tokio::time::sleep(idle * 2).await;
                assert!(!map.contains("tenant-x"));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn new_request_resets_idle_window() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let idle = Duration::from_millis(80);
                let map = NamespaceMap::with_idle_expiry(idle);

                let request = SpawnRequest {
                    name: Some("tenant-y".to_owned()),
                    ..Default::default()
                };
                map.process(&request).unwrap();

                // keep touching the record more often than the idle window
                for _ in 0..3 {
                    tokio::time::sleep(idle / 2).await;
                    map.process(&request).unwrap();
                    assert!(map.contains("tenant-y"));
                }

                tokio::time::sleep(idle * 2).await;
                assert!(!map.contains("tenant-y"));
            })
            .await;
    }

    /// Creating real namespaces needs privileges; exercised only as root.
    #[tokio::test(flavor = "current_thread")]
    async fn ipc_namespace_is_deduplicated() {
        if !nix::unistd::Uid::effective().is_root() {
            eprintln!("skipping: requires root");
            return;
        }

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let map = NamespaceMap::new();
                let request = SpawnRequest {
                    name: Some("tenant-a".to_owned()),
                    ipc_namespace: true,
                    ..Default::default()
                };

                let first = map.process(&request).unwrap();
                let second = map.process(&request).unwrap();
                assert_eq!(first.nstypes, vec![CLONE_NEWIPC]);
                assert_eq!(second.nstypes, vec![CLONE_NEWIPC]);

                let ino = |fd: &OwnedFd| {
                    File::from(fd.try_clone().unwrap()).metadata().unwrap().ino()
                };
                assert_eq!(ino(&first.fds[0]), ino(&second.fds[0]));
            })
            .await;
    }
}
