//! Service-supervisor integration: socket activation and readiness
//! notification, implemented without linking libsystemd.

use std::env;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    sendto, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr,
};
use tracing::debug;

/// The first file descriptor passed by the supervisor.
const LISTEN_FDS_START: RawFd = 3;

/// Collects listener sockets passed down by the service supervisor
/// (`LISTEN_PID`/`LISTEN_FDS`).  Returns an empty list when not
/// socket-activated.  The environment variables are cleared so child
/// processes do not inherit them.
pub fn listen_fds() -> Vec<OwnedFd> {
    let pid_ok = env::var("LISTEN_PID")
        .ok()
        .and_then(|s| s.parse::<i32>().ok())
        .is_some_and(|pid| pid == nix::unistd::getpid().as_raw());

    let n = env::var("LISTEN_FDS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(0);

    env::remove_var("LISTEN_PID");
    env::remove_var("LISTEN_FDS");
    env::remove_var("LISTEN_FDNAMES");

    if !pid_ok || n == 0 {
        return Vec::new();
    }

    (0..n)
        .map(|i| {
            let fd = LISTEN_FDS_START + i as RawFd;
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                // SAFETY: the supervisor handed these descriptors to us;
                // nothing else in this process owns them.
                OwnedFd::from_raw_fd(fd)
            }
        })
        .collect()
}

/// Tells the supervisor that the service is ready (`NOTIFY_SOCKET`).
/// Best-effort; failures are logged at debug level only.
pub fn notify_ready() {
    let Ok(path) = env::var("NOTIFY_SOCKET") else {
        return;
    };

    let addr = if let Some(abstract_name) = path.strip_prefix('@') {
        UnixAddr::new_abstract(abstract_name.as_bytes())
    } else {
        UnixAddr::new(path.as_str())
    };

    let result = addr.and_then(|addr| {
        let sock = socket(
            AddressFamily::Unix,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        sendto(sock.as_raw_fd(), b"READY=1", &addr, MsgFlags::empty())
    });

    if let Err(err) = result {
        debug!("Failed to notify supervisor: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_activation_without_env() {
        // the test runner was not socket-activated
        assert!(listen_fds().is_empty());
    }
}
