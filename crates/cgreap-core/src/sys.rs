//! Thin wrappers around Linux syscalls that `nix` does not wrap.

use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::unistd::Pid;

/// Queries the birth time of the file referred to by `fd` via `statx()`.
///
/// Returns `None` when the filesystem does not report a birth time (the
/// kernel may omit `STATX_BTIME` on cgroupfs depending on version) or when
/// the call fails; callers treat the value as best-effort.
pub fn statx_birth_time(fd: BorrowedFd<'_>) -> Option<SystemTime> {
    let mut stx = MaybeUninit::<libc::statx>::uninit();
    let rc = unsafe {
        libc::statx(
            fd.as_raw_fd(),
            c"".as_ptr(),
            libc::AT_EMPTY_PATH | libc::AT_STATX_FORCE_SYNC,
            libc::STATX_BTIME,
            stx.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return None;
    }

    // SAFETY: statx() returned success, so the buffer is initialized.
    let stx = unsafe { stx.assume_init() };
    if stx.stx_mask & libc::STATX_BTIME == 0 || stx.stx_btime.tv_sec < 0 {
        return None;
    }

    Some(
        UNIX_EPOCH
            + Duration::new(stx.stx_btime.tv_sec as u64, stx.stx_btime.tv_nsec),
    )
}

/// Reads the extended attribute `name` from the open file `fd`.
///
/// Returns `None` when the attribute does not exist or cannot be read.
pub fn fgetxattr(fd: BorrowedFd<'_>, name: &str) -> Option<Vec<u8>> {
    let name = CString::new(name).ok()?;

    let size = unsafe {
        libc::fgetxattr(fd.as_raw_fd(), name.as_ptr(), std::ptr::null_mut(), 0)
    };
    if size < 0 {
        return None;
    }

    let mut buffer = vec![0u8; size as usize];
    let nbytes = unsafe {
        libc::fgetxattr(
            fd.as_raw_fd(),
            name.as_ptr(),
            buffer.as_mut_ptr().cast(),
            buffer.len(),
        )
    };
    if nbytes < 0 {
        return None;
    }

    buffer.truncate(nbytes as usize);
    Some(buffer)
}

/// Removes the directory `path` relative to `dirfd`
/// (`unlinkat(2)` with `AT_REMOVEDIR`).
pub fn unlinkat_rmdir(dirfd: BorrowedFd<'_>, path: &str) -> io::Result<()> {
    let path = CString::new(path).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

    let rc = unsafe { libc::unlinkat(dirfd.as_raw_fd(), path.as_ptr(), libc::AT_REMOVEDIR) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Obtains a pidfd referring to `pid` (`pidfd_open(2)`).
pub fn pidfd_open(pid: Pid) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0u32) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: the kernel just returned this fd to us.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

/// Sends `signal` to the process referred to by `pidfd`
/// (`pidfd_send_signal(2)`).
pub fn pidfd_send_signal(pidfd: BorrowedFd<'_>, signal: i32) -> io::Result<()> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd.as_raw_fd(),
            signal,
            std::ptr::null_mut::<libc::siginfo_t>(),
            0u32,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn birth_time_of_fresh_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        if let Some(btime) = statx_birth_time(file.as_file().as_fd()) {
            // tmpfs reports btime on all recent kernels; it must be recent
            let age = SystemTime::now().duration_since(btime).unwrap();
            assert!(age < Duration::from_secs(60));
        }
    }

    #[test]
    fn missing_xattr_is_none() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(fgetxattr(file.as_file().as_fd(), "user.does-not-exist"), None);
    }

    #[test]
    fn pidfd_refers_to_self() {
        let pidfd = pidfd_open(nix::unistd::getpid()).unwrap();
        assert!(pidfd.as_raw_fd() >= 0);
    }
}
