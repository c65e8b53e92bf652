//! Resource accounting for cgroup-v2 directories.
//!
//! Reads the final `cpu.stat`, `memory.peak`, `memory.events`, `pids.peak`,
//! `pids.forks` and `pids.events` counters of a cgroup that is about to be
//! deleted.  All reads are best-effort: a missing or unreadable file leaves
//! the corresponding fields unset instead of failing the sample.

use std::io::Read;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use nix::fcntl::{openat, OFlag};
use nix::sys::stat::Mode;
use tracing::debug;

/// CPU time consumed by a cgroup, from `cpu.stat`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CgroupCpuStat {
    pub total: Option<Duration>,
    pub user: Option<Duration>,
    pub system: Option<Duration>,
}

/// The final accounting sample of a released cgroup.  Every field is
/// optional; kernels without the relevant controller enabled simply do not
/// expose the file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CgroupResourceUsage {
    pub cpu: CgroupCpuStat,

    /// Peak memory usage in bytes (`memory.peak`).
    pub memory_peak: Option<u64>,

    /// Reclaim-due-to-high counter from `memory.events`.
    pub memory_events_high: Option<u64>,
    /// Reclaim-due-to-max counter from `memory.events`.
    pub memory_events_max: Option<u64>,
    /// OOM kill counter from `memory.events`.
    pub memory_events_oom: Option<u64>,

    /// Peak number of processes (`pids.peak`).
    pub pids_peak: Option<u64>,
    /// Cumulative fork count since the cgroup was created (`pids.forks`).
    pub pids_forks: Option<u64>,
    /// Number of forks rejected by the pids controller (`pids.events` "max").
    pub pids_events_max: Option<u64>,
}

/// Parses `cpu.stat`.  Key/value lines; times are microseconds.
pub fn parse_cpu_stat(content: &str) -> CgroupCpuStat {
    let mut result = CgroupCpuStat::default();

    for line in content.lines() {
        let Some((name, value)) = line.split_once(' ') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };
        let value = Duration::from_micros(value);

        match name {
            "usage_usec" => result.total = Some(value),
            "user_usec" => result.user = Some(value),
            "system_usec" => result.system = Some(value),
            _ => {}
        }
    }

    result
}

/// Parses a single-integer control file such as `memory.peak` or
/// `pids.peak`.
pub fn parse_counter(content: &str) -> Option<u64> {
    content.trim().parse().ok()
}

/// Extracts the value of `key` from a key/value-lines file such as
/// `memory.events` or `pids.events`.
pub fn parse_keyed_counter(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let (name, value) = line.split_once(' ')?;
        if name == key {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn read_control_file(cgroup_fd: BorrowedFd<'_>, name: &str) -> Option<String> {
    let fd = openat(cgroup_fd, name, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()).ok()?;

    let mut content = String::new();
    match std::fs::File::from(fd).read_to_string(&mut content) {
        Ok(_) => Some(content),
        Err(err) => {
            debug!("Failed to read {}: {}", name, err);
            None
        }
    }
}

/// Samples the resource usage counters of the cgroup directory `cgroup_fd`
/// (an `O_RDONLY|O_DIRECTORY` descriptor).
pub fn read_resource_usage<Fd: AsFd>(cgroup_fd: Fd) -> CgroupResourceUsage {
    let cgroup_fd = cgroup_fd.as_fd();
    let mut result = CgroupResourceUsage::default();

    if let Some(content) = read_control_file(cgroup_fd, "cpu.stat") {
        result.cpu = parse_cpu_stat(&content);
    }

    if let Some(content) = read_control_file(cgroup_fd, "memory.peak") {
        result.memory_peak = parse_counter(&content);
    }

    if let Some(content) = read_control_file(cgroup_fd, "memory.events") {
        result.memory_events_high = parse_keyed_counter(&content, "high");
        result.memory_events_max = parse_keyed_counter(&content, "max");
        result.memory_events_oom = parse_keyed_counter(&content, "oom");
    }

    if let Some(content) = read_control_file(cgroup_fd, "pids.peak") {
        result.pids_peak = parse_counter(&content);
    }

    if let Some(content) = read_control_file(cgroup_fd, "pids.forks") {
        result.pids_forks = parse_counter(&content);
    }

    if let Some(content) = read_control_file(cgroup_fd, "pids.events") {
        result.pids_events_max = parse_keyed_counter(&content, "max");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_stat_full() {
        let content = "usage_usec 1500000\nuser_usec 1000000\nsystem_usec 500000\nnr_periods 0\n";
        let cpu = parse_cpu_stat(content);
        assert_eq!(cpu.total, Some(Duration::from_micros(1_500_000)));
        assert_eq!(cpu.user, Some(Duration::from_secs(1)));
        assert_eq!(cpu.system, Some(Duration::from_millis(500)));
    }

    #[test]
    fn cpu_stat_partial_and_garbage() {
        let cpu = parse_cpu_stat("usage_usec 42\nbogus\nuser_usec x\n");
        assert_eq!(cpu.total, Some(Duration::from_micros(42)));
        assert_eq!(cpu.user, None);
        assert_eq!(cpu.system, None);
    }

    #[test]
    fn single_counter() {
        assert_eq!(parse_counter("134217728\n"), Some(134_217_728));
        assert_eq!(parse_counter("max\n"), None);
        assert_eq!(parse_counter(""), None);
    }

    #[test]
    fn keyed_counters() {
        let content = "low 0\nhigh 7\nmax 3\noom 1\noom_kill 1\noom_group_kill 0\n";
        assert_eq!(parse_keyed_counter(content, "high"), Some(7));
        assert_eq!(parse_keyed_counter(content, "max"), Some(3));
        assert_eq!(parse_keyed_counter(content, "oom"), Some(1));
        assert_eq!(parse_keyed_counter(content, "missing"), None);
    }

    #[test]
    fn sample_from_plain_directory_is_empty() {
        // a directory without cgroup control files yields an all-absent sample
        let dir = tempfile::tempdir().unwrap();
        let fd = nix::fcntl::open(
            dir.path(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .unwrap();
        assert_eq!(read_resource_usage(&fd), CgroupResourceUsage::default());
    }
}
