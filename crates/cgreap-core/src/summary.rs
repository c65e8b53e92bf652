//! Formats the one-line report emitted for every released cgroup.
//!
//! The format is stable; consumers grep these lines out of the journal:
//!
//! ```text
//! app-42/leaf: since=2026-07-01T10:00:00Z cpu=1.5s/1.0s/0.5s[3%] memory=128M forks=17[2.1/m]
//! ```

use std::fmt::Write;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use crate::accounting::CgroupResourceUsage;

/// Appends `[N%]` when the age is known and the percentage is non-zero.
fn maybe_percent(out: &mut String, usage: Duration, age: Option<Duration>) {
    let Some(age) = age.filter(|age| !age.is_zero()) else {
        return;
    };

    let percent = (100.0 * usage.as_secs_f64() / age.as_secs_f64()) as u64;
    if percent > 0 {
        let _ = write!(out, "[{}%]", percent);
    }
}

/// Appends `[R/s]` or `[R/m]` for an event counter over the cgroup's
/// lifetime.  Rates below 0.01/s are not worth printing.
fn maybe_rate(out: &mut String, n: u64, age: Option<Duration>) {
    let Some(age) = age.filter(|age| !age.is_zero()) else {
        return;
    };

    let rate = n as f64 / age.as_secs_f64();
    if rate >= 1.0 {
        let _ = write!(out, "[{:.0}/s]", rate);
    } else if rate >= 0.01 {
        let _ = write!(out, "[{:.1}/m]", rate * 60.0);
    }
}

/// Formats the release summary for a cgroup, or `None` when no field at all
/// is known (nothing worth reporting).
///
/// `suffix` is the scope-relative path; `now` is passed in so tests can pin
/// the age computation.
pub fn format_released(
    suffix: &str,
    btime: Option<SystemTime>,
    usage: &CgroupResourceUsage,
    now: SystemTime,
) -> Option<String> {
    let mut out = String::new();

    let age = btime.and_then(|btime| {
        let btime_utc: DateTime<Utc> = btime.into();
        let _ = write!(out, " since={}", btime_utc.format("%Y-%m-%dT%H:%M:%SZ"));
        now.duration_since(btime).ok()
    });

    if usage.cpu.user.is_some() || usage.cpu.system.is_some() {
        let user = usage.cpu.user.unwrap_or_default();
        let system = usage.cpu.system.unwrap_or_default();
        let total = usage.cpu.total.unwrap_or(user + system);

        let _ = write!(
            out,
            " cpu={:.1}s/{:.1}s/{:.1}s",
            total.as_secs_f64(),
            user.as_secs_f64(),
            system.as_secs_f64()
        );
        maybe_percent(&mut out, total, age);
    } else if let Some(total) = usage.cpu.total {
        let _ = write!(out, " cpu={:.1}s", total.as_secs_f64());
        maybe_percent(&mut out, total, age);
    }

    if let Some(peak) = usage.memory_peak {
        const MEGA: u64 = 1024 * 1024;
        let _ = write!(out, " memory={}M", (peak + MEGA / 2 - 1) / MEGA);
    }

    let reclaim =
        usage.memory_events_high.unwrap_or(0) + usage.memory_events_max.unwrap_or(0);
    if reclaim > 0 {
        let _ = write!(out, " reclaim={}", reclaim);
    }

    if let Some(oom) = usage.memory_events_oom.filter(|&n| n > 0) {
        let _ = write!(out, " oom={}", oom);
    }

    if let Some(peak) = usage.pids_peak {
        let _ = write!(out, " procs={}", peak);
    }

    if let Some(forks) = usage.pids_forks {
        let _ = write!(out, " forks={}", forks);
        maybe_rate(&mut out, forks, age);
    }

    if let Some(rejected) = usage.pids_events_max.filter(|&n| n > 0) {
        let _ = write!(out, " procs_rejected={}", rejected);
    }

    if out.is_empty() {
        None
    } else {
        Some(format!("{}:{}", suffix, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::CgroupCpuStat;

    fn btime_and_now(age_secs: u64) -> (SystemTime, SystemTime) {
        let btime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        (btime, btime + Duration::from_secs(age_secs))
    }

    #[test]
    fn empty_usage_yields_nothing() {
        let usage = CgroupResourceUsage::default();
        assert_eq!(
            format_released("app", None, &usage, SystemTime::UNIX_EPOCH),
            None
        );
    }

    #[test]
    fn full_line() {
        let (btime, now) = btime_and_now(100);
        let usage = CgroupResourceUsage {
            cpu: CgroupCpuStat {
                total: Some(Duration::from_secs_f64(5.0)),
                user: Some(Duration::from_secs_f64(3.5)),
                system: Some(Duration::from_secs_f64(1.5)),
            },
            memory_peak: Some(128 * 1024 * 1024),
            memory_events_high: Some(2),
            memory_events_max: Some(1),
            memory_events_oom: Some(1),
            pids_peak: Some(4),
            pids_forks: Some(200),
            pids_events_max: Some(3),
        };

        let line = format_released("app-42/leaf", Some(btime), &usage, now).unwrap();
        assert_eq!(
            line,
            "app-42/leaf: since=2023-11-14T22:13:20Z \
             cpu=5.0s/3.5s/1.5s[5%] memory=128M reclaim=3 oom=1 \
             procs=4 forks=200[2/s] procs_rejected=3"
        );
    }

    #[test]
    fn total_only_cpu() {
        let usage = CgroupResourceUsage {
            cpu: CgroupCpuStat {
                total: Some(Duration::from_secs(2)),
                ..Default::default()
            },
            ..Default::default()
        };
        let line = format_released("x", None, &usage, SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(line, "x: cpu=2.0s");
    }

    #[test]
    fn total_derived_from_user_and_system() {
        let usage = CgroupResourceUsage {
            cpu: CgroupCpuStat {
                total: None,
                user: Some(Duration::from_secs(1)),
                system: Some(Duration::from_secs(2)),
            },
            ..Default::default()
        };
        let line = format_released("x", None, &usage, SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(line, "x: cpu=3.0s/1.0s/2.0s");
    }

    #[test]
    fn memory_rounds_up_to_mebibytes() {
        let usage = CgroupResourceUsage {
            memory_peak: Some(1024 * 1024 + 1),
            ..Default::default()
        };
        let line = format_released("x", None, &usage, SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(line, "x: memory=2M");
    }

    #[test]
    fn slow_fork_rate_per_minute() {
        let (btime, now) = btime_and_now(1000);
        let usage = CgroupResourceUsage {
            pids_forks: Some(30),
            ..Default::default()
        };
        // 30 forks over 1000s: 0.03/s => 1.8/m
        let line = format_released("x", Some(btime), &usage, now).unwrap();
        assert!(line.ends_with("forks=30[1.8/m]"), "{}", line);
    }

    #[test]
    fn negligible_rate_omitted() {
        let (btime, now) = btime_and_now(100_000);
        let usage = CgroupResourceUsage {
            pids_forks: Some(1),
            ..Default::default()
        };
        let line = format_released("x", Some(btime), &usage, now).unwrap();
        assert!(line.ends_with("forks=1"), "{}", line);
    }

    #[test]
    fn zero_counters_are_elided() {
        let usage = CgroupResourceUsage {
            memory_events_high: Some(0),
            memory_events_max: Some(0),
            memory_events_oom: Some(0),
            pids_events_max: Some(0),
            pids_peak: Some(0),
            ..Default::default()
        };
        // procs=0 is still reported (the peak is known), the event
        // counters are not
        let line = format_released("x", None, &usage, SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(line, "x: procs=0");
    }
}
