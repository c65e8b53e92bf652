//! cgreap-core — shared library for the cgreap daemons.
//!
//! Provides:
//! - `treewatch` — recursive inotify watcher over a directory tree
//! - `cgwatch` — cgroup-v2 watcher detecting the populated→empty transition
//! - `accounting` — cgroup-v2 resource usage sampling (`cpu.stat`, `memory.*`, `pids.*`)
//! - `summary` — the one-line release report written per reaped cgroup
//! - `scopes` — the table of managed cgroup scopes
//! - `protocol` — wire format of the spawn accessory socket
//! - `sys` — thin wrappers for syscalls nix does not cover (statx, xattr, pidfd)
//! - `sd` — service-supervisor integration (socket activation, readiness)
//!
//! Both daemons run a single-threaded tokio runtime with a `LocalSet`; all
//! code here assumes callbacks and tasks are serialized on that one loop.

pub mod accounting;
pub mod cgwatch;
pub mod protocol;
pub mod scopes;
pub mod sd;
pub mod summary;
pub mod sys;
pub mod treewatch;
