//! The table of managed cgroup scopes.

/// These systemd scopes are allocated by our software which uses the
/// process spawner.  Their cgroups are managed by this daemon; emptiness
/// events under any other scope are ignored.
pub const MANAGED_SCOPES: &[&str] = &[
    "/system.slice/system-cm4all.slice/bp-spawn.scope/",
    "/system.slice/system-cm4all.slice/lukko-spawn.scope/",
    "/system.slice/system-cm4all.slice/workshop-spawn.scope/",
];

/// Matches `path` (absolute within the cgroup hierarchy, leading slash)
/// against the managed scope prefixes.  Returns the scope-relative suffix,
/// or `None` if the path is not inside any managed scope.
pub fn managed_suffix(path: &str) -> Option<&str> {
    MANAGED_SCOPES
        .iter()
        .find_map(|scope| path.strip_prefix(scope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_managed_scope() {
        assert_eq!(
            managed_suffix("/system.slice/system-cm4all.slice/bp-spawn.scope/app-42/leaf"),
            Some("app-42/leaf")
        );
        assert_eq!(
            managed_suffix("/system.slice/system-cm4all.slice/workshop-spawn.scope/job"),
            Some("job")
        );
    }

    #[test]
    fn rejects_unmanaged_paths() {
        assert_eq!(managed_suffix("/user.slice/user-1000.slice/session-2.scope"), None);
        assert_eq!(managed_suffix("/system.slice/ssh.service"), None);
        // the scope directory itself (no trailing component) is not managed
        assert_eq!(
            managed_suffix("/system.slice/system-cm4all.slice/bp-spawn.scope"),
            None
        );
    }
}
