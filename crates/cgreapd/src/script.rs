//! Lua bridge for cgroup accounting.
//!
//! The handler script defines a global function `cgroup_released(info)`
//! which is invoked once per reaped cgroup.  Every invocation runs as its
//! own coroutine on the event loop; the handler may use the async host
//! functions (currently `resolve()`) and suspend without blocking the
//! reaper.

use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use mlua::{Function, Lua, MetaMethod, UserData, UserDataFields, UserDataMethods, Value};
use tracing::{debug, error};

use cgreap_core::accounting::CgroupResourceUsage;
use cgreap_core::sys;

/// Lazy view of the extended attributes of the cgroup directory; indexing
/// it reads the attribute on demand.
struct CgroupXattr {
    cgroup_fd: Rc<OwnedFd>,
}

impl UserData for CgroupXattr {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, name: String| {
            sys::fgetxattr(this.cgroup_fd.as_fd(), &name)
                .map(|value| lua.create_string(&value))
                .transpose()
        });
    }
}

/// The argument handed to `cgroup_released`.  Owns the cgroup directory
/// descriptor; it is closed when the Lua object is collected.
pub struct CgroupInfo {
    cgroup_fd: Option<Rc<OwnedFd>>,
    relative_path: String,
    btime: Option<SystemTime>,
    age: Option<Duration>,
    usage: CgroupResourceUsage,
}

impl CgroupInfo {
    pub fn new(
        cgroup_fd: Option<OwnedFd>,
        relative_path: String,
        btime: Option<SystemTime>,
        usage: CgroupResourceUsage,
    ) -> Self {
        let age = btime.and_then(|btime| SystemTime::now().duration_since(btime).ok());
        Self {
            cgroup_fd: cgroup_fd.map(Rc::new),
            relative_path,
            btime,
            age,
            usage,
        }
    }
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

impl UserData for CgroupInfo {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("cgroup", |_, this| Ok(this.relative_path.clone()));

        fields.add_field_method_get("cgroup_xattr", |_, this| {
            Ok(this.cgroup_fd.clone().map(|cgroup_fd| CgroupXattr { cgroup_fd }))
        });

        fields.add_field_method_get("btime", |_, this| {
            Ok(this
                .btime
                .and_then(|btime| btime.duration_since(UNIX_EPOCH).ok())
                .map(seconds))
        });
        fields.add_field_method_get("age", |_, this| Ok(this.age.map(seconds)));

        fields.add_field_method_get("cpu_total", |_, this| {
            Ok(this.usage.cpu.total.map(seconds))
        });
        fields.add_field_method_get("cpu_user", |_, this| Ok(this.usage.cpu.user.map(seconds)));
        fields.add_field_method_get("cpu_system", |_, this| {
            Ok(this.usage.cpu.system.map(seconds))
        });

        fields.add_field_method_get("memory_peak", |_, this| Ok(this.usage.memory_peak));
        fields.add_field_method_get("memory_events_high", |_, this| {
            Ok(this.usage.memory_events_high)
        });
        fields.add_field_method_get("memory_events_max", |_, this| {
            Ok(this.usage.memory_events_max)
        });
        fields.add_field_method_get("memory_events_oom", |_, this| {
            Ok(this.usage.memory_events_oom)
        });

        fields.add_field_method_get("pids_peak", |_, this| Ok(this.usage.pids_peak));
        fields.add_field_method_get("pids_forks", |_, this| Ok(this.usage.pids_forks));
        fields.add_field_method_get("pids_events_max", |_, this| {
            Ok(this.usage.pids_events_max)
        });
    }
}

/// One loaded interpreter plus the handler function located in it.
/// Reloading swaps the whole state; coroutines started on the old state
/// keep it alive through their own reference until they finish.
struct ScriptState {
    _lua: Lua,
    handler: Function,
}

/// Hosts the accounting script and drives one handler coroutine per
/// release event.
pub struct LuaAccounting {
    script_path: PathBuf,
    state: Rc<ScriptState>,
}

impl LuaAccounting {
    /// Loads and evaluates the script.  A missing file, a failing chunk or
    /// an absent/non-function `cgroup_released` global is a fatal startup
    /// error.
    pub fn load(script_path: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            state: Rc::new(Self::eval(script_path)?),
            script_path: script_path.to_owned(),
        })
    }

    fn eval(script_path: &Path) -> anyhow::Result<ScriptState> {
        let lua = Lua::new();
        register_host_functions(&lua)?;

        let chunk = std::fs::read_to_string(script_path)
            .with_context(|| format!("Failed to read {}", script_path.display()))?;
        lua.load(&chunk)
            .set_name(script_path.to_string_lossy())
            .exec()
            .with_context(|| format!("Failed to run {}", script_path.display()))?;

        let handler = match lua.globals().get::<Value>("cgroup_released")? {
            Value::Function(handler) => handler,
            Value::Nil => anyhow::bail!("Function 'cgroup_released' not found"),
            _ => anyhow::bail!("'cgroup_released' is not a function"),
        };

        Ok(ScriptState { _lua: lua, handler })
    }

    /// Re-evaluates the script and swaps the interpreter state.  In-flight
    /// coroutines continue on the old state; on failure the old state is
    /// kept.
    pub fn reload(&mut self) {
        match Self::eval(&self.script_path) {
            Ok(state) => {
                self.state = Rc::new(state);
                debug!("Reloaded {}", self.script_path.display());
            }
            Err(err) => error!("Reload failed: {:#}", err),
        }
    }

    /// Starts a handler coroutine for one released cgroup.  Takes
    /// ownership of `cgroup_fd`; the script may keep reading from the
    /// directory until the deferred deletion removes it.
    pub fn invoke_cgroup_released(
        &self,
        cgroup_fd: Option<OwnedFd>,
        relative_path: &str,
        btime: Option<SystemTime>,
        usage: CgroupResourceUsage,
    ) -> tokio::task::JoinHandle<()> {
        let state = Rc::clone(&self.state);
        let info = CgroupInfo::new(cgroup_fd, relative_path.to_owned(), btime, usage);

        tokio::task::spawn_local(async move {
            if let Err(err) = state.handler.call_async::<()>(info).await {
                error!("cgroup_released failed: {}", err);
            }
        })
    }
}

/// Registers the async primitives available to handler scripts.
fn register_host_functions(lua: &Lua) -> mlua::Result<()> {
    // resolve("db.example.com", 5432) -> { "10.0.0.1:5432", ... }
    let resolve = lua.create_async_function(
        |_, (host, port): (String, Option<u16>)| async move {
            let addresses = tokio::net::lookup_host((host.as_str(), port.unwrap_or(0)))
                .await
                .map_err(mlua::Error::external)?;
            Ok(addresses.map(|addr| addr.to_string()).collect::<Vec<_>>())
        },
    )?;
    lua.globals().set("resolve", resolve)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn script(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".lua").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn missing_handler_is_fatal() {
        let file = script("x = 1");
        assert!(LuaAccounting::load(file.path()).is_err());
    }

    #[test]
    fn non_function_handler_is_fatal() {
        let file = script("cgroup_released = 42");
        assert!(LuaAccounting::load(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_fatal() {
        assert!(LuaAccounting::load(Path::new("/nonexistent/accounting.lua")).is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handler_receives_info_fields() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let file = script(
                    r#"
                    seen = nil
                    function cgroup_released(info)
                        seen = {
                            cgroup = info.cgroup,
                            cpu_total = info.cpu_total,
                            memory_peak = info.memory_peak,
                            pids_peak = info.pids_peak,
                            oom = info.memory_events_oom,
                        }
                    end
                    "#,
                );
                let accounting = LuaAccounting::load(file.path()).unwrap();

                let usage = CgroupResourceUsage {
                    memory_peak: Some(64 * 1024 * 1024),
                    pids_peak: Some(3),
                    ..Default::default()
                };
                accounting
                    .invoke_cgroup_released(None, "app-42/leaf", None, usage)
                    .await
                    .unwrap();

                let lua = &accounting.state._lua;
                let seen: mlua::Table = lua.globals().get("seen").unwrap();
                assert_eq!(seen.get::<String>("cgroup").unwrap(), "app-42/leaf");
                assert_eq!(seen.get::<Option<f64>>("cpu_total").unwrap(), None);
                assert_eq!(
                    seen.get::<u64>("memory_peak").unwrap(),
                    64 * 1024 * 1024
                );
                assert_eq!(seen.get::<u64>("pids_peak").unwrap(), 3);
                assert_eq!(seen.get::<Option<u64>>("oom").unwrap(), None);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handler_error_is_swallowed() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let file = script(
                    r#"
                    function cgroup_released(info)
                        error("boom")
                    end
                    "#,
                );
                let accounting = LuaAccounting::load(file.path()).unwrap();
                accounting
                    .invoke_cgroup_released(None, "x", None, CgroupResourceUsage::default())
                    .await
                    .unwrap();
                // the error is logged, not propagated; a second event still works
                accounting
                    .invoke_cgroup_released(None, "y", None, CgroupResourceUsage::default())
                    .await
                    .unwrap();
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reload_swaps_state() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let file = script("function cgroup_released(info) marker = 1 end");
                let mut accounting = LuaAccounting::load(file.path()).unwrap();
                let old = Rc::clone(&accounting.state);

                std::fs::write(
                    file.path(),
                    "function cgroup_released(info) marker = 2 end",
                )
                .unwrap();
                accounting.reload();
                assert!(!Rc::ptr_eq(&old, &accounting.state));

                // a broken replacement keeps the current state
                std::fs::write(file.path(), "syntax error here").unwrap();
                let current = Rc::clone(&accounting.state);
                accounting.reload();
                assert!(Rc::ptr_eq(&current, &accounting.state));
            })
            .await;
    }
}
