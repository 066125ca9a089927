//! The host capability trait exposed to modules.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{HostError, ModuleResult};
use crate::event::{Event, EventType};
use crate::info::ModuleInfo;
use crate::module::Module;
use crate::pool::ThreadPool;

/// A direct callback: runs on the target module's worker thread while the
/// caller's thread blocks. Borrows in the closure are fine — the caller
/// does not return until the callback has been consumed.
pub type DirectCallback<'a> = Box<dyn FnOnce(&mut dyn Module) -> ModuleResult + Send + 'a>;

/// Host configuration. Plain data here; the host crate layers TOML
/// loading on top.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root directory module sources are loaded from.
    pub modules_path: PathBuf,
    /// Directory compiled shared objects and hash sidecars land in.
    pub build_path: PathBuf,
    /// Compiler executable invoked by the default build driver.
    pub compiler_command: String,
    /// Include path set used to resolve source references and passed to
    /// the build driver.
    pub include_dirs: Vec<PathBuf>,
    /// Worker count of the shared thread pool.
    pub thread_pool_workers: usize,
    /// Modules whose compiler invocation is skipped (the artifact is
    /// expected to already exist).
    pub skip_compile: BTreeSet<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            modules_path: PathBuf::from("modules"),
            build_path: PathBuf::from("build/modules"),
            compiler_command: "rustc".into(),
            include_dirs: Vec::new(),
            thread_pool_workers: 4,
            skip_compile: BTreeSet::new(),
        }
    }
}

/// The host interface modules program against.
///
/// All methods are safe to call from any thread unless noted. The blocking
/// one is [`access_module`](Host::access_module): it parks the caller's
/// thread until the callback has run on the target's worker thread.
pub trait Host: Send + Sync {
    // ── events ──

    /// Subscribe the calling module to an event type. Must be called from
    /// the module's own worker thread (`init()` counts). Duplicate
    /// subscriptions are a warned no-op.
    fn sub_event(&self, ty: EventType);

    /// Queue an event to every subscriber.
    fn emit_event(&self, event: Event);

    /// Deliver an event to every subscriber synchronously, blocking the
    /// calling thread until each subscriber's worker has run the handler.
    /// Driver-thread initialization use only.
    fn emit_event_sync(&self, event: Event);

    // ── module lifecycle ──

    /// Compile, load and start a module. Must not be called with the
    /// registry mutex held (i.e. not from inside host callbacks that hold
    /// it; module code never does).
    fn load_module(&self, info: ModuleInfo) -> Result<(), HostError>;

    /// Register an already-constructed module under `info`. For
    /// hardcoded/in-process modules: skips compilation, emits no
    /// `core:module_loaded`.
    fn load_module_direct(&self, module: Box<dyn Module>, info: ModuleInfo)
        -> Result<(), HostError>;

    /// Request an unload; performed by the driver thread's next
    /// `handle_events` tick.
    fn unload_module(&self, name: &str);

    /// Request a reload with fresh info. A pending reload for the same
    /// name is overwritten.
    fn reload_module(&self, info: ModuleInfo);

    /// Request a reload using the last-seen info for the name.
    fn reload_module_by_name(&self, name: &str);

    /// Run a callback on the named module's worker thread, blocking the
    /// calling thread until it has run. Subject to the access policy.
    fn access_module(&self, name: &str, cb: DirectCallback<'_>) -> Result<(), HostError>;

    // ── lookups ──

    fn has_module(&self, name: &str) -> bool;

    /// Like [`has_module`](Host::has_module) but an error if absent.
    fn check_module(&self, name: &str) -> Result<(), HostError>;

    fn get_module_info(&self, name: &str) -> Option<ModuleInfo>;

    fn get_loaded_modules(&self) -> Vec<String>;

    fn get_module_path(&self, name: &str) -> Result<PathBuf, HostError>;

    // ── control ──

    /// Request shutdown. The first nonzero exit code wins; zero exit
    /// codes may be overwritten by later calls.
    fn shutdown(&self, exit_code: i32, reason: &str);

    // ── services ──

    fn tmp_store_data(&self, name: &str, data: &str);

    /// Take back data stored with `tmp_store_data`; removes the entry.
    fn tmp_restore_data(&self, name: &str) -> Option<String>;

    fn add_file_path(&self, name: &str, path: &Path);

    fn get_file_path(&self, name: &str) -> Option<PathBuf>;

    /// Run a callback with the shared thread pool.
    fn access_thread_pool(&self, cb: Box<dyn FnOnce(&ThreadPool) + Send + '_>);

    fn config(&self) -> &HostConfig;
}

impl dyn Host {
    /// Generic sugar over [`Host::access_module`].
    pub fn access<F>(&self, name: &str, f: F) -> Result<(), HostError>
    where
        F: FnOnce(&mut dyn Module) -> ModuleResult + Send,
    {
        self.access_module(name, Box::new(f))
    }
}
