//! The host: registry, event bus, access policy, and the reload driver.
//!
//! One mutex guards the whole registry (modules, infos, load order,
//! subscriber lists, pending unload/reload/modified sets). Lock order is
//! registry → container queue; neither is ever held across a blocking
//! wait, and module code never runs with either held.
//!
//! # Teardown
//!
//! A host must be torn down explicitly — [`ModuleHost::run`] does it, or
//! call [`thread_request_stop`](ModuleHost::thread_request_stop) followed
//! by [`thread_join`](ModuleHost::thread_join). Modules hold
//! `Arc<dyn Host>` references, so simply dropping the last external `Arc`
//! leaves the cycle alive.

use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use remod_api::{
    event_name, event_type, DirectCallback, Event, Host, HostConfig, HostError, HostHandle,
    Module, ModuleInfo, ModuleLoadedEvent, ModuleModifiedEvent, ModuleUnloadedEvent, ThreadPool,
};
use tracing::{debug, error, info, trace, warn};

use crate::compile::{BuildDriver, CommandDriver, CompileCache};
use crate::container::{current_container, BacktraceStep, DirectCb, ModuleContainer};
use crate::loader::{self, SharedLibrary};
use crate::watch::{watch_thread_main, FileWatch};

#[derive(Default)]
struct RegistryState {
    /// Info of every module ever seen; broader than currently loaded.
    module_info: HashMap<String, ModuleInfo>,
    /// Currently loaded modules.
    modules: HashMap<String, Arc<ModuleContainer>>,
    /// Names in load order; reverse is the shutdown order.
    load_order: Vec<String>,
    /// Per-event-type subscriber lists; weak so a list never keeps a
    /// container alive past unload.
    event_subs: Vec<Vec<Weak<ModuleContainer>>>,
    unloads_requested: BTreeSet<String>,
    reloads_requested: Vec<ModuleInfo>,
    /// Filled by the watch thread; drained by `handle_events`.
    modified_modules: BTreeSet<String>,
    file_watches: HashMap<String, FileWatch>,
    /// Shared-object handles, retained until the module is unloaded.
    libraries: HashMap<String, SharedLibrary>,
}

#[derive(Default)]
struct ShutdownState {
    requested: bool,
    exit_code: i32,
    reason: String,
}

/// The module host. Create with [`ModuleHost::new`], share as
/// `Arc<ModuleHost>` (it is also the `Arc<dyn Host>` handed to modules).
pub struct ModuleHost {
    self_ref: Weak<ModuleHost>,
    config: HostConfig,
    registry: Mutex<RegistryState>,
    shutdown_state: Mutex<ShutdownState>,

    /// Set by `load_modules`; extra include root for module builds.
    modules_path: Mutex<PathBuf>,
    compile_cache: CompileCache,

    tmp_data: Mutex<HashMap<String, String>>,
    file_paths: Mutex<HashMap<String, PathBuf>>,
    thread_pool: Mutex<ThreadPool>,

    watch_tx: mpsc::Sender<String>,
    watch_thread: Mutex<Option<JoinHandle<()>>>,
    watch_stop: Arc<AtomicBool>,
}

impl ModuleHost {
    /// Host with the default command-line build driver from the config.
    pub fn new(config: HostConfig) -> Arc<Self> {
        let driver = Box::new(CommandDriver::new(config.compiler_command.clone()));
        Self::with_driver(config, driver)
    }

    /// Host with a custom build driver.
    pub fn with_driver(config: HostConfig, driver: Box<dyn BuildDriver>) -> Arc<Self> {
        let (watch_tx, watch_rx) = mpsc::channel();
        let watch_stop = Arc::new(AtomicBool::new(false));
        Arc::new_cyclic(|weak: &Weak<ModuleHost>| {
            let watch_thread = spawn_watch_thread(weak.clone(), watch_rx, Arc::clone(&watch_stop));
            let compile_cache = CompileCache::new(
                config.build_path.clone(),
                config.include_dirs.clone(),
                config.skip_compile.clone(),
                driver,
            );
            ModuleHost {
                self_ref: weak.clone(),
                thread_pool: Mutex::new(ThreadPool::new(config.thread_pool_workers)),
                modules_path: Mutex::new(config.modules_path.clone()),
                config,
                registry: Mutex::new(RegistryState::default()),
                shutdown_state: Mutex::new(ShutdownState::default()),
                tmp_data: Mutex::new(HashMap::new()),
                file_paths: Mutex::new(HashMap::new()),
                compile_cache,
                watch_tx,
                watch_thread: Mutex::new(Some(watch_thread)),
                watch_stop,
            }
        })
    }

    fn as_host(&self) -> Arc<dyn Host> {
        self.self_ref.upgrade().expect("host vanished under itself")
    }

    /// Load `__loader` from under `path` and let it pull in everything
    /// else, then fire `core:start`.
    pub fn load_modules(&self, path: &Path) {
        *self.modules_path.lock() = path.to_path_buf();

        let info = ModuleInfo::new("__loader", path.join("__loader"));
        if let Err(e) = self.load_module(info) {
            error!(error = %e, "failed to load __loader module");
            self.shutdown(1, "failed to load __loader module");
            return;
        }

        // Synchronous: nothing else is running yet and loading must
        // complete before anyone can rely on the loaded set.
        self.emit_event_sync(Event::new("core:load_modules"));

        if self.is_shutdown_requested().is_some() {
            return;
        }
        // Now that everyone is subscribed, fire the start event.
        self.emit_event(Event::new("core:start"));
    }

    /// Driver-thread tick: fan out accumulated file modifications, then
    /// perform requested unloads and reloads.
    pub fn handle_events(&self) {
        let modified: Vec<ModuleInfo> = {
            let mut reg = self.registry.lock();
            let names = std::mem::take(&mut reg.modified_modules);
            names
                .into_iter()
                .filter_map(|name| match reg.module_info.get(&name) {
                    Some(info) => Some(info.clone()),
                    None => {
                        warn!(module = %name, "info of modified module not available");
                        None
                    }
                })
                .collect()
        };
        for info in modified {
            self.emit_event(Event::with_payload(
                "core:module_modified",
                ModuleModifiedEvent {
                    name: info.name.clone(),
                    path: info.path.clone(),
                },
            ));
        }

        self.handle_unloads_and_reloads();
    }

    fn handle_unloads_and_reloads(&self) {
        let (unloads, loads) = {
            let mut reg = self.registry.lock();
            let mut unloads: Vec<String> = std::mem::take(&mut reg.unloads_requested)
                .into_iter()
                .collect();
            let loads = std::mem::take(&mut reg.reloads_requested);
            unloads.extend(loads.iter().map(|info| info.name.clone()));
            (unloads, loads)
        };

        // Give each module a chance to stash state before it goes away.
        let unload_ty = event_type("core:unload");
        for name in &unloads {
            trace!(module = %name, "synchronous core:unload");
            if let Err(e) =
                self.access_module_erased(name, Box::new(move |m| m.event(unload_ty, None)))
            {
                warn!(module = %name, error = %e, "core:unload delivery failed");
            }
        }
        for name in &unloads {
            info!(module = %name, "unloading");
            self.unload_module_u(name);
        }

        let continue_ty = event_type("core:continue");
        for info in loads {
            info!(module = %info.name, "loading (reload requested)");
            let name = info.name.clone();
            if let Err(e) = self.load_module(info) {
                warn!(module = %name, error = %e, "reload failed");
                continue;
            }
            if let Err(e) =
                self.access_module_erased(&name, Box::new(move |m| m.event(continue_ty, None)))
            {
                warn!(module = %name, error = %e, "core:continue delivery failed");
            }
        }
    }

    /// Immediate unload. Driver thread only; call with no locks held.
    pub fn unload_module_u(&self, name: &str) {
        let mc = {
            let mut reg = self.registry.lock();
            let Some(mc) = reg.modules.get(name).cloned() else {
                warn!(module = name, "unload_module_u: module not found");
                return;
            };
            for sublist in reg.event_subs.iter_mut() {
                sublist.retain(|weak| {
                    weak.upgrade().is_some_and(|sub| !Arc::ptr_eq(&sub, &mc))
                });
            }
            reg.modules.remove(name);
            reg.load_order.retain(|n| n != name);
            mc
        };

        trace!(module = name, "stopping worker for unload");
        mc.thread_request_stop();
        mc.thread_join();

        if Arc::strong_count(&mc) > 1 {
            warn!(
                module = name,
                "not the last container reference; unloading the shared object is probably unsafe"
            );
        }
        drop(mc);

        {
            let mut reg = self.registry.lock();
            // Drops the dlopen handle; safe now that the worker is joined.
            reg.libraries.remove(name);
        }

        // Emitted with the registry mutex released.
        self.emit_event(Event::with_payload(
            "core:module_unloaded",
            ModuleUnloadedEvent {
                name: name.to_string(),
            },
        ));
    }

    // ── teardown ──

    /// Signal the watch thread and every worker to stop.
    pub fn thread_request_stop(&self) {
        self.watch_stop.store(true, Ordering::Relaxed);
        for mc in self.modules_in_unload_order() {
            trace!(module = %mc.info.name, "requesting module stop");
            mc.thread_request_stop();
        }
    }

    /// Join the watch thread, then every worker in reverse load order.
    pub fn thread_join(&self) {
        debug!("waiting: file watch");
        let watch = self.watch_thread.lock().take();
        if let Some(handle) = watch {
            let _ = handle.join();
        }
        debug!("waiting: modules");
        for mc in self.modules_in_unload_order() {
            debug!(module = %mc.info.name, "waiting for module to stop");
            mc.thread_join();
        }
    }

    /// Exit code and reason once shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> Option<(i32, String)> {
        let state = self.shutdown_state.lock();
        state
            .requested
            .then(|| (state.exit_code, state.reason.clone()))
    }

    /// Drive `handle_events` until shutdown, then tear down. Returns the
    /// exit code and reason.
    pub fn run(&self, tick: Duration) -> (i32, String) {
        let (code, reason) = loop {
            if let Some(result) = self.is_shutdown_requested() {
                break result;
            }
            self.handle_events();
            std::thread::sleep(tick);
        };
        info!(exit_code = code, reason = %reason, "driver loop exiting");
        self.thread_request_stop();
        self.thread_join();
        (code, reason)
    }

    // ── internals ──

    fn modules_in_unload_order(&self) -> Vec<Arc<ModuleContainer>> {
        let reg = self.registry.lock();
        reg.load_order
            .iter()
            .rev()
            .filter_map(|name| reg.modules.get(name).cloned())
            .collect()
    }

    pub(crate) fn mark_modified(&self, name: String) {
        self.registry.lock().modified_modules.insert(name);
    }

    fn ensure_file_watch(&self, name: &str, sources: &[PathBuf]) {
        let mut reg = self.registry.lock();
        if reg.file_watches.contains_key(name) {
            return;
        }
        match FileWatch::new(name, sources, self.watch_tx.clone()) {
            Ok(watch) => {
                reg.file_watches.insert(name.to_string(), watch);
            }
            Err(e) => warn!(module = name, error = %e, "failed to set up file watch"),
        }
    }

    /// Undo a half-finished load after `init` failed.
    fn remove_failed_load(&self, name: &str, mc: &Arc<ModuleContainer>) {
        mc.thread_request_stop();
        mc.thread_join();
        let mut reg = self.registry.lock();
        if reg
            .modules
            .get(name)
            .is_some_and(|entry| Arc::ptr_eq(entry, mc))
        {
            reg.modules.remove(name);
            reg.load_order.retain(|n| n != name);
        }
        reg.libraries.remove(name);
    }

    fn access_module_erased(&self, name: &str, cb: DirectCb) -> Result<(), HostError> {
        let caller_mc = current_container();
        let result = self.lookup_and_execute(name, cb, caller_mc.as_ref());
        let Err(e) = result else { return Ok(()) };

        // Record this hop of the failure into the chain initiator's
        // backtrace list; the chain is logged once at the fatal event
        // site.
        if matches!(
            e,
            HostError::DirectCallback { .. } | HostError::DirectCallbackPanic { .. }
        ) {
            if let Some(current) = &caller_mc {
                current
                    .chain_root()
                    .push_backtrace_step(BacktraceStep::capture(&current.info.name));
            }
        }

        // A destructor must not have errors propagated through it.
        if let Some(current) = &caller_mc {
            if current.in_destructor() {
                warn!(
                    target_module = name,
                    caller = %current.info.name,
                    error = %e,
                    "ignoring error raised during module destructor"
                );
                return Ok(());
            }
        }
        Err(e)
    }

    fn lookup_and_execute(
        &self,
        name: &str,
        cb: DirectCb,
        caller: Option<&Arc<ModuleContainer>>,
    ) -> Result<(), HostError> {
        let mc = {
            let reg = self.registry.lock();
            let mc = reg
                .modules
                .get(name)
                .cloned()
                .ok_or_else(|| HostError::ModuleNotFound(name.to_string()))?;
            match caller {
                Some(caller) => {
                    trace!(target_module = name, caller = %caller.info.name, "access_module");
                    check_valid_access_locked(&reg, &mc, caller)?;
                }
                None => {
                    trace!(target_module = name, "access_module from non-module thread");
                }
            }
            mc
        };
        mc.execute_direct_cb(cb, caller)
    }
}

impl Host for ModuleHost {
    fn sub_event(&self, ty: remod_api::EventType) {
        let Some(mc) = current_container() else {
            warn!("sub_event(): not called from a module thread");
            return;
        };
        if mc.in_destructor() {
            warn!(module = %mc.info.name, "sub_event(): refused during module destructor");
            return;
        }
        let mut reg = self.registry.lock();
        // The container must still be the registered one; a stopping or
        // unloaded module may not subscribe.
        if !reg
            .modules
            .get(&mc.info.name)
            .is_some_and(|entry| Arc::ptr_eq(entry, &mc))
        {
            warn!(module = %mc.info.name, "sub_event(): not a known module");
            return;
        }
        if reg.event_subs.len() <= ty {
            reg.event_subs.resize_with(ty + 1, Vec::new);
        }
        let sublist = &mut reg.event_subs[ty];
        let already = sublist
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|sub| Arc::ptr_eq(&sub, &mc)));
        if already {
            warn!(module = %mc.info.name, ty, "sub_event(): already on list");
            return;
        }
        debug!(
            module = %mc.info.name,
            event = %event_name(ty).unwrap_or_default(),
            ty,
            "subscribed"
        );
        sublist.push(Arc::downgrade(&mc));
    }

    fn emit_event(&self, event: Event) {
        self.emit(event, false);
    }

    fn emit_event_sync(&self, event: Event) {
        self.emit(event, true);
    }

    fn load_module(&self, info: ModuleInfo) -> Result<(), HostError> {
        {
            let mut reg = self.registry.lock();
            if reg.modules.contains_key(&info.name) {
                warn!(module = %info.name, "cannot load: already loaded");
                return Err(HostError::LoadFailed {
                    module: info.name.clone(),
                    reason: "already loaded".into(),
                });
            }
            info!(module = %info.name, path = %info.path.display(), "loading module");
            reg.module_info.insert(info.name.clone(), info.clone());
        }

        let mut library = None;
        let mut module = None;
        if !info.meta.disable_native_build {
            let extra_includes = vec![self.modules_path.lock().clone()];
            let sources = self
                .compile_cache
                .module_sources(&info, &extra_includes)
                .map_err(|e| HostError::BuildFailed {
                    module: info.name.clone(),
                    reason: e.to_string(),
                })?;

            // Watch before building: a module that fails to compile must
            // still be watched, so that the edit fixing it schedules a
            // reload.
            self.ensure_file_watch(&info.name, &sources);

            let built = self
                .compile_cache
                .build_module(&info, &extra_includes, &sources)
                .map_err(|e| HostError::BuildFailed {
                    module: info.name.clone(),
                    reason: e.to_string(),
                })?;

            let lib =
                SharedLibrary::open(&built.artifact).map_err(|e| HostError::LoadFailed {
                    module: info.name.clone(),
                    reason: e.to_string(),
                })?;
            let handle = HostHandle::new(self.as_host());
            let constructed = loader::construct_module(&lib, &info.name, &handle).map_err(|e| {
                HostError::LoadFailed {
                    module: info.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            library = Some(lib);
            module = Some(constructed);
        }

        let mc = Arc::new(ModuleContainer::new(
            self.self_ref.clone(),
            module,
            info.clone(),
        ));
        {
            let mut reg = self.registry.lock();
            if reg.modules.contains_key(&info.name) {
                return Err(HostError::LoadFailed {
                    module: info.name.clone(),
                    reason: "loaded concurrently".into(),
                });
            }
            reg.modules.insert(info.name.clone(), Arc::clone(&mc));
            reg.load_order.push(info.name.clone());
            if let Some(lib) = library {
                reg.libraries.insert(info.name.clone(), lib);
            }
        }

        if !info.meta.disable_native_build {
            if let Err(e) = mc.init_and_start_thread() {
                warn!(module = %info.name, error = %e, "init failed; rolling back load");
                self.remove_failed_load(&info.name, &mc);
                return Err(e);
            }
        }

        self.emit_event(Event::with_payload(
            "core:module_loaded",
            ModuleLoadedEvent {
                name: info.name.clone(),
            },
        ));
        Ok(())
    }

    // There intentionally is no core:module_loaded for direct loads.
    fn load_module_direct(
        &self,
        module: Box<dyn Module>,
        info: ModuleInfo,
    ) -> Result<(), HostError> {
        let name = info.name.clone();
        {
            let mut reg = self.registry.lock();
            if reg.modules.contains_key(&name) {
                return Err(HostError::LoadFailed {
                    module: name,
                    reason: "already loaded".into(),
                });
            }
            info!(module = %name, "loading module (hardcoded)");
            reg.module_info.insert(name.clone(), info.clone());
        }

        let mc = Arc::new(ModuleContainer::new(
            self.self_ref.clone(),
            Some(module),
            info,
        ));
        {
            let mut reg = self.registry.lock();
            reg.modules.insert(name.clone(), Arc::clone(&mc));
            reg.load_order.push(name.clone());
        }

        if let Err(e) = mc.init_and_start_thread() {
            warn!(module = %name, error = %e, "init failed; rolling back load");
            self.remove_failed_load(&name, &mc);
            return Err(e);
        }
        Ok(())
    }

    fn unload_module(&self, name: &str) {
        debug!(module = name, "unload requested");
        let mut reg = self.registry.lock();
        if !reg.modules.contains_key(name) {
            warn!(module = name, "unload_module: not loaded");
            return;
        }
        reg.unloads_requested.insert(name.to_string());
    }

    fn reload_module(&self, info: ModuleInfo) {
        info!(module = %info.name, "reload requested");
        let mut reg = self.registry.lock();
        if let Some(pending) = reg
            .reloads_requested
            .iter_mut()
            .find(|pending| pending.name == info.name)
        {
            *pending = info; // Keep only the latest request.
            return;
        }
        reg.reloads_requested.push(info);
    }

    fn reload_module_by_name(&self, name: &str) {
        let info = {
            let reg = self.registry.lock();
            match reg.module_info.get(name) {
                Some(info) => info.clone(),
                None => {
                    warn!(module = name, "reload_module: module info not found");
                    return;
                }
            }
        };
        self.reload_module(info);
    }

    fn access_module(&self, name: &str, cb: DirectCallback<'_>) -> Result<(), HostError> {
        // SAFETY: the callback is consumed (run or dropped) before
        // execute_direct_cb returns, and this thread blocks until then, so
        // no borrow inside it can outlive this frame.
        let cb: DirectCb =
            unsafe { std::mem::transmute::<DirectCallback<'_>, DirectCallback<'static>>(cb) };
        self.access_module_erased(name, cb)
    }

    fn has_module(&self, name: &str) -> bool {
        self.registry.lock().modules.contains_key(name)
    }

    fn check_module(&self, name: &str) -> Result<(), HostError> {
        if self.has_module(name) {
            Ok(())
        } else {
            Err(HostError::ModuleNotFound(name.to_string()))
        }
    }

    fn get_module_info(&self, name: &str) -> Option<ModuleInfo> {
        self.registry.lock().module_info.get(name).cloned()
    }

    fn get_loaded_modules(&self) -> Vec<String> {
        self.registry.lock().modules.keys().cloned().collect()
    }

    fn get_module_path(&self, name: &str) -> Result<PathBuf, HostError> {
        let reg = self.registry.lock();
        reg.modules
            .get(name)
            .map(|mc| mc.info.path.clone())
            .ok_or_else(|| HostError::ModuleNotFound(name.to_string()))
    }

    fn shutdown(&self, exit_code: i32, reason: &str) {
        let mut state = self.shutdown_state.lock();
        if state.requested && state.exit_code != 0 {
            // The first failure wins.
            return;
        }
        if state.requested && exit_code == 0 {
            return;
        }
        info!(exit_code, reason, "server shutdown requested");
        state.requested = true;
        state.exit_code = exit_code;
        state.reason = reason.to_string();
    }

    fn tmp_store_data(&self, name: &str, data: &str) {
        self.tmp_data
            .lock()
            .insert(name.to_string(), data.to_string());
    }

    fn tmp_restore_data(&self, name: &str) -> Option<String> {
        self.tmp_data.lock().remove(name)
    }

    fn add_file_path(&self, name: &str, path: &Path) {
        debug!(name, path = %path.display(), "add_file_path");
        self.file_paths
            .lock()
            .insert(name.to_string(), path.to_path_buf());
    }

    fn get_file_path(&self, name: &str) -> Option<PathBuf> {
        self.file_paths.lock().get(name).cloned()
    }

    fn access_thread_pool(&self, cb: Box<dyn FnOnce(&ThreadPool) + Send + '_>) {
        let pool = self.thread_pool.lock();
        cb(&pool);
    }

    fn config(&self) -> &HostConfig {
        &self.config
    }
}

impl ModuleHost {
    fn emit(&self, event: Event, synchronous: bool) {
        trace!(
            event = %event_name(event.ty).unwrap_or_default(),
            ty = event.ty,
            synchronous,
            "emit_event"
        );

        let snapshot: Vec<Weak<ModuleContainer>> = {
            let reg = self.registry.lock();
            reg.event_subs.get(event.ty).cloned().unwrap_or_default()
        };
        if snapshot.is_empty() {
            trace!(ty = event.ty, "emit_event: no subscribers");
            return;
        }

        for weak in snapshot {
            match weak.upgrade() {
                Some(mc) => {
                    if synchronous {
                        mc.emit_event_sync(&event);
                    } else {
                        mc.push_event(event.clone());
                    }
                }
                None => trace!(ty = event.ty, "emit_event: subscriber expired"),
            }
        }
    }
}

// =============================================================================
// Access policy
// =============================================================================

/// Reject self-access and access to a target that (transitively) depends
/// on the caller: if A ever declares a dependency on B, B may never
/// synchronously call A. That pins the synchronous call graph to a
/// sub-DAG of the inverse dependency graph.
fn check_valid_access_locked(
    reg: &RegistryState,
    target: &Arc<ModuleContainer>,
    caller: &Arc<ModuleContainer>,
) -> Result<(), HostError> {
    if Arc::ptr_eq(target, caller) {
        return Err(HostError::InvalidAccess {
            target: target.info.name.clone(),
            caller: caller.info.name.clone(),
            reason: "accessing itself is disallowed".into(),
        });
    }
    let mut visited = BTreeSet::new();
    if is_dependency_locked(reg, &target.info, &caller.info.name, &mut visited) {
        return Err(HostError::InvalidAccess {
            target: target.info.name.clone(),
            caller: caller.info.name.clone(),
            reason: "target depends on caller - access must happen the other way around".into(),
        });
    }
    Ok(())
}

/// Does `dependent` reach `dependency_name` through declared dependencies?
/// Breadth-first over the declared lists, then through loaded modules.
fn is_dependency_locked(
    reg: &RegistryState,
    dependent: &ModuleInfo,
    dependency_name: &str,
    visited: &mut BTreeSet<String>,
) -> bool {
    for dep in &dependent.meta.dependencies {
        if dep.module == dependency_name {
            return true;
        }
    }
    for dep in &dependent.meta.dependencies {
        if !visited.insert(dep.module.clone()) {
            continue;
        }
        if let Some(mc) = reg.modules.get(&dep.module) {
            if is_dependency_locked(reg, &mc.info, dependency_name, visited) {
                return true;
            }
        }
    }
    false
}

// =============================================================================
// Watch thread
// =============================================================================

fn spawn_watch_thread(
    host: Weak<ModuleHost>,
    rx: Receiver<String>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let crash_host = host.clone();
    std::thread::Builder::new()
        .name("host/watch".into())
        .spawn(move || {
            if catch_unwind(AssertUnwindSafe(|| watch_thread_main(host, rx, stop))).is_err() {
                error!("file watch thread crashed");
                if let Some(host) = crash_host.upgrade() {
                    host.shutdown(1, "file watch thread crashed");
                }
            }
        })
        .expect("failed to spawn watch thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use remod_api::{EventType, ModuleResult, Payload};
    use std::sync::mpsc::Sender;
    use std::time::Duration;

    struct Recorder {
        name: String,
        host: Arc<dyn Host>,
        subs: Vec<String>,
        tx: Sender<EventType>,
    }

    impl Module for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn init(&mut self) -> ModuleResult {
            for sub in &self.subs {
                self.host.sub_event(event_type(sub));
            }
            Ok(())
        }

        fn event(&mut self, ty: EventType, _payload: Option<&Payload>) -> ModuleResult {
            self.tx.send(ty).unwrap();
            Ok(())
        }
    }

    fn load_recorder(
        host: &Arc<ModuleHost>,
        name: &str,
        subs: &[&str],
        tx: Sender<EventType>,
    ) {
        let module = Box::new(Recorder {
            name: name.to_string(),
            host: Arc::clone(host) as Arc<dyn Host>,
            subs: subs.iter().map(|s| s.to_string()).collect(),
            tx,
        });
        host.load_module_direct(module, ModuleInfo::new(name, ""))
            .unwrap();
    }

    #[test]
    fn modified_modules_fold_into_one_event_per_tick() {
        let host = ModuleHost::new(HostConfig::default());
        let (tx, rx) = mpsc::channel();
        load_recorder(&host, "watched", &["core:module_modified"], tx);

        // Many raw notifications for one edit coalesce in the set.
        host.mark_modified("watched".to_string());
        host.mark_modified("watched".to_string());
        host.handle_events();

        let ty = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ty, event_type("core:module_modified"));
        assert!(
            rx.recv_timeout(Duration::from_millis(300)).is_err(),
            "coalesced modifications must emit once"
        );

        host.thread_request_stop();
        host.thread_join();
    }

    #[test]
    fn modification_of_unknown_module_is_dropped() {
        let host = ModuleHost::new(HostConfig::default());
        host.mark_modified("never-seen".to_string());
        // Must not panic or emit; there is no info to report.
        host.handle_events();
        host.thread_request_stop();
        host.thread_join();
    }

    #[test]
    fn sub_event_outside_module_thread_is_refused() {
        let host = ModuleHost::new(HostConfig::default());
        host.sub_event(event_type("test:outside"));
        assert!(host.registry.lock().event_subs.iter().all(Vec::is_empty));
        host.thread_request_stop();
        host.thread_join();
    }

    #[test]
    fn load_order_shrinks_on_unload() {
        let host = ModuleHost::new(HostConfig::default());
        let (tx, _rx) = mpsc::channel();
        load_recorder(&host, "first", &[], tx.clone());
        load_recorder(&host, "second", &[], tx);

        host.unload_module_u("first");
        {
            let reg = host.registry.lock();
            assert_eq!(reg.load_order, vec!["second".to_string()]);
            assert!(reg.module_info.contains_key("first"), "info is ever-seen");
        }

        host.thread_request_stop();
        host.thread_join();
    }
}
