//! Per-module container: the module instance, its worker thread, and the
//! direct-call protocol.
//!
//! # Protocol
//!
//! Three semaphores coordinate callers with the worker:
//!
//! - `direct_cb_free_sem` (initial 1) — admission gate; at most one direct
//!   callback is in flight per container.
//! - `event_queue_sem` — counts queued events plus one for a parked
//!   callback; the worker waits on it between iterations.
//! - `direct_cb_executed_sem` (initial 0) — posted by the worker when the
//!   parked callback has been consumed, successfully or not.
//!
//! Nested direct calls work because the caller's thread blocks in
//! `execute_direct_cb` while the target's worker runs the callback; the
//! target's code is then free to direct-call a third module from the
//! worker it is running on. The access policy in the host keeps the
//! resulting wait graph acyclic.
//!
//! # Locks
//!
//! `queue` (FIFO + callback slot) and `thread` are held only for short
//! non-blocking sections. `module` is locked only by the owning worker
//! while module code runs — queued events, direct callbacks and
//! synchronous emission all execute there — and by teardown after the
//! worker has exited, so it is never contended during execution and no
//! other thread ever holds a container lock across module code. Nothing
//! acquires `module` while holding the host registry lock, so module
//! code may call back into the host freely; blocking on *another*
//! container's semaphores from inside module code is exactly what the
//! dependency DAG keeps deadlock-free.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use remod_api::{Event, Host, HostError, Module, ModuleInfo, ModuleResult};
use tracing::{debug, error, trace, warn};

use crate::host::ModuleHost;
use crate::sync::Semaphore;

/// Type-erased direct callback as parked in the slot.
pub type DirectCb = Box<dyn FnOnce(&mut dyn Module) -> ModuleResult + Send>;

/// One hop of diagnostic context collected while an error unwinds a
/// direct-call chain.
pub struct BacktraceStep {
    pub module: String,
    pub backtrace: Backtrace,
}

impl BacktraceStep {
    pub(crate) fn capture(module: &str) -> Self {
        Self {
            module: module.to_string(),
            backtrace: Backtrace::capture(),
        }
    }
}

struct QueueState {
    /// The single-slot parked direct callback.
    direct_cb: Option<DirectCb>,
    /// Error produced by the last direct callback; read by the waiting
    /// caller after `direct_cb_executed_sem`.
    direct_cb_error: Option<HostError>,
    /// Container whose thread is currently blocked on this container's
    /// direct call, if any. Forms the caller chain for diagnostics.
    caller: Option<Arc<ModuleContainer>>,
    /// Backtrace chain for direct-call errors initiated by this
    /// container's thread. Cleared when a new callback is parked here.
    backtraces: Vec<BacktraceStep>,
    events: VecDeque<Event>,
}

thread_local! {
    static CURRENT_CONTAINER: RefCell<Option<Weak<ModuleContainer>>> =
        const { RefCell::new(None) };
}

/// The container of the module whose worker thread we are on, if any.
pub fn current_container() -> Option<Arc<ModuleContainer>> {
    CURRENT_CONTAINER.with(|slot| slot.borrow().as_ref().and_then(Weak::upgrade))
}

/// Runtime wrapper around one loaded module.
pub struct ModuleContainer {
    pub info: ModuleInfo,
    host: Weak<ModuleHost>,

    /// The module instance. `None` for pure-scripted modules and after the
    /// worker has dropped it. Locked only by the owning worker during
    /// execution, and by teardown once the worker is gone.
    module: Mutex<Option<Box<dyn Module>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    queue: Mutex<QueueState>,

    event_queue_sem: Semaphore,
    direct_cb_executed_sem: Semaphore,
    direct_cb_free_sem: Semaphore,

    stop_requested: AtomicBool,
    in_destructor: AtomicBool,
}

impl ModuleContainer {
    pub fn new(
        host: Weak<ModuleHost>,
        module: Option<Box<dyn Module>>,
        info: ModuleInfo,
    ) -> Self {
        Self {
            info,
            host,
            module: Mutex::new(module),
            thread: Mutex::new(None),
            queue: Mutex::new(QueueState {
                direct_cb: None,
                direct_cb_error: None,
                caller: None,
                backtraces: Vec::new(),
                events: VecDeque::new(),
            }),
            event_queue_sem: Semaphore::new(0),
            direct_cb_executed_sem: Semaphore::new(0),
            direct_cb_free_sem: Semaphore::new(1),
            stop_requested: AtomicBool::new(false),
            in_destructor: AtomicBool::new(false),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn in_destructor(&self) -> bool {
        self.in_destructor.load(Ordering::SeqCst)
    }

    /// Spawn the worker thread and run `init()` on it.
    pub fn init_and_start_thread(self: &Arc<Self>) -> Result<(), HostError> {
        {
            let module = self.module.lock();
            let Some(module) = module.as_ref() else {
                return Err(HostError::LoadFailed {
                    module: self.info.name.clone(),
                    reason: "module is null".into(),
                });
            };
            if module.name() != self.info.name {
                return Err(HostError::LoadFailed {
                    module: self.info.name.clone(),
                    reason: format!(
                        "module name mismatch: info says \"{}\", module says \"{}\"",
                        self.info.name,
                        module.name()
                    ),
                });
            }
        }
        {
            let mut thread = self.thread.lock();
            if thread.is_some() {
                return Err(HostError::LoadFailed {
                    module: self.info.name.clone(),
                    reason: "worker thread already started".into(),
                });
            }
            let mc = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(self.info.name.clone())
                .spawn(move || worker_main(mc))
                .map_err(|e| HostError::LoadFailed {
                    module: self.info.name.clone(),
                    reason: format!("failed to spawn worker thread: {e}"),
                })?;
            *thread = Some(handle);
        }
        // Initialize on the worker thread.
        self.execute_direct_cb(Box::new(|module| module.init()), None)
    }

    /// Ask the worker to stop. Posts both semaphores so a parked caller
    /// and the worker itself unblock promptly.
    pub fn thread_request_stop(&self) {
        if self.thread.lock().is_none() {
            return;
        }
        trace!(module = %self.info.name, "asking worker to exit");
        self.stop_requested.store(true, Ordering::SeqCst);
        // Open the admission gate so waiting callers can observe the stop.
        self.direct_cb_free_sem.post();
        // Wake the worker so it can exit.
        self.event_queue_sem.post();
    }

    /// Join the worker. The module is normally dropped by the worker; if
    /// the thread died some other way, drop the leftover here.
    pub fn thread_join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            trace!(module = %self.info.name, "waiting for worker to exit");
            if handle.join().is_err() {
                error!(module = %self.info.name, "worker thread panicked outside module code");
            }
        }
        let leftover = self.module.lock().take();
        if leftover.is_some() {
            warn!(module = %self.info.name, "module not dropped by its worker; dropping here");
        }
        drop(leftover);
    }

    pub fn push_event(&self, event: Event) {
        let mut queue = self.queue.lock();
        queue.events.push_back(event);
        drop(queue);
        self.event_queue_sem.post();
    }

    /// Deliver an event synchronously: parked as a direct call and run on
    /// the worker thread, with the calling thread blocked until the
    /// handler has returned. Module code never executes under a lock held
    /// by the calling thread. Driver-thread initialization use only;
    /// failures are fatal exactly like queued-event failures.
    pub fn emit_event_sync(self: &Arc<Self>, event: &Event) {
        let ev = event.clone();
        let result = self.execute_direct_cb(
            Box::new(move |module| module.event(ev.ty, ev.payload.as_deref())),
            None,
        );
        match result {
            Ok(()) => {}
            Err(HostError::TargetModuleNotAvailable { .. }) => {
                warn!(
                    module = %self.info.name,
                    "worker unavailable; synchronous event not delivered"
                );
            }
            Err(HostError::DirectCallback { source, .. }) => {
                report_event_failure(self, source.to_string());
            }
            Err(HostError::DirectCallbackPanic { message, .. }) => {
                report_event_failure(self, message);
            }
            Err(other) => report_event_failure(self, other.to_string()),
        }
    }

    /// Run a callback on this container's worker thread, blocking until it
    /// has been consumed. `caller` is the container whose thread is doing
    /// the call, when the caller is a module.
    pub fn execute_direct_cb(
        self: &Arc<Self>,
        cb: DirectCb,
        caller: Option<&Arc<ModuleContainer>>,
    ) -> Result<(), HostError> {
        let caller_name = caller
            .map(|mc| mc.info.name.clone())
            .unwrap_or_else(|| "__unknown".into());
        if let Some(caller) = caller {
            if Arc::ptr_eq(self, caller) {
                return Err(HostError::InvalidAccess {
                    target: self.info.name.clone(),
                    caller: caller_name,
                    reason: "accessing itself is disallowed".into(),
                });
            }
        }

        // A container with no worker (pure-scripted module, or already
        // torn down) can never consume the slot.
        if self.thread.lock().is_none() && !self.stop_requested() {
            return Err(HostError::TargetModuleNotAvailable {
                target: self.info.name.clone(),
                caller: caller_name,
            });
        }

        trace!(module = %self.info.name, "waiting for direct_cb to be free");
        self.direct_cb_free_sem.wait();

        // Last chance to turn around: the worker may never pick this up.
        if self.stop_requested() {
            trace!(module = %self.info.name, "stop requested; cancelling direct call");
            // Let the next waiters pass too.
            self.direct_cb_free_sem.post();
            return Err(HostError::TargetModuleNotAvailable {
                target: self.info.name.clone(),
                caller: caller_name,
            });
        }

        {
            let mut queue = self.queue.lock();
            queue.direct_cb = Some(cb);
            queue.direct_cb_error = None;
            queue.caller = caller.cloned();
            queue.backtraces.clear();
        }
        self.event_queue_sem.post();

        trace!(module = %self.info.name, "waiting for direct_cb execution");
        self.direct_cb_executed_sem.wait();

        let error = {
            let mut queue = self.queue.lock();
            queue.caller = None;
            queue.direct_cb_error.take()
        };
        self.direct_cb_free_sem.post();

        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Outermost container of the caller chain currently blocked on this
    /// one, or `self` if this container's thread started the chain.
    pub fn chain_root(self: &Arc<Self>) -> Arc<ModuleContainer> {
        let mut current = Arc::clone(self);
        loop {
            let next = current.queue.lock().caller.clone();
            match next {
                Some(parent) => current = parent,
                None => return current,
            }
        }
    }

    pub fn push_backtrace_step(&self, step: BacktraceStep) {
        self.queue.lock().backtraces.push(step);
    }

    fn take_backtraces(&self) -> Vec<BacktraceStep> {
        std::mem::take(&mut self.queue.lock().backtraces)
    }
}

// =============================================================================
// Worker thread
// =============================================================================

fn worker_main(mc: Arc<ModuleContainer>) {
    CURRENT_CONTAINER.with(|slot| {
        *slot.borrow_mut() = Some(Arc::downgrade(&mc));
    });

    loop {
        // Wait for an event, a parked callback, or a stop wakeup.
        mc.event_queue_sem.wait();

        let mut direct_cb = None;
        let mut event = None;
        {
            let mut queue = mc.queue.lock();
            if let Some(cb) = queue.direct_cb.take() {
                direct_cb = Some(cb);
            } else if let Some(ev) = queue.events.pop_front() {
                event = Some(ev);
            }
        }

        if mc.stop_requested() {
            debug!(module = %mc.info.name, "stopping event loop");
            // A parked caller is waiting on us; refuse the call so it can
            // return in bounded time, and drop the callback unrun.
            if let Some(cb) = direct_cb {
                debug!(module = %mc.info.name, "discarding direct_cb");
                drop(cb);
                {
                    let mut queue = mc.queue.lock();
                    let caller = queue
                        .caller
                        .as_ref()
                        .map(|c| c.info.name.clone())
                        .unwrap_or_else(|| "__unknown".into());
                    queue.direct_cb_error = Some(HostError::TargetModuleNotAvailable {
                        target: mc.info.name.clone(),
                        caller,
                    });
                }
                mc.direct_cb_executed_sem.post();
            }
            if event.is_some() {
                debug!(module = %mc.info.name, "discarding event");
            }
            break;
        }

        if let Some(cb) = direct_cb {
            handle_direct_cb(&mc, cb);
        } else if let Some(ev) = event {
            handle_event(&mc, ev);
        } else {
            warn!(
                module = %mc.info.name,
                "event semaphore signalled but no event, callback or stop request"
            );
        }
    }

    // Drop the module on this thread: module-owned resources may require
    // destruction on the thread that created them.
    let module = mc.module.lock().take();
    mc.in_destructor.store(true, Ordering::SeqCst);
    drop(module);
    mc.in_destructor.store(false, Ordering::SeqCst);
}

fn handle_direct_cb(mc: &Arc<ModuleContainer>, cb: DirectCb) {
    let error = {
        let mut module = mc.module.lock();
        match module.as_mut() {
            None => {
                warn!(module = %mc.info.name, "module is null; cannot run direct callback");
                None
            }
            Some(module) => {
                trace!(module = %mc.info.name, "executing direct_cb");
                match catch_unwind(AssertUnwindSafe(|| cb(module.as_mut()))) {
                    Ok(Ok(())) => None,
                    Ok(Err(source)) => Some(HostError::DirectCallback {
                        module: mc.info.name.clone(),
                        source,
                    }),
                    Err(payload) => Some(HostError::DirectCallbackPanic {
                        module: mc.info.name.clone(),
                        message: panic_message(&payload),
                    }),
                }
            }
        }
    };

    if error.is_some() {
        // Seed the chain initiator's backtrace list with the failure site,
        // if a chain exists and nothing has been recorded yet.
        let root = mc.chain_root();
        if !Arc::ptr_eq(&root, mc) {
            let mut queue = root.queue.lock();
            if queue.backtraces.is_empty() {
                queue.backtraces.push(BacktraceStep::capture(&mc.info.name));
            }
        }
    }

    mc.queue.lock().direct_cb_error = error;
    mc.direct_cb_executed_sem.post();
}

fn handle_event(mc: &Arc<ModuleContainer>, event: Event) {
    let mut module = mc.module.lock();
    let Some(module_ref) = module.as_mut() else {
        warn!(module = %mc.info.name, "module is null; cannot handle event");
        return;
    };
    let result = catch_unwind(AssertUnwindSafe(|| {
        module_ref.event(event.ty, event.payload.as_deref())
    }));
    drop(module);
    report_event_result(mc, result);
}

/// An error or panic escaping `event()` is fatal: events are
/// fire-and-forget, so there is nobody else to hand the failure to.
fn report_event_result(mc: &Arc<ModuleContainer>, result: std::thread::Result<ModuleResult>) {
    let message = match result {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_message(&payload),
    };
    report_event_failure(mc, message);
}

fn report_event_failure(mc: &Arc<ModuleContainer>, message: String) {
    let chain = mc.take_backtraces();
    if chain.is_empty() {
        error!(module = %mc.info.name, error = %message, "event handler failed");
    } else {
        error!(
            module = %mc.info.name,
            error = %message,
            "event handler failed; direct-call chain follows"
        );
        for (i, step) in chain.iter().enumerate() {
            error!(hop = i, module = %step.module, backtrace = %step.backtrace, "chain hop");
        }
    }

    if let Some(host) = mc.host.upgrade() {
        host.shutdown(
            1,
            &format!("module [{}] event handler failed: {message}", mc.info.name),
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}
