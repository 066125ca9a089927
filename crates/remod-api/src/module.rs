//! The module capability set and the factory ABI.

use std::ffi::c_void;
use std::sync::Arc;

use crate::error::ModuleResult;
use crate::event::{EventType, Payload};
use crate::host::Host;

/// A dynamically loaded unit of code.
///
/// Lifecycle is strict: constructed by the factory on the host's driver
/// thread, `init()` called on the module's own worker thread, then zero or
/// more `event`/direct-callback invocations on that worker thread, then
/// dropped on that worker thread.
pub trait Module: Send {
    /// The module's name; must match the `ModuleInfo` it was loaded under.
    fn name(&self) -> &str;

    /// Called once on the worker thread before any events are delivered.
    fn init(&mut self) -> ModuleResult;

    /// Handle one event. An error (or panic) escaping this is fatal to the
    /// host: events are fire-and-forget, there is no caller to hand the
    /// failure to.
    fn event(&mut self, ty: EventType, payload: Option<&Payload>) -> ModuleResult;
}

/// FFI bridge handed to module factories. Concrete so it can cross the
/// `extern "C"` boundary as a thin pointer; the factory clones the
/// `Arc<dyn Host>` out of it.
pub struct HostHandle {
    host: Arc<dyn Host>,
}

impl HostHandle {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> Arc<dyn Host> {
        Arc::clone(&self.host)
    }
}

/// Signature of the exported factory symbol `create_module_<name>`.
///
/// Returns a `Box<Box<dyn Module>>` erased to `*mut c_void` (thin pointer
/// both sides of the boundary), or null on failure. The host owns the
/// returned module and drops it on the worker thread.
pub type CreateModuleFn = unsafe extern "C" fn(host: *const HostHandle) -> *mut c_void;

/// Declare a module factory.
///
/// Generates the `#[no_mangle] extern "C"` boilerplate for the factory
/// symbol. The symbol name must be `create_module_<name>` where `<name>`
/// is the module's `ModuleInfo` name; the host resolves exactly that.
///
/// # Example
///
/// ```ignore
/// struct Ticker { host: Arc<dyn Host>, ticks: u64 }
///
/// remod_api::declare_module!(create_module_ticker, |host| Ticker { host, ticks: 0 });
/// ```
#[macro_export]
macro_rules! declare_module {
    ($factory:ident, $create:expr) => {
        #[no_mangle]
        pub unsafe extern "C" fn $factory(
            host: *const $crate::HostHandle,
        ) -> *mut ::std::ffi::c_void {
            let host: ::std::sync::Arc<dyn $crate::Host> = (*host).host();
            let create: fn(::std::sync::Arc<dyn $crate::Host>) -> _ = $create;
            let module: ::std::boxed::Box<dyn $crate::Module> =
                ::std::boxed::Box::new(create(host));
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(module)).cast()
        }
    };
}
