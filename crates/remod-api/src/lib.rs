//! remod-api — the module SDK.
//!
//! Everything a module needs to compile against the remod host: the
//! [`Module`] trait and its factory macro, the event types and the
//! process-global event-name registry, module metadata, and the [`Host`]
//! capability trait through which modules talk back to the host.
//!
//! # Same-compiler invariant
//!
//! Modules are compiled with the same `rustc` as the host and link this
//! crate dynamically (the host passes the prebuilt dylib via `--extern`).
//! That is what makes it sound to pass `repr(Rust)` data — `String`,
//! `Box<dyn Module>`, `Arc<dyn Host>` — across the module boundary, and it
//! is why there is exactly one copy of the event-name registry in the
//! process.
//!
//! # No external dependencies
//!
//! This crate is std-only on purpose. A dependency here would have to be
//! resolvable (rmeta and all) by every module build that consumes the
//! prebuilt dylib; keeping the SDK dependency-free keeps module builds
//! down to "rustc + one --extern".
//!
//! # Reload boundaries
//!
//! A module's shared library is unloaded after its worker thread has been
//! joined. Function pointers or trait objects smuggled out of a module and
//! stored across a reload boundary dangle at that point; don't. All
//! cross-module interaction goes through the event bus or
//! [`Host::access_module`].

mod error;
mod event;
mod host;
mod info;
mod module;
pub mod pool;

pub use error::{HostError, ModuleError, ModuleResult};
pub use event::{
    event_name, event_type, Event, EventType, ModuleLoadedEvent, ModuleModifiedEvent,
    ModuleUnloadedEvent, Payload,
};
pub use host::{DirectCallback, Host, HostConfig};
pub use info::{ModuleDependency, ModuleInfo, ModuleMeta};
pub use module::{CreateModuleFn, HostHandle, Module};
pub use pool::ThreadPool;
