//! remod-host — a hot-reloadable module host.
//!
//! The host compiles native extension modules on demand, loads them from
//! shared objects, runs each in its own worker thread, and routes events
//! and synchronous cross-module calls between them:
//!
//! 1. The [`ModuleHost`] keeps the registry: loaded modules, their infos,
//!    load order, event subscriptions, and pending reload work.
//! 2. Each module lives in a [`container`] with a worker thread draining
//!    an event FIFO, interleaved with at most one in-flight direct call.
//! 3. `access_module` runs a callback on the target's worker thread while
//!    the caller blocks; a dependency-derived DAG policy makes the wait
//!    graph acyclic before any blocking happens.
//! 4. The [`compile`] cache turns a module source path into a loadable
//!    shared object, keyed by a content hash so unchanged modules never
//!    invoke the compiler.
//! 5. A notify-backed [`watch`] loop folds file changes into reload
//!    requests serviced by the driver thread's `handle_events` tick.
//!
//! Threading model is deliberately one OS thread per module with blocking
//! semaphores, no async: module-owned resources get deterministic
//! destruction on the thread that created them.

pub mod compile;
pub mod config;
pub mod container;
pub mod error;
pub mod host;
pub mod loader;
pub mod sync;
pub mod watch;

pub use compile::{BuildDriver, BuildFlags, CommandDriver, CompileCache};
pub use config::{load_config, parse_config};
pub use error::{CompileError, ConfigError, LoaderError};
pub use host::ModuleHost;

// Modules program against these; re-exported so embedders need one import.
pub use remod_api as api;
