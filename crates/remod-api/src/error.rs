//! Host error taxonomy.
//!
//! Hand-written `Display`/`Error` impls: this crate stays dependency-free
//! (see the crate-level docs), so no derive macros here.

use std::error::Error;
use std::fmt;

/// Errors a module can produce. Boxed so module code can use `?` on
/// whatever error type it has at hand.
pub type ModuleError = Box<dyn Error + Send + Sync>;

/// Result alias for module entry points and direct callbacks.
pub type ModuleResult<T = ()> = Result<T, ModuleError>;

/// Errors raised by host operations.
#[derive(Debug)]
pub enum HostError {
    /// The named module is not currently loaded.
    ModuleNotFound(String),
    /// The target's worker thread has been asked to stop; the direct call
    /// was refused or discarded.
    TargetModuleNotAvailable { target: String, caller: String },
    /// The compiler adapter failed to produce a shared object.
    BuildFailed { module: String, reason: String },
    /// The shared object could not be opened, or the factory symbol is
    /// missing or returned null.
    LoadFailed { module: String, reason: String },
    /// The access policy denied a direct call.
    InvalidAccess {
        target: String,
        caller: String,
        reason: String,
    },
    /// A direct callback returned an error; carried back along the caller
    /// chain to the outermost `access_module` caller.
    DirectCallback {
        module: String,
        source: ModuleError,
    },
    /// A direct callback panicked on the target's worker thread.
    DirectCallbackPanic { module: String, message: String },
}

impl HostError {
    /// The module name the error is about (target side).
    pub fn module(&self) -> &str {
        match self {
            HostError::ModuleNotFound(name) => name,
            HostError::TargetModuleNotAvailable { target, .. } => target,
            HostError::BuildFailed { module, .. } => module,
            HostError::LoadFailed { module, .. } => module,
            HostError::InvalidAccess { target, .. } => target,
            HostError::DirectCallback { module, .. } => module,
            HostError::DirectCallbackPanic { module, .. } => module,
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::ModuleNotFound(name) => write!(f, "module not found: {name}"),
            HostError::TargetModuleNotAvailable { target, caller } => write!(
                f,
                "target module [{target}] is stopping - called by [{caller}]"
            ),
            HostError::BuildFailed { module, reason } => {
                write!(f, "failed to build module {module}: {reason}")
            }
            HostError::LoadFailed { module, reason } => {
                write!(f, "failed to load module {module}: {reason}")
            }
            HostError::InvalidAccess {
                target,
                caller,
                reason,
            } => write!(f, "cannot access \"{target}\" from \"{caller}\": {reason}"),
            HostError::DirectCallback { module, source } => {
                write!(f, "module [{module}] callback failed: {source}")
            }
            HostError::DirectCallbackPanic { module, message } => {
                write!(f, "module [{module}] callback panicked: {message}")
            }
        }
    }
}

impl Error for HostError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HostError::DirectCallback { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_both_parties() {
        let err = HostError::TargetModuleNotAvailable {
            target: "net".into(),
            caller: "game".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("[net]"));
        assert!(msg.contains("[game]"));
    }

    #[test]
    fn callback_error_has_source() {
        let inner: ModuleError = "inner failure".into();
        let err = HostError::DirectCallback {
            module: "net".into(),
            source: inner,
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("inner failure"));
    }

    #[test]
    fn module_accessor() {
        assert_eq!(HostError::ModuleNotFound("abc".into()).module(), "abc");
    }
}
