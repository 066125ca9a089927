//! Events and the process-global event-name registry.
//!
//! Event types are small integers handed out by a registry that maps names
//! to ids, first come first served. Ids are not stable across runs. The
//! registry grows for the lifetime of the process and is never torn down,
//! so an id stays valid until exit.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

/// Process-wide event type id.
pub type EventType = usize;

/// Opaque event payload. Shared across subscribers by `Arc`; downcast with
/// [`Event::payload_as`].
pub type Payload = dyn Any + Send + Sync;

struct Registry {
    ids: HashMap<String, EventType>,
    names: Vec<String>,
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        RwLock::new(Registry {
            ids: HashMap::new(),
            names: Vec::new(),
        })
    })
}

/// Resolve a name to its event type id, allocating one on first use.
pub fn event_type(name: &str) -> EventType {
    {
        let reg = registry().read().unwrap();
        if let Some(&ty) = reg.ids.get(name) {
            return ty;
        }
    }
    let mut reg = registry().write().unwrap();
    // Raced writers may have inserted between the locks.
    if let Some(&ty) = reg.ids.get(name) {
        return ty;
    }
    let ty = reg.names.len();
    reg.names.push(name.to_string());
    reg.ids.insert(name.to_string(), ty);
    ty
}

/// Look up the name behind an event type id.
pub fn event_name(ty: EventType) -> Option<String> {
    registry().read().unwrap().names.get(ty).cloned()
}

/// A value-copied event: a type id plus an optional shared payload.
#[derive(Clone)]
pub struct Event {
    pub ty: EventType,
    pub payload: Option<Arc<Payload>>,
}

impl Event {
    /// Event with no payload, by name.
    pub fn new(name: &str) -> Self {
        Self {
            ty: event_type(name),
            payload: None,
        }
    }

    /// Event with a payload, by name.
    pub fn with_payload<T: Any + Send + Sync>(name: &str, payload: T) -> Self {
        Self {
            ty: event_type(name),
            payload: Some(Arc::new(payload)),
        }
    }

    /// Event by already-resolved type id.
    pub fn typed(ty: EventType) -> Self {
        Self { ty, payload: None }
    }

    /// Downcast the payload.
    pub fn payload_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref())
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("ty", &self.ty)
            .field("name", &event_name(self.ty))
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

// Payloads for the host's own lifecycle events.

/// Payload of `core:module_loaded`.
pub struct ModuleLoadedEvent {
    pub name: String,
}

/// Payload of `core:module_unloaded`.
pub struct ModuleUnloadedEvent {
    pub name: String,
}

/// Payload of `core:module_modified`.
pub struct ModuleModifiedEvent {
    pub name: String,
    pub path: std::path::PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_within_a_run() {
        let a = event_type("test:event_a");
        let b = event_type("test:event_b");
        assert_ne!(a, b);
        assert_eq!(event_type("test:event_a"), a);
        assert_eq!(event_name(a).as_deref(), Some("test:event_a"));
    }

    #[test]
    fn payload_roundtrip() {
        let ev = Event::with_payload("test:payload", 42u32);
        assert_eq!(ev.payload_as::<u32>(), Some(&42));
        assert!(ev.payload_as::<String>().is_none());
    }

    #[test]
    fn clone_shares_payload() {
        let ev = Event::with_payload("test:shared", String::from("x"));
        let ev2 = ev.clone();
        assert_eq!(ev.ty, ev2.ty);
        assert_eq!(ev2.payload_as::<String>().map(String::as_str), Some("x"));
    }

    #[test]
    fn concurrent_registration_yields_one_id() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| event_type("test:concurrent")))
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }
}
