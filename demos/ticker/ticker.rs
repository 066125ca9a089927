//! Demo module: counts `tick` events and reports over a direct call.
//!
//! Built by the host's compile cache as a cdylib from this single file.
//! The SDK comes in as a prebuilt dylib; point the module's metadata at
//! it, e.g.:
//!
//! ```text
//! meta.rustc_flags = ["--extern", "remod_api=dist/lib/libremod_api.so"]
//! ```
//!
//! Edit this file while the host is running and the file watcher will
//! schedule a reload; the host delivers `core:unload` before the swap and
//! `core:continue` after it, which is where `tmp_store_data` /
//! `tmp_restore_data` carry the counter across.

use std::sync::Arc;

use remod_api::{event_type, EventType, Host, Module, ModuleResult, Payload};

struct Ticker {
    host: Arc<dyn Host>,
    ticks: u64,
}

impl Module for Ticker {
    fn name(&self) -> &str {
        "ticker"
    }

    fn init(&mut self) -> ModuleResult {
        self.host.sub_event(event_type("tick"));
        self.host.sub_event(event_type("core:unload"));
        self.host.sub_event(event_type("core:continue"));
        Ok(())
    }

    fn event(&mut self, ty: EventType, _payload: Option<&Payload>) -> ModuleResult {
        if ty == event_type("tick") {
            self.ticks += 1;
        } else if ty == event_type("core:unload") {
            self.host.tmp_store_data("ticker:count", &self.ticks.to_string());
        } else if ty == event_type("core:continue") {
            if let Some(saved) = self.host.tmp_restore_data("ticker:count") {
                self.ticks = saved.parse()?;
            }
        }
        Ok(())
    }
}

remod_api::declare_module!(create_module_ticker, |host| Ticker { host, ticks: 0 });
