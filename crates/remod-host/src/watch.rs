//! File watching for the reload loop.
//!
//! One [`FileWatch`] per module, watching the directories of every source
//! file that went into the module's content hash. Notify delivers raw
//! filesystem events on its own thread; the watch callback filters them
//! down to the watched files and forwards the module name over a channel.
//!
//! The watch driver thread drains that channel with a bounded timeout so
//! it can observe the stop flag, and folds the names into the host's
//! `modified_modules` set — many raw notifications for one edit coalesce
//! into one entry. A crash in the driver thread is fatal to the host.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info};

use crate::host::ModuleHost;

const WATCH_TICK: Duration = Duration::from_millis(500);

/// Watches one module's source files.
pub struct FileWatch {
    _watcher: RecommendedWatcher,
}

impl FileWatch {
    /// Watch the parent directories of `files`; send `module` on the
    /// channel whenever one of the files themselves changes.
    pub fn new(
        module: &str,
        files: &[PathBuf],
        tx: Sender<String>,
    ) -> Result<Self, notify::Error> {
        let watched: BTreeSet<PathBuf> = files
            .iter()
            .map(|f| f.canonicalize().unwrap_or_else(|_| f.clone()))
            .collect();
        let dirs: BTreeSet<PathBuf> = watched
            .iter()
            .filter_map(|f| f.parent().map(Path::to_path_buf))
            .collect();

        let name = module.to_string();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                match result {
                    Ok(event) => {
                        let hit = event.paths.iter().any(|p| {
                            let canonical = p.canonicalize().unwrap_or_else(|_| p.clone());
                            watched.contains(&canonical)
                        });
                        if hit {
                            // Receiver gone means the host is tearing down.
                            let _ = tx.send(name.clone());
                        }
                    }
                    Err(e) => error!(module = %name, error = %e, "file watch error"),
                }
            })?;

        for dir in &dirs {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }
        debug!(module, dirs = dirs.len(), "watching module sources");

        Ok(Self { _watcher: watcher })
    }
}

/// Body of the watch driver thread.
pub(crate) fn watch_thread_main(
    host: Weak<ModuleHost>,
    rx: Receiver<String>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(WATCH_TICK) {
            Ok(name) => {
                let Some(host) = host.upgrade() else { break };
                info!(module = %name, "module modified");
                host.mark_modified(name);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn change_to_watched_file_reports_module() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mymod.rs");
        std::fs::write(&file, "fn a() {}\n").unwrap();

        let (tx, rx) = mpsc::channel();
        let _watch = FileWatch::new("mymod", std::slice::from_ref(&file), tx).unwrap();

        // Give the OS watcher a moment to arm before writing.
        std::thread::sleep(Duration::from_millis(200));
        std::fs::write(&file, "fn b() {}\n").unwrap();

        let name = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("no notification for watched file");
        assert_eq!(name, "mymod");
    }

    #[test]
    fn change_to_sibling_file_is_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mymod.rs");
        let sibling = dir.path().join("other.rs");
        std::fs::write(&file, "").unwrap();
        std::fs::write(&sibling, "").unwrap();

        let (tx, rx) = mpsc::channel();
        let _watch = FileWatch::new("mymod", std::slice::from_ref(&file), tx).unwrap();

        std::thread::sleep(Duration::from_millis(200));
        std::fs::write(&sibling, "fn c() {}\n").unwrap();

        assert!(
            rx.recv_timeout(Duration::from_millis(700)).is_err(),
            "sibling edits must not be reported"
        );
    }
}
