//! File watching: external edits become reconciliation work.
//!
//! Change notifications land on a channel and a dedicated thread replays
//! them through the store, which takes the same mutation lock as foreground
//! edits. Delivery is at-least-once with no cross-path ordering, so the
//! handler only ever looks at the file's current state.

use crate::error::{CoreError, Result};
use crate::index;
use crate::store::Store;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use taskvault_types::VaultChange;

/// Handle for the background reconciliation loop. Dropping it (or calling
/// `stop`) shuts the loop down; the watcher lives as long as the handle.
pub struct Reconciler {
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    _watcher: RecommendedWatcher,
}

impl Reconciler {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Watch the store's vault root and reconcile every observed change.
pub fn spawn_reconciler(store: Arc<Store>) -> Result<Reconciler> {
    let (tx, rx) = mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )
    .map_err(watch_error)?;

    watcher
        .watch(store.vault().root(), RecursiveMode::Recursive)
        .map_err(watch_error)?;

    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let join = thread::spawn(move || run_loop(store, rx, thread_stop));

    Ok(Reconciler {
        stop,
        join: Some(join),
        _watcher: watcher,
    })
}

fn run_loop(
    store: Arc<Store>,
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(Ok(event)) => {
                for path in &event.paths {
                    handle_path(&store, path);
                }
            }
            Ok(Err(err)) => tracing::warn!("watcher error: {err}"),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// One observed path: snapshot the foreground generation first, then let
/// the store decide whether the observation is already stale.
fn handle_path(store: &Store, path: &Path) {
    let rel = index::rel_path(store.vault(), path);
    let observed_gen = store.generation_of(&rel);

    let change = if path.exists() {
        VaultChange::Upserted {
            path: path.to_path_buf(),
        }
    } else {
        VaultChange::Removed {
            path: path.to_path_buf(),
        }
    };

    if let Err(err) = store.reconcile_if_fresh(&change, observed_gen) {
        tracing::warn!("reconciliation of {} failed: {err}", path.display());
    }
}

fn watch_error(err: notify::Error) -> CoreError {
    CoreError::StorageIo(std::io::Error::other(err))
}
