use crate::coordinator::GridCoordinator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(200);
const ACTIVITY_QUEUE_CAPACITY: usize = 64;

/// Handle to the single manifest-rebuild task of a grid. Cloned into every session.
#[derive(Clone)]
pub struct DebouncedPersister {
    tx: mpsc::Sender<()>,
    rebuilds: Arc<AtomicU64>,
}

impl DebouncedPersister {
    pub fn spawn(
        coordinator: Arc<GridCoordinator>,
        quiet_period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(ACTIVITY_QUEUE_CAPACITY);
        let rebuilds = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(debounce_loop(
            rx,
            coordinator,
            quiet_period,
            shutdown,
            rebuilds.clone(),
        ));
        (Self { tx, rebuilds }, task)
    }

    /// Never blocks. A full queue already guarantees a pending rebuild.
    pub fn notify_activity(&self) {
        let _ = self.tx.try_send(());
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }
}

async fn debounce_loop(
    mut rx: mpsc::Receiver<()>,
    coordinator: Arc<GridCoordinator>,
    quiet_period: Duration,
    mut shutdown: watch::Receiver<bool>,
    rebuilds: Arc<AtomicU64>,
) {
    let mut pending = false;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            activity = rx.recv() => {
                match activity {
                    Some(()) => pending = true,
                    None => break,
                }
            }
            _ = tokio::time::sleep(quiet_period), if pending => {
                pending = false;
                rebuild(&coordinator, &rebuilds).await;
            }
        }
    }

    while rx.try_recv().is_ok() {
        pending = true;
    }
    if pending {
        rebuild(&coordinator, &rebuilds).await;
    }
    debug!(event = "persister_stop", rebuilds = rebuilds.load(Ordering::SeqCst));
}

async fn rebuild(coordinator: &GridCoordinator, rebuilds: &AtomicU64) {
    match coordinator.rebuild_manifest().await {
        Ok(names) => {
            rebuilds.fetch_add(1, Ordering::SeqCst);
            debug!(event = "manifest_rebuilt", artifacts = names.len());
        }
        Err(err) => {
            warn!(event = "manifest_error", error = %err);
        }
    }
}
