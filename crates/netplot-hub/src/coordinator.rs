//! Grid-wide lifecycle shared by every connection.
//!
//! A sweep (new grid) takes the write side of the lifecycle lock and keeps it until cell 0
//! persists the first global config. Plot writes and manifest rebuilds take the read side,
//! and a plot is only written when its session joined the current lifecycle.

use netplot_core::{GlobalConfig, PlotRecord};
use netplot_storage::{ArtifactStore, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Lifecycle {
    generation: u64,
}

/// Exclusive hold on a freshly swept lifecycle, released by
/// [`GridCoordinator::save_global_held`] or by dropping it.
pub struct LifecycleGuard {
    lifecycle: OwnedRwLockWriteGuard<Lifecycle>,
}

impl LifecycleGuard {
    pub fn generation(&self) -> u64 {
        self.lifecycle.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalSave {
    pub written: bool,
    /// Lifecycle the caller's records belong to from now on.
    pub generation: u64,
}

pub struct GridCoordinator {
    store: Arc<ArtifactStore>,
    lifecycle: Arc<RwLock<Lifecycle>>,
    global_saved: AtomicBool,
}

impl GridCoordinator {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self {
            store,
            lifecycle: Arc::new(RwLock::new(Lifecycle::default())),
            global_saved: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub async fn generation(&self) -> u64 {
        self.lifecycle.read().await.generation
    }

    pub fn global_saved(&self) -> bool {
        self.global_saved.load(Ordering::SeqCst)
    }

    /// Only the first cell owns the grid; a grid declaration anywhere else is ignored.
    /// The returned guard keeps every other writer out until the first global save.
    pub async fn begin_grid_if_needed(
        &self,
        cell_index: u32,
    ) -> Result<Option<LifecycleGuard>, StorageError> {
        if cell_index != 0 {
            return Ok(None);
        }
        let mut lifecycle = self.lifecycle.clone().write_owned().await;
        let removed = self.store.sweep()?;
        self.global_saved.store(false, Ordering::SeqCst);
        lifecycle.generation += 1;
        info!(
            event = "grid_lifecycle_start",
            generation = lifecycle.generation,
            removed = removed
        );
        Ok(Some(LifecycleGuard { lifecycle }))
    }

    pub fn try_latch_global_save(&self) -> bool {
        self.global_saved
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub async fn save_global(&self, config: &GlobalConfig) -> Result<GlobalSave, StorageError> {
        let lifecycle = self.lifecycle.write().await;
        self.write_global_locked(&lifecycle, config)
    }

    /// Global save for the session that swept the grid; releases the guard afterwards.
    pub fn save_global_held(
        &self,
        guard: LifecycleGuard,
        config: &GlobalConfig,
    ) -> Result<GlobalSave, StorageError> {
        self.write_global_locked(&guard.lifecycle, config)
    }

    fn write_global_locked(
        &self,
        lifecycle: &Lifecycle,
        config: &GlobalConfig,
    ) -> Result<GlobalSave, StorageError> {
        let generation = lifecycle.generation;
        if !self.try_latch_global_save() {
            debug!(event = "global_save_skipped", generation = generation);
            return Ok(GlobalSave {
                written: false,
                generation,
            });
        }
        match self.store.write_global(config) {
            Ok(written) => Ok(GlobalSave {
                written,
                generation,
            }),
            Err(err) => {
                // Let another cell retry the boundary.
                self.global_saved.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Writes `record` unless a sweep ended `generation` in the meantime.
    pub async fn save_plot(
        &self,
        record: &PlotRecord,
        generation: u64,
    ) -> Result<bool, StorageError> {
        let lifecycle = self.lifecycle.read().await;
        if lifecycle.generation != generation {
            warn!(
                event = "stale_plot_dropped",
                plot_area = record.plot_area,
                plot_number = record.plot_number,
                record_generation = generation,
                generation = lifecycle.generation
            );
            return Ok(false);
        }
        self.store.write_plot(record)
    }

    pub async fn rebuild_manifest(&self) -> Result<Vec<String>, StorageError> {
        let _lifecycle = self.lifecycle.read().await;
        self.store.write_manifest()
    }
}
