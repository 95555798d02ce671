//! Active registration target and the off-path map loader.
//!
//! [`MapStore`] owns the one target every scan cycle aligns against.  A scan
//! cycle holds [`MapStore::borrow_for_registration`]'s guard for the whole
//! alignment, and [`MapStore::swap`] takes the same lock, so a map swap and a
//! registration never overlap.
//!
//! [`MapLoader`] does the slow part of a map change (building the target)
//! before touching the lock, which keeps the swap itself a pointer move.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use scanloc_types::{LocError, LocalizerState, PointCloud};
use tracing::{error, info, warn};

use crate::health::HealthBoard;
use crate::registration::{RegistrationEngine, RegistrationParams};

// ────────────────────────────────────────────────────────────────────────────
// MapStore
// ────────────────────────────────────────────────────────────────────────────

/// Mutex-guarded slot for the active target.
#[derive(Debug)]
pub struct MapStore<T> {
    active: Mutex<Option<T>>,
    generation: AtomicU64,
}

impl<T> MapStore<T> {
    /// Empty store; [`has_target`](Self::has_target) is `false` until the
    /// first swap.
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Install `target` and return the one it replaced.
    ///
    /// Blocks while a registration holds the guard.
    pub fn swap(&self, target: T) -> Option<T> {
        let mut slot = self.lock();
        let previous = slot.replace(target);
        self.generation.fetch_add(1, Ordering::SeqCst);
        previous
    }

    /// Lock the slot for one registration.
    pub fn borrow_for_registration(&self) -> TargetGuard<'_, T> {
        TargetGuard { slot: self.lock() }
    }

    pub fn has_target(&self) -> bool {
        self.lock().is_some()
    }

    /// Number of completed swaps.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    // A panic inside a registration leaves the slot itself intact.
    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for MapStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to the active target; swaps wait until it is dropped.
pub struct TargetGuard<'a, T> {
    slot: MutexGuard<'a, Option<T>>,
}

impl<T> TargetGuard<'_, T> {
    /// The active target, or `None` when no map has been loaded.
    pub fn target(&self) -> Option<&T> {
        self.slot.as_ref()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MapLoader
// ────────────────────────────────────────────────────────────────────────────

/// Builds targets from incoming maps and installs them.
pub struct MapLoader<E: RegistrationEngine> {
    engine: Arc<E>,
    store: Arc<MapStore<E::Target>>,
    params: RegistrationParams,
    health: HealthBoard,
}

impl<E: RegistrationEngine> MapLoader<E> {
    pub fn new(
        engine: Arc<E>,
        store: Arc<MapStore<E::Target>>,
        params: RegistrationParams,
        health: HealthBoard,
    ) -> Self {
        Self {
            engine,
            store,
            params,
            health,
        }
    }

    pub fn params(&self) -> &RegistrationParams {
        &self.params
    }

    /// Build a target from `map` and make it active.
    ///
    /// Returns the store generation after the swap.  On a build failure the
    /// previous target stays active.
    pub fn load(&self, map: &PointCloud) -> Result<u64, LocError> {
        if map.is_empty() {
            warn!("received an empty map; installing a degenerate target");
        }

        let started = Instant::now();
        let target = self.engine.build_target(map, &self.params).map_err(|e| {
            error!(error = %e, points = map.len(), "failed to build registration target; keeping previous map");
            LocError::MapBuild(e.to_string())
        })?;
        let build_ms = started.elapsed().as_secs_f64() * 1000.0;

        let replaced = self.store.swap(target).is_some();
        let generation = self.store.generation();

        self.health.modify(|s| {
            if s.state == LocalizerState::Idle {
                s.state = LocalizerState::Initializing;
            }
        });

        info!(points = map.len(), build_ms, generation, replaced, "map loaded");
        Ok(generation)
    }
}
