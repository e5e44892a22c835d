//! The one critical section shared by every scene: exclusive access to the
//! host world, acquired with a timeout.

use crate::config::SyncConfig;
use crate::id::SceneId;
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("scene {owner:?} timed out after {waited:?} waiting for the world")]
    Timeout { owner: SceneId, waited: Duration },
}

/// Acquisition counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub acquisitions: u64,
    pub timeouts: u64,
    pub longest_wait: Duration,
}

/// Guards a world shared by several scene threads. Share it with `Arc`.
#[derive(Debug)]
pub struct WorldSync<W> {
    world: Mutex<W>,
    timeout: Duration,
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
    longest_wait_nanos: AtomicU64,
}

impl<W> WorldSync<W> {
    pub fn new(world: W, config: &SyncConfig) -> Self {
        Self::with_timeout(world, config.acquire_timeout())
    }

    pub fn with_timeout(world: W, timeout: Duration) -> Self {
        Self {
            world: Mutex::new(world),
            timeout,
            acquisitions: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            longest_wait_nanos: AtomicU64::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Lock the world for `owner`, waiting at most the configured timeout.
    /// The world is released when the returned scope drops.
    pub fn scope(&self, owner: SceneId) -> Result<WorldScope<'_, W>, SyncError> {
        let started = Instant::now();
        let Some(guard) = self.world.try_lock_for(self.timeout) else {
            let waited = started.elapsed();
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(scene = owner.0, ?waited, "world lock not acquired");
            return Err(SyncError::Timeout { owner, waited });
        };

        let waited = started.elapsed();
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
        self.longest_wait_nanos.fetch_max(nanos, Ordering::Relaxed);
        trace!(scene = owner.0, ?waited, "world lock acquired");

        Ok(WorldScope { guard, owner })
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            longest_wait: Duration::from_nanos(self.longest_wait_nanos.load(Ordering::Relaxed)),
        }
    }

    /// Direct access when no other reference exists.
    pub fn get_mut(&mut self) -> &mut W {
        self.world.get_mut()
    }

    pub fn into_inner(self) -> W {
        self.world.into_inner()
    }
}

/// Exclusive access to the world for one scene.
#[derive(Debug)]
pub struct WorldScope<'a, W> {
    guard: MutexGuard<'a, W>,
    owner: SceneId,
}

impl<W> WorldScope<'_, W> {
    pub fn owner(&self) -> SceneId {
        self.owner
    }
}

impl<W> Deref for WorldScope<'_, W> {
    type Target = W;

    fn deref(&self) -> &W {
        &self.guard
    }
}

impl<W> DerefMut for WorldScope<'_, W> {
    fn deref_mut(&mut self) -> &mut W {
        &mut self.guard
    }
}
