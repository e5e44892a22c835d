//! Object pools that lend and reclaim buffers so batch processing performs
//! no per-message heap allocation.
//!
//! Two flavours exist:
//!
//! - [`SharedPool`]: lock-protected, cloneable handle shared across scene
//!   threads. Rentals are wrapped in a [`Pooled`] guard that returns the value
//!   on drop, so a value is reclaimed exactly once and never issued twice.
//! - [`LocalPool`]: unsynchronised pool owned by a single scene's call context
//!   and passed down the call stack by `&mut`.
//!
//! [`PoolRegistry`] bundles every shared pool the pipeline needs into one
//! explicit value handed to each bridge at construction time.

use crate::component::{ComponentKind, ComponentValue};
use crate::config::PoolConfig;
use crate::message::DeltaMessage;
use crate::staging::{BatchMap, ComponentBatch};
use crate::id::EntityKey;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Errors and stats
// ---------------------------------------------------------------------------

/// Errors that can occur while renting from a pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool '{pool}' exhausted: {outstanding} rentals outstanding, ceiling is {ceiling}")]
    Exhausted {
        pool: &'static str,
        outstanding: u64,
        ceiling: usize,
    },
}

/// Usage counters for a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Values built by the factory because the free list was empty.
    pub created: u64,
    /// Total rentals.
    pub rented: u64,
    /// Total values handed back.
    pub returned: u64,
    /// Values currently sitting in the free list.
    pub idle: usize,
}

impl PoolStats {
    /// Rentals not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.rented - self.returned
    }
}

// ---------------------------------------------------------------------------
// SharedPool
// ---------------------------------------------------------------------------

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct PoolState<T> {
    free: Vec<T>,
    stats: PoolStats,
}

struct PoolInner<T> {
    name: &'static str,
    state: Mutex<PoolState<T>>,
    factory: Factory<T>,
    reset: fn(&mut T),
    retain: usize,
    ceiling: Option<usize>,
}

/// A thread-safe pool. Cloning the handle shares the same free list.
pub struct SharedPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for SharedPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for SharedPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPool")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Send + 'static> SharedPool<T> {
    /// Create a pool that keeps at most `retain` idle values and has no
    /// ceiling on outstanding rentals.
    pub fn new<F>(name: &'static str, retain: usize, factory: F, reset: fn(&mut T)) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_ceiling(name, retain, None, factory, reset)
    }

    /// Create a pool that refuses to lend more than `ceiling` values at once.
    pub fn with_ceiling<F>(
        name: &'static str,
        retain: usize,
        ceiling: Option<usize>,
        factory: F,
        reset: fn(&mut T),
    ) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                name,
                state: Mutex::new(PoolState {
                    free: Vec::with_capacity(retain),
                    stats: PoolStats::default(),
                }),
                factory: Box::new(factory),
                reset,
                retain,
                ceiling,
            }),
        }
    }

    /// Rent a value, building a new one if the free list is empty.
    pub fn rent(&self) -> Result<Pooled<T>, PoolError> {
        let recycled = {
            let mut state = self.inner.state.lock();
            if let Some(ceiling) = self.inner.ceiling {
                let outstanding = state.stats.outstanding();
                if outstanding >= ceiling as u64 {
                    return Err(PoolError::Exhausted {
                        pool: self.inner.name,
                        outstanding,
                        ceiling,
                    });
                }
            }
            state.stats.rented += 1;
            let recycled = state.free.pop();
            if recycled.is_none() {
                state.stats.created += 1;
            }
            state.stats.idle = state.free.len();
            recycled
        };

        // The factory runs outside the lock.
        let value = recycled.unwrap_or_else(|| (self.inner.factory)());
        Ok(Pooled {
            value: Some(value),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Pre-populate the free list up to the retain limit.
    pub fn warmup(&self, count: usize) {
        let mut state = self.inner.state.lock();
        let target = count.min(self.inner.retain);
        while state.free.len() < target {
            state.free.push((self.inner.factory)());
        }
        state.stats.idle = state.free.len();
    }
}

impl<T> SharedPool<T> {
    pub fn stats(&self) -> PoolStats {
        self.inner.state.lock().stats
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

impl<T> PoolInner<T> {
    fn give_back(&self, mut value: T) {
        (self.reset)(&mut value);
        let mut state = self.state.lock();
        state.stats.returned += 1;
        if state.free.len() < self.retain {
            state.free.push(value);
        }
        state.stats.idle = state.free.len();
    }
}

/// A value on loan from a [`SharedPool`]. Returned to the pool when dropped.
pub struct Pooled<T> {
    value: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Pooled<T> {
    /// Name of the pool this value belongs to.
    pub fn pool_name(&self) -> &'static str {
        self.pool.name
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `Drop` takes the value out.
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.give_back(value);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pooled").field(&**self).finish()
    }
}

// ---------------------------------------------------------------------------
// BytePool
// ---------------------------------------------------------------------------

/// A shared pool of byte buffers.
pub type BytePool = SharedPool<Vec<u8>>;

fn clear_bytes(buffer: &mut Vec<u8>) {
    buffer.clear();
}

/// Create a byte pool.
pub fn byte_pool(name: &'static str, retain: usize, ceiling: Option<usize>) -> BytePool {
    SharedPool::with_ceiling(name, retain, ceiling, Vec::new, clear_bytes)
}

impl SharedPool<Vec<u8>> {
    /// Rent a buffer holding exactly `len` zeroed bytes.
    pub fn rent_exact(&self, len: usize) -> Result<Pooled<Vec<u8>>, PoolError> {
        let mut buffer = self.rent()?;
        buffer.resize(len, 0);
        Ok(buffer)
    }

    /// Rent a buffer holding a copy of `bytes`.
    pub fn rent_copy(&self, bytes: &[u8]) -> Result<Pooled<Vec<u8>>, PoolError> {
        let mut buffer = self.rent()?;
        buffer.extend_from_slice(bytes);
        Ok(buffer)
    }
}

// ---------------------------------------------------------------------------
// LocalPool
// ---------------------------------------------------------------------------

/// A pool owned by one call context. No locking; the owner passes it down
/// by `&mut`, which keeps it on the producing thread.
pub struct LocalPool<T> {
    name: &'static str,
    free: Vec<T>,
    factory: fn() -> T,
    reset: fn(&mut T),
    retain: usize,
    stats: PoolStats,
}

impl<T> std::fmt::Debug for LocalPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPool")
            .field("name", &self.name)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<T> LocalPool<T> {
    pub fn new(name: &'static str, retain: usize, factory: fn() -> T, reset: fn(&mut T)) -> Self {
        Self {
            name,
            free: Vec::with_capacity(retain),
            factory,
            reset,
            retain,
            stats: PoolStats::default(),
        }
    }

    /// Take a value out of the pool. Must be handed back with [`give_back`](Self::give_back).
    pub fn rent(&mut self) -> T {
        self.stats.rented += 1;
        let value = match self.free.pop() {
            Some(value) => value,
            None => {
                self.stats.created += 1;
                (self.factory)()
            }
        };
        self.stats.idle = self.free.len();
        value
    }

    pub fn give_back(&mut self, mut value: T) {
        (self.reset)(&mut value);
        self.stats.returned += 1;
        if self.free.len() < self.retain {
            self.free.push(value);
        }
        self.stats.idle = self.free.len();
    }

    /// Rent a value for the duration of `f` and hand it back afterwards.
    pub fn scoped<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut value = self.rent();
        let result = f(&mut value);
        self.give_back(value);
        result
    }

    /// Drop every idle value. Called on scene teardown.
    pub fn release_all(&mut self) {
        self.free.clear();
        self.free.shrink_to_fit();
        self.stats.idle = 0;
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ---------------------------------------------------------------------------
// Scene-local pools
// ---------------------------------------------------------------------------

fn clear_messages(list: &mut Vec<DeltaMessage>) {
    // Dropping the messages returns their payloads to the shared pool.
    list.clear();
}

/// Pools owned by one scene thread.
#[derive(Debug)]
pub struct SceneLocalPools {
    pub message_lists: LocalPool<Vec<DeltaMessage>>,
}

impl SceneLocalPools {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            message_lists: LocalPool::new(
                "scene.message_lists",
                config.retain_per_pool,
                Vec::new,
                clear_messages,
            ),
        }
    }

    pub fn release_all(&mut self) {
        self.message_lists.release_all();
    }
}

// ---------------------------------------------------------------------------
// Component instance pools
// ---------------------------------------------------------------------------

/// One shared pool per component kind.
#[derive(Debug, Clone)]
pub struct ComponentPools {
    pools: Vec<SharedPool<ComponentValue>>,
}

impl ComponentPools {
    pub fn new(retain: usize) -> Self {
        let pools = ComponentKind::ALL
            .iter()
            .map(|&kind| {
                SharedPool::new(
                    kind.pool_name(),
                    retain,
                    move || kind.default_value(),
                    ComponentValue::reset,
                )
            })
            .collect();
        Self { pools }
    }

    pub fn pool(&self, kind: ComponentKind) -> &SharedPool<ComponentValue> {
        &self.pools[kind.index()]
    }

    pub fn stats(&self, kind: ComponentKind) -> PoolStats {
        self.pool(kind).stats()
    }
}

// ---------------------------------------------------------------------------
// PoolRegistry
// ---------------------------------------------------------------------------

fn clear_batch_map(map: &mut BatchMap) {
    map.clear();
}

fn clear_component_batch(batch: &mut ComponentBatch) {
    batch.clear();
}

fn clear_entity_list(list: &mut Vec<EntityKey>) {
    list.clear();
}

/// Every shared pool used by the pipeline. Cheap to clone; clones share
/// the same pools. Construct one per process (or per test).
#[derive(Debug, Clone)]
pub struct PoolRegistry {
    /// Message payload copies, retained by the baseline store.
    pub payloads: BytePool,
    /// Serialized outbound batches and snapshots.
    pub outbound: BytePool,
    /// Message arrays used to build snapshots.
    pub snapshots: SharedPool<Vec<DeltaMessage>>,
    /// Staging buffer top-level maps.
    pub batch_maps: SharedPool<BatchMap>,
    /// Staging buffer per-entity maps.
    pub component_batches: SharedPool<ComponentBatch>,
    /// Staging buffer deleted-entity lists.
    pub entity_lists: SharedPool<Vec<EntityKey>>,
    /// Deserialized component instances, one pool per kind.
    pub components: ComponentPools,
}

impl PoolRegistry {
    pub fn new(config: &PoolConfig) -> Self {
        let retain = config.retain_per_pool;
        Self {
            payloads: byte_pool("payloads", config.payload_retain, config.payload_ceiling),
            outbound: byte_pool("outbound", retain, config.outbound_ceiling),
            snapshots: SharedPool::new("snapshots", retain, Vec::new, clear_messages),
            batch_maps: SharedPool::new("staging.batch_maps", retain, BatchMap::new, clear_batch_map),
            component_batches: SharedPool::new(
                "staging.component_batches",
                config.payload_retain,
                ComponentBatch::new,
                clear_component_batch,
            ),
            entity_lists: SharedPool::new("staging.entity_lists", retain, Vec::new, clear_entity_list),
            components: ComponentPools::new(config.payload_retain),
        }
    }

    /// Total rentals outstanding across all shared pools.
    pub fn outstanding(&self) -> u64 {
        let fixed = [
            self.payloads.stats(),
            self.outbound.stats(),
            self.snapshots.stats(),
            self.batch_maps.stats(),
            self.component_batches.stats(),
            self.entity_lists.stats(),
        ];
        let components: u64 = ComponentKind::ALL
            .iter()
            .map(|&kind| self.components.stats(kind).outstanding())
            .sum();
        fixed.iter().map(PoolStats::outstanding).sum::<u64>() + components
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
