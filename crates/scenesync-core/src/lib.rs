//! Scenesync Core -- reconciles scene-produced deltas into a shared host world.
//!
//! Every scene runs on its own thread and owns a [`bridge::SceneBridge`].
//! Once per tick it hands the bridge a batch of encoded delta messages and
//! receives the host's own changes in return.
//!
//! # Submit Pipeline
//!
//! Each call to [`bridge::SceneBridge::submit`] runs these phases:
//!
//! 1. **Decode** -- Frames are decoded into a message list rented from the
//!    scene-local pool. Payloads are copied into pooled buffers.
//! 2. **Reconcile** -- The replicated-state protocol compares each message
//!    with the baseline (last-write-wins per entity and component) and
//!    classifies its effect.
//! 3. **Stage** -- Effects are merged per key in a staging buffer, then
//!    surviving additions and modifications are deserialized.
//! 4. **Apply** -- Under the world guard the outgoing queue is drained and
//!    encoded, and the staged batch is applied to the world in one pass.
//!
//! # Key Types
//!
//! - [`bridge::SceneBridge`] -- Per-scene entry point.
//! - [`protocol::ReplicatedState`] -- Baseline store and reconciliation rules.
//! - [`staging::SyncStagingBuffer`] -- Per-batch change buffer with a strict
//!   open / finalized / applied lifecycle.
//! - [`outgoing::OutgoingDeltaCollector`] -- Thread-safe queue of host changes.
//! - [`sync::WorldSync`] -- The single lock around the shared world.
//! - [`pool::PoolRegistry`] -- Every shared pool, passed explicitly.
//! - [`registry::ComponentRegistry`] -- Immutable component registry.
//! - [`message`] -- Wire framing for delta batches.

pub mod bridge;
pub mod component;
pub mod config;
pub mod error;
pub mod id;
pub mod message;
pub mod outgoing;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod staging;
pub mod sync;
pub mod world;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bridge::{BridgeStats, HostWriter, SceneBridge};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use id::{ComponentKey, EntityHandle, EntityKey, SceneId};
