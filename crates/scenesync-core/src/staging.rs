//! Sync staging buffer: merges one batch of reconciled messages down to a
//! single final change per (entity, component), deserializes each surviving
//! change once, and applies the lot to the world in one step.
//!
//! Lifecycle: `Open -> Finalized -> Applied -> Disposed`. A buffer is used
//! for exactly one batch.

use crate::component::{ComponentInstance, ComponentKind};
use crate::id::{reserved, ComponentKey, EntityKey};
use crate::message::{DeltaMessage, Payload};
use crate::pool::{PoolError, PoolRegistry, Pooled};
use crate::protocol::ReconciliationEffect;
use crate::registry::ComponentRegistry;
use crate::world::{EntityMap, World};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Pending records for one entity.
pub type ComponentBatch = HashMap<ComponentKey, BatchState>;
/// Pending records for a whole batch.
pub type BatchMap = HashMap<EntityKey, Pooled<ComponentBatch>>;

/// Per-key record: the first and last effect seen in this batch, the
/// latest payload, and after finalization the deserialized instance.
#[derive(Debug)]
pub struct BatchState {
    first: ReconciliationEffect,
    last: ReconciliationEffect,
    kind: ComponentKind,
    payload: Payload,
    instance: Option<ComponentInstance>,
}

impl BatchState {
    pub fn first(&self) -> ReconciliationEffect {
        self.first
    }

    pub fn last(&self) -> ReconciliationEffect {
        self.last
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_deserialized(&self) -> bool {
        self.instance.is_some()
    }
}

/// Resolve the change a key undergoes across a batch from the first and
/// last effect recorded for it.
pub fn merge_effects(first: ReconciliationEffect, last: ReconciliationEffect) -> ReconciliationEffect {
    use ReconciliationEffect::*;
    match (first, last) {
        (ComponentAdded, ComponentAdded | ComponentModified) => ComponentAdded,
        (ComponentAdded, ComponentDeleted) => NoChanges,
        (ComponentModified | ComponentDeleted, ComponentAdded | ComponentModified) => ComponentModified,
        (ComponentModified | ComponentDeleted, ComponentDeleted) => ComponentDeleted,
        _ => NoChanges,
    }
}

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Open,
    Finalized,
    Applied,
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StagingError {
    #[error("cannot {operation} a staging buffer that is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: BufferState,
    },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Counts from `finalize_and_deserialize`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    /// Keys whose payload failed to deserialize and were dropped.
    pub failed: usize,
}

/// Counts from `apply`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub entities_created: usize,
    pub entities_removed: usize,
    pub components_attached: usize,
    pub components_detached: usize,
    /// Records skipped because they target host-reserved entities.
    pub reserved_skipped: usize,
}

// ---------------------------------------------------------------------------
// SyncStagingBuffer
// ---------------------------------------------------------------------------

/// Single-use buffer between reconciliation and the world.
///
/// Collections are rented from the [`PoolRegistry`] on construction and
/// returned by `apply`, `dispose` or drop, whichever comes first.
pub struct SyncStagingBuffer {
    registry: Arc<ComponentRegistry>,
    pools: PoolRegistry,
    batches: Option<Pooled<BatchMap>>,
    deleted_entities: Option<Pooled<Vec<EntityKey>>>,
    state: BufferState,
}

impl std::fmt::Debug for SyncStagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStagingBuffer")
            .field("state", &self.state)
            .field("entities", &self.batches.as_ref().map_or(0, |b| b.len()))
            .field(
                "deleted_entities",
                &self.deleted_entities.as_ref().map_or(0, |d| d.len()),
            )
            .finish()
    }
}

impl SyncStagingBuffer {
    pub fn new(registry: Arc<ComponentRegistry>, pools: &PoolRegistry) -> Result<Self, PoolError> {
        Ok(Self {
            registry,
            batches: Some(pools.batch_maps.rent()?),
            deleted_entities: Some(pools.entity_lists.rent()?),
            pools: pools.clone(),
            state: BufferState::Open,
        })
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    fn invalid(&self, operation: &'static str) -> StagingError {
        StagingError::InvalidState {
            operation,
            state: self.state,
        }
    }

    fn expect_state(&self, expected: BufferState, operation: &'static str) -> Result<(), StagingError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    /// Record `message` with the effect the protocol assigned to it and
    /// return that effect. Records for unregistered components are dropped.
    pub fn sync(
        &mut self,
        message: DeltaMessage,
        effect: ReconciliationEffect,
    ) -> Result<ReconciliationEffect, StagingError> {
        self.expect_state(BufferState::Open, "sync")?;
        let state = self.state;
        let (Some(batches), Some(deleted)) = (self.batches.as_mut(), self.deleted_entities.as_mut())
        else {
            return Err(StagingError::InvalidState {
                operation: "sync",
                state,
            });
        };

        match effect {
            ReconciliationEffect::EntityDeleted => {
                // Deleted keys cannot come back in this batch. Older
                // versions of the number go with it.
                let deletion = message.entity;
                deleted.push(deletion);
                batches.retain(|entity, _| !entity.is_deleted_by(deletion));
                Ok(ReconciliationEffect::EntityDeleted)
            }
            ReconciliationEffect::NoChanges => Ok(ReconciliationEffect::NoChanges),
            ReconciliationEffect::ComponentAdded
            | ReconciliationEffect::ComponentModified
            | ReconciliationEffect::ComponentDeleted => {
                let Some(bridge) = self.registry.get(message.component) else {
                    return Ok(ReconciliationEffect::NoChanges);
                };

                let batch = match batches.entry(message.entity) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => entry.insert(self.pools.component_batches.rent()?),
                };

                match batch.get_mut(&message.component) {
                    Some(record) => {
                        record.last = effect;
                        record.payload = message.payload;
                    }
                    None => {
                        batch.insert(
                            message.component,
                            BatchState {
                                first: effect,
                                last: effect,
                                kind: bridge.kind,
                                payload: message.payload,
                                instance: None,
                            },
                        );
                    }
                }
                Ok(effect)
            }
        }
    }

    /// Resolve every record to its final effect and deserialize the
    /// surviving additions and modifications. Payloads are released.
    pub fn finalize_and_deserialize(&mut self) -> Result<FinalizeReport, StagingError> {
        self.expect_state(BufferState::Open, "finalize")?;
        let state = self.state;
        let Some(batches) = self.batches.as_mut() else {
            return Err(StagingError::InvalidState {
                operation: "finalize",
                state,
            });
        };

        let mut report = FinalizeReport::default();
        for (&entity, batch) in batches.iter_mut() {
            for (&component, record) in batch.iter_mut() {
                let resolved = merge_effects(record.first, record.last);
                record.first = resolved;
                record.last = resolved;

                match resolved {
                    ReconciliationEffect::ComponentAdded | ReconciliationEffect::ComponentModified => {
                        let mut value = self.pools.components.pool(record.kind).rent()?;
                        match (record.kind.codec().decode_into)(&mut value, record.payload.as_slice()) {
                            Ok(()) => {
                                record.instance = Some(ComponentInstance {
                                    key: component,
                                    value,
                                });
                                if resolved == ReconciliationEffect::ComponentAdded {
                                    report.added += 1;
                                } else {
                                    report.modified += 1;
                                }
                            }
                            Err(error) => {
                                warn!(%entity, %component, %error, "dropping change that failed to deserialize");
                                record.first = ReconciliationEffect::NoChanges;
                                record.last = ReconciliationEffect::NoChanges;
                                report.failed += 1;
                            }
                        }
                    }
                    ReconciliationEffect::ComponentDeleted => report.deleted += 1,
                    _ => {}
                }
                record.payload.release();
            }
            batch.retain(|_, record| record.last != ReconciliationEffect::NoChanges);
        }
        batches.retain(|_, batch| !batch.is_empty());

        self.state = BufferState::Finalized;
        debug!(
            added = report.added,
            modified = report.modified,
            deleted = report.deleted,
            failed = report.failed,
            "staging buffer finalized"
        );
        Ok(report)
    }

    /// Apply the finalized batch to `world`. Entity deletions are tagged
    /// first; then entities are created on first sight and components
    /// attached, replaced or detached. Collections go back to their pools.
    pub fn apply<W: World + ?Sized>(
        &mut self,
        world: &mut W,
        entities: &mut EntityMap,
    ) -> Result<ApplyReport, StagingError> {
        self.expect_state(BufferState::Finalized, "apply")?;
        let state = self.state;
        let (Some(batches), Some(deleted)) = (self.batches.as_mut(), self.deleted_entities.as_mut())
        else {
            return Err(StagingError::InvalidState {
                operation: "apply",
                state,
            });
        };

        let mut report = ApplyReport::default();
        for deletion in deleted.drain(..) {
            report.entities_removed +=
                entities.remove_deleted_by(deletion, |handle| world.mark_for_removal(handle));
        }

        for (entity, mut batch) in batches.drain() {
            if reserved::is_reserved(entity.number()) {
                trace!(%entity, records = batch.len(), "skipping reserved entity");
                report.reserved_skipped += batch.len();
                continue;
            }

            let handle = match entities.get(entity) {
                Some(handle) => handle,
                None => {
                    let creates = batch.values().any(|record| {
                        matches!(
                            record.last,
                            ReconciliationEffect::ComponentAdded | ReconciliationEffect::ComponentModified
                        )
                    });
                    if !creates {
                        continue;
                    }
                    let handle = world.create_entity(entity);
                    entities.insert(entity, handle);
                    report.entities_created += 1;
                    handle
                }
            };

            for (component, mut record) in batch.drain() {
                match record.last {
                    ReconciliationEffect::ComponentAdded | ReconciliationEffect::ComponentModified => {
                        if let Some(instance) = record.instance.take() {
                            // The replaced instance goes back to its pool here.
                            drop(world.attach_component(handle, instance));
                            report.components_attached += 1;
                        }
                    }
                    ReconciliationEffect::ComponentDeleted => {
                        if world.detach_component(handle, component).is_some() {
                            report.components_detached += 1;
                        }
                    }
                    _ => {}
                }
            }
        }

        self.state = BufferState::Applied;
        self.release_collections();
        debug!(
            created = report.entities_created,
            removed = report.entities_removed,
            attached = report.components_attached,
            detached = report.components_detached,
            "staging buffer applied"
        );
        Ok(report)
    }

    /// Return every pooled collection and instance. Idempotent.
    pub fn dispose(&mut self) {
        if self.state == BufferState::Disposed {
            return;
        }
        self.release_collections();
        self.state = BufferState::Disposed;
    }

    fn release_collections(&mut self) {
        // Dropping the guards returns maps, lists, payloads and instances.
        self.batches = None;
        self.deleted_entities = None;
    }

    /// Latest effect recorded for a key; the final effect once finalized.
    pub fn final_effect(&self, entity: EntityKey, component: ComponentKey) -> ReconciliationEffect {
        self.batches
            .as_ref()
            .and_then(|batches| batches.get(&entity))
            .and_then(|batch| batch.get(&component))
            .map_or(ReconciliationEffect::NoChanges, |record| record.last)
    }

    pub fn record(&self, entity: EntityKey, component: ComponentKey) -> Option<&BatchState> {
        self.batches.as_ref()?.get(&entity)?.get(&component)
    }

    /// Entities queued for removal.
    pub fn deleted_entities(&self) -> &[EntityKey] {
        self.deleted_entities.as_deref().map_or(&[][..], Vec::as_slice)
    }

    /// Pending (entity, component) records.
    pub fn record_count(&self) -> usize {
        self.batches
            .as_ref()
            .map_or(0, |batches| batches.values().map(|batch| batch.len()).sum())
    }
}

impl Drop for SyncStagingBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
