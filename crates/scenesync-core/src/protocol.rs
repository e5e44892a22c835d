//! Replicated state protocol: last-write-wins reconciliation of scene deltas
//! against the per-scene baseline store.
//!
//! The baseline keeps, for every (entity, component) key, the latest
//! timestamp and either a payload or a tombstone. Entity numbers deleted by
//! the scene are remembered with their version so stale messages for a
//! recycled number are rejected. Append components keep a bounded,
//! ordered, duplicate-free list instead of a single value.
//!
//! Equal timestamps are resolved by payload: the longer payload wins, equal
//! lengths compare bytewise and the larger wins. A tombstone is an empty
//! payload.

use crate::config::ProtocolConfig;
use crate::id::{ComponentKey, EntityKey};
use crate::message::{encoded_len, DeltaMessage, MessageKind, Payload};
use crate::pool::{BytePool, PoolError, PoolRegistry, Pooled};
use crate::registry::ComponentRegistry;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What a reconciled message means for the host world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconciliationEffect {
    NoChanges,
    ComponentAdded,
    ComponentModified,
    ComponentDeleted,
    EntityDeleted,
}

/// How the baseline store reacted to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconciliationOutcome {
    /// The entity number was deleted at this version or later.
    EntityWasDeleted,
    EntityDeleted,
    StateAppendedData,
    /// Newer timestamp replaced the stored value.
    StateUpdatedTimestamp,
    /// Equal timestamp, incoming payload won the tie-break.
    StateUpdatedData,
    StateOutdatedTimestamp,
    /// Equal timestamp, stored payload won the tie-break.
    StateOutdatedData,
    NoChanges,
    UnknownComponent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub outcome: ReconciliationOutcome,
    pub effect: ReconciliationEffect,
}

impl Reconciliation {
    fn new(outcome: ReconciliationOutcome, effect: ReconciliationEffect) -> Self {
        Self { outcome, effect }
    }

    fn unchanged(outcome: ReconciliationOutcome) -> Self {
        Self::new(outcome, ReconciliationEffect::NoChanges)
    }
}

/// Counters per reconciliation outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolStats {
    pub processed: u64,
    pub updated: u64,
    pub appended: u64,
    pub outdated: u64,
    pub unchanged: u64,
    pub entities_deleted: u64,
    pub rejected_deleted_entity: u64,
    pub unknown_components: u64,
}

impl ProtocolStats {
    fn record(&mut self, outcome: ReconciliationOutcome) {
        self.processed += 1;
        match outcome {
            ReconciliationOutcome::StateUpdatedTimestamp | ReconciliationOutcome::StateUpdatedData => {
                self.updated += 1
            }
            ReconciliationOutcome::StateAppendedData => self.appended += 1,
            ReconciliationOutcome::StateOutdatedTimestamp | ReconciliationOutcome::StateOutdatedData => {
                self.outdated += 1
            }
            ReconciliationOutcome::NoChanges => self.unchanged += 1,
            ReconciliationOutcome::EntityDeleted => self.entities_deleted += 1,
            ReconciliationOutcome::EntityWasDeleted => self.rejected_deleted_entity += 1,
            ReconciliationOutcome::UnknownComponent => self.unknown_components += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Baseline store
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BaselineEntry {
    timestamp: u32,
    payload: Payload,
    deleted: bool,
}

#[derive(Debug)]
struct AppendEntry {
    timestamp: u32,
    payload: Payload,
}

/// Read-only view of one baseline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaselineView<'a> {
    pub timestamp: u32,
    /// `None` for a tombstone.
    pub payload: Option<&'a [u8]>,
}

/// Tie-break order for equal timestamps: length first, then bytes.
pub fn compare_data(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Per-scene baseline store and reconciliation rules.
#[derive(Debug)]
pub struct ReplicatedState {
    registry: Arc<ComponentRegistry>,
    config: ProtocolConfig,
    payloads: BytePool,
    /// Entity number -> highest deleted version.
    deleted_entities: HashMap<u16, u16>,
    lww: HashMap<ComponentKey, HashMap<EntityKey, BaselineEntry>>,
    appends: HashMap<ComponentKey, HashMap<EntityKey, Vec<AppendEntry>>>,
    /// Messages a snapshot of the current state consists of.
    message_count: usize,
    stats: ProtocolStats,
}

impl ReplicatedState {
    pub fn new(registry: Arc<ComponentRegistry>, config: ProtocolConfig, payloads: BytePool) -> Self {
        Self {
            registry,
            config,
            payloads,
            deleted_entities: HashMap::new(),
            lww: HashMap::new(),
            appends: HashMap::new(),
            message_count: 0,
            stats: ProtocolStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Reconcile `message` against the baseline and return only its effect.
    pub fn process(&mut self, message: &DeltaMessage) -> Result<ReconciliationEffect, PoolError> {
        Ok(self.reconcile(message)?.effect)
    }

    /// Reconcile `message` against the baseline.
    ///
    /// Payloads that win are copied into the store; the message keeps its own.
    /// Only pool exhaustion is an error.
    pub fn reconcile(&mut self, message: &DeltaMessage) -> Result<Reconciliation, PoolError> {
        let result = self.reconcile_message(message)?;
        self.stats.record(result.outcome);
        trace!(
            entity = %message.entity,
            component = %message.component,
            kind = ?message.kind,
            timestamp = message.timestamp,
            outcome = ?result.outcome,
            effect = ?result.effect,
            "reconciled"
        );
        Ok(result)
    }

    fn reconcile_message(&mut self, message: &DeltaMessage) -> Result<Reconciliation, PoolError> {
        if message.kind == MessageKind::None {
            return Ok(Reconciliation::unchanged(ReconciliationOutcome::NoChanges));
        }
        if self.was_deleted(message.entity) {
            return Ok(Reconciliation::unchanged(ReconciliationOutcome::EntityWasDeleted));
        }

        match message.kind {
            MessageKind::DeleteEntity => {
                self.delete_entity(message.entity);
                Ok(Reconciliation::new(
                    ReconciliationOutcome::EntityDeleted,
                    ReconciliationEffect::EntityDeleted,
                ))
            }
            _ if !self.registry.contains(message.component) => {
                warn!(
                    entity = %message.entity,
                    component = %message.component,
                    "message for unregistered component ignored"
                );
                Ok(Reconciliation::unchanged(ReconciliationOutcome::UnknownComponent))
            }
            MessageKind::Append => {
                let appended = self.try_append(
                    message.entity,
                    message.component,
                    message.timestamp,
                    message.payload.as_slice(),
                )?;
                Ok(if appended {
                    Reconciliation::new(
                        ReconciliationOutcome::StateAppendedData,
                        ReconciliationEffect::ComponentAdded,
                    )
                } else {
                    Reconciliation::unchanged(ReconciliationOutcome::NoChanges)
                })
            }
            MessageKind::Put => self.update_lww(
                message.entity,
                message.component,
                message.timestamp,
                Some(message.payload.as_slice()),
            ),
            MessageKind::Delete => {
                self.update_lww(message.entity, message.component, message.timestamp, None)
            }
            MessageKind::None => Ok(Reconciliation::unchanged(ReconciliationOutcome::NoChanges)),
        }
    }

    fn was_deleted(&self, entity: EntityKey) -> bool {
        self.deleted_entities
            .get(&entity.number())
            .is_some_and(|&version| version >= entity.version())
    }

    /// `incoming` is `None` for a delete.
    fn update_lww(
        &mut self,
        entity: EntityKey,
        component: ComponentKey,
        timestamp: u32,
        incoming: Option<&[u8]>,
    ) -> Result<Reconciliation, PoolError> {
        let inner = self.lww.entry(component).or_default();

        let Some(stored) = inner.get_mut(&entity) else {
            let payload = match incoming {
                Some(bytes) => Payload::copy_from(&self.payloads, bytes)?,
                None => Payload::empty(),
            };
            inner.insert(
                entity,
                BaselineEntry {
                    timestamp,
                    payload,
                    deleted: incoming.is_none(),
                },
            );
            self.message_count += 1;
            let effect = if incoming.is_some() {
                ReconciliationEffect::ComponentAdded
            } else {
                ReconciliationEffect::NoChanges
            };
            return Ok(Reconciliation::new(ReconciliationOutcome::StateUpdatedTimestamp, effect));
        };

        let outcome = match stored.timestamp.cmp(&timestamp) {
            Ordering::Greater => {
                return Ok(Reconciliation::unchanged(ReconciliationOutcome::StateOutdatedTimestamp));
            }
            Ordering::Less => ReconciliationOutcome::StateUpdatedTimestamp,
            Ordering::Equal => {
                match compare_data(stored.payload.as_slice(), incoming.unwrap_or_default()) {
                    Ordering::Equal => {
                        return Ok(Reconciliation::unchanged(ReconciliationOutcome::NoChanges));
                    }
                    Ordering::Greater => {
                        return Ok(Reconciliation::unchanged(ReconciliationOutcome::StateOutdatedData));
                    }
                    Ordering::Less => ReconciliationOutcome::StateUpdatedData,
                }
            }
        };

        let was_live = !stored.deleted;
        match incoming {
            Some(bytes) => {
                stored.payload.assign(&self.payloads, bytes)?;
                stored.deleted = false;
            }
            None => {
                stored.payload.release();
                stored.deleted = true;
            }
        }
        stored.timestamp = timestamp;

        let effect = match (was_live, incoming.is_some()) {
            (true, true) => ReconciliationEffect::ComponentModified,
            (false, true) => ReconciliationEffect::ComponentAdded,
            (true, false) => ReconciliationEffect::ComponentDeleted,
            (false, false) => ReconciliationEffect::NoChanges,
        };
        Ok(Reconciliation::new(outcome, effect))
    }

    fn delete_entity(&mut self, entity: EntityKey) {
        if self.deleted_entities.insert(entity.number(), entity.version()).is_none() {
            self.message_count += 1;
        }

        let doomed = |key: &EntityKey| key.is_deleted_by(entity);
        let mut removed = 0;
        for inner in self.lww.values_mut() {
            inner.retain(|key, _| {
                let keep = !doomed(key);
                removed += usize::from(!keep);
                keep
            });
        }
        for inner in self.appends.values_mut() {
            inner.retain(|key, list| {
                let keep = !doomed(key);
                if !keep {
                    removed += list.len();
                }
                keep
            });
        }
        self.message_count -= removed;
    }

    /// Returns `false` when the exact (timestamp, payload) is already stored.
    fn try_append(
        &mut self,
        entity: EntityKey,
        component: ComponentKey,
        timestamp: u32,
        bytes: &[u8],
    ) -> Result<bool, PoolError> {
        let limit = self.config.max_append_components;
        let list = self.appends.entry(component).or_default().entry(entity).or_default();

        let search = list.binary_search_by(|entry| {
            entry
                .timestamp
                .cmp(&timestamp)
                .then_with(|| compare_data(entry.payload.as_slice(), bytes))
        });
        let mut index = match search {
            Ok(_) => return Ok(false),
            Err(index) => index,
        };

        let payload = Payload::copy_from(&self.payloads, bytes)?;
        if list.len() >= limit {
            self.message_count -= list.len();
            list.clear();
            index = 0;
        }
        list.insert(index, AppendEntry { timestamp, payload });
        self.message_count += 1;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Host-originated messages
    // -----------------------------------------------------------------------

    /// Timestamp a host message of `kind` for this key would carry:
    /// one past the stored value, or 0 for a key never seen.
    pub fn next_timestamp(&self, kind: MessageKind, entity: EntityKey, component: ComponentKey) -> u32 {
        let stored = match kind {
            MessageKind::Append => self
                .appends
                .get(&component)
                .and_then(|inner| inner.get(&entity))
                .and_then(|list| list.last())
                .map(|entry| entry.timestamp),
            _ => self
                .lww
                .get(&component)
                .and_then(|inner| inner.get(&entity))
                .map(|entry| entry.timestamp),
        };
        stored.map_or(0, |timestamp| timestamp.saturating_add(1))
    }

    /// Build a host PUT that supersedes whatever the baseline holds.
    pub fn create_put_message(
        &self,
        entity: EntityKey,
        component: ComponentKey,
        payload: Payload,
    ) -> DeltaMessage {
        let timestamp = self.next_timestamp(MessageKind::Put, entity, component);
        DeltaMessage::put(entity, component, timestamp, payload)
    }

    /// Build a host DELETE that supersedes whatever the baseline holds.
    pub fn create_delete_message(&self, entity: EntityKey, component: ComponentKey) -> DeltaMessage {
        let timestamp = self.next_timestamp(MessageKind::Delete, entity, component);
        DeltaMessage::delete(entity, component, timestamp)
    }

    pub fn create_append_message(
        &self,
        entity: EntityKey,
        component: ComponentKey,
        payload: Payload,
    ) -> DeltaMessage {
        let timestamp = self.next_timestamp(MessageKind::Append, entity, component);
        DeltaMessage::append(entity, component, timestamp, payload)
    }

    /// Write a host-originated PUT or DELETE into the baseline without
    /// classifying it, so later timestamps continue from it. The message's
    /// payload moves into the store, so this never rents. Other kinds are
    /// not retained.
    pub fn enforce_lww(&mut self, message: DeltaMessage) {
        let deleted = match message.kind {
            MessageKind::Put => false,
            MessageKind::Delete => true,
            MessageKind::Append | MessageKind::DeleteEntity | MessageKind::None => return,
        };
        let DeltaMessage {
            entity,
            component,
            timestamp,
            mut payload,
            ..
        } = message;
        if deleted {
            payload.release();
        }

        let inner = self.lww.entry(component).or_default();
        match inner.get_mut(&entity) {
            Some(stored) => {
                // The replaced payload returns to its pool here.
                stored.payload = payload;
                stored.timestamp = timestamp;
                stored.deleted = deleted;
            }
            None => {
                inner.insert(
                    entity,
                    BaselineEntry {
                        timestamp,
                        payload,
                        deleted,
                    },
                );
                self.message_count += 1;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    /// Number of messages [`create_snapshot`](Self::create_snapshot) produces.
    pub fn message_count(&self) -> usize {
        self.message_count
    }

    /// Total payload bytes held by the store.
    pub fn payload_len(&self) -> usize {
        let lww: usize = self
            .lww
            .values()
            .flat_map(HashMap::values)
            .map(|entry| entry.payload.len())
            .sum();
        let appends: usize = self
            .appends
            .values()
            .flat_map(HashMap::values)
            .flatten()
            .map(|entry| entry.payload.len())
            .sum();
        lww + appends
    }

    /// Exact serialized size of the snapshot.
    pub fn snapshot_encoded_len(&self) -> usize {
        let deleted = self.deleted_entities.len() * encoded_len(MessageKind::DeleteEntity, 0);
        let lww: usize = self
            .lww
            .values()
            .flat_map(HashMap::values)
            .map(|entry| {
                if entry.deleted {
                    encoded_len(MessageKind::Delete, 0)
                } else {
                    encoded_len(MessageKind::Put, entry.payload.len())
                }
            })
            .sum();
        let appends: usize = self
            .appends
            .values()
            .flat_map(HashMap::values)
            .flatten()
            .map(|entry| encoded_len(MessageKind::Append, entry.payload.len()))
            .sum();
        deleted + lww + appends
    }

    /// Messages that reproduce the current state in a fresh store: entity
    /// deletions first, then one PUT or DELETE per key, then every appended
    /// value. Payloads are fresh rentals; the store is not modified.
    pub fn create_snapshot(
        &self,
        pools: &PoolRegistry,
    ) -> Result<Pooled<Vec<DeltaMessage>>, PoolError> {
        let mut messages = pools.snapshots.rent()?;
        messages.reserve_exact(self.message_count);

        for (&number, &version) in &self.deleted_entities {
            messages.push(DeltaMessage::delete_entity(EntityKey::new(number, version)));
        }
        for (&component, inner) in &self.lww {
            for (&entity, entry) in inner {
                let message = if entry.deleted {
                    DeltaMessage::delete(entity, component, entry.timestamp)
                } else {
                    DeltaMessage::put(
                        entity,
                        component,
                        entry.timestamp,
                        entry.payload.duplicate(&pools.payloads)?,
                    )
                };
                messages.push(message);
            }
        }
        for (&component, inner) in &self.appends {
            for (&entity, list) in inner {
                for entry in list {
                    messages.push(DeltaMessage::append(
                        entity,
                        component,
                        entry.timestamp,
                        entry.payload.duplicate(&pools.payloads)?,
                    ));
                }
            }
        }

        debug_assert_eq!(messages.len(), self.message_count);
        Ok(messages)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn baseline(&self, entity: EntityKey, component: ComponentKey) -> Option<BaselineView<'_>> {
        let entry = self.lww.get(&component)?.get(&entity)?;
        Some(BaselineView {
            timestamp: entry.timestamp,
            payload: (!entry.deleted).then(|| entry.payload.as_slice()),
        })
    }

    /// Appended values for a key in (timestamp, payload) order.
    pub fn appended(
        &self,
        entity: EntityKey,
        component: ComponentKey,
    ) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        self.appends
            .get(&component)
            .and_then(|inner| inner.get(&entity))
            .into_iter()
            .flatten()
            .map(|entry| (entry.timestamp, entry.payload.as_slice()))
    }

    pub fn deleted_version(&self, number: u16) -> Option<u16> {
        self.deleted_entities.get(&number).copied()
    }

    pub fn stats(&self) -> ProtocolStats {
        self.stats
    }

    /// Forget every baseline entry and hand payloads back to the pool.
    /// Counters are kept.
    pub fn clear(&mut self) {
        self.deleted_entities.clear();
        self.lww.clear();
        self.appends.clear();
        self.message_count = 0;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
