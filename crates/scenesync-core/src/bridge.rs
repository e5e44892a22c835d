//! Per-scene entry point.
//!
//! A [`SceneBridge`] belongs to one scene thread. Each tick the scene hands
//! it a batch of encoded deltas; the bridge reconciles them against its
//! baseline, stages the survivors, applies them to the shared world under
//! the [`WorldSync`] guard and returns the host's own changes encoded for
//! the scene.
//!
//! Host code that wants to push changes to a scene uses a [`HostWriter`],
//! which can be cloned onto any thread.

use crate::component::{CodecError, ComponentValue};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::id::{ComponentKey, EntityKey, SceneId};
use crate::message::{
    decode_batch, encode_batch, encode_frame, DecodeReport, MessageKind, Payload,
};
use crate::outgoing::{OutgoingDeltaCollector, OutgoingMessage};
use crate::pool::{BytePool, PoolRegistry, Pooled, SceneLocalPools};
use crate::protocol::{ProtocolStats, ReplicatedState};
use crate::registry::ComponentRegistry;
use crate::staging::{ApplyReport, FinalizeReport, SyncStagingBuffer};
use crate::sync::WorldSync;
use crate::world::{EntityMap, World};
use std::sync::Arc;
use tracing::{debug, debug_span, error, warn};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Running totals for one bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Calls to `submit` and `submit_without_reply` that completed.
    pub batches: u64,
    /// Messages decoded from inbound batches.
    pub messages: u64,
    /// Frames skipped for an unknown kind or a short body.
    pub dropped_frames: u64,
    /// Trailing bytes discarded from truncated batches.
    pub truncated_bytes: u64,
    /// Changes dropped because their payload did not deserialize.
    pub deserialization_failures: u64,
    pub entities_created: u64,
    pub entities_removed: u64,
    pub components_attached: u64,
    pub components_detached: u64,
    /// Records skipped because they targeted host-reserved entities.
    pub reserved_skipped: u64,
    /// Host messages encoded into outbound batches.
    pub outgoing_sent: u64,
    /// Reconciliation outcome counters from the protocol.
    pub protocol: ProtocolStats,
}

impl BridgeStats {
    fn record_decode(&mut self, report: &DecodeReport) {
        self.messages += report.decoded as u64;
        self.dropped_frames += (report.unknown_kind + report.malformed) as u64;
        self.truncated_bytes += report.truncated_bytes as u64;
    }

    fn record_finalize(&mut self, report: &FinalizeReport) {
        self.deserialization_failures += report.failed as u64;
    }

    fn record_apply(&mut self, report: &ApplyReport) {
        self.entities_created += report.entities_created as u64;
        self.entities_removed += report.entities_removed as u64;
        self.components_attached += report.components_attached as u64;
        self.components_detached += report.components_detached as u64;
        self.reserved_skipped += report.reserved_skipped as u64;
    }
}

// ---------------------------------------------------------------------------
// SceneBridge
// ---------------------------------------------------------------------------

/// The bridge between one scene and the shared host world.
pub struct SceneBridge<W: World> {
    scene: SceneId,
    registry: Arc<ComponentRegistry>,
    pools: PoolRegistry,
    local: SceneLocalPools,
    message_list_capacity: usize,
    protocol: ReplicatedState,
    outgoing: Arc<OutgoingDeltaCollector>,
    world: Arc<WorldSync<W>>,
    entities: EntityMap,
    /// The buffer behind the slice the last call returned.
    outbound: Option<Pooled<Vec<u8>>>,
    disposing: bool,
    stats: BridgeStats,
}

impl<W: World> std::fmt::Debug for SceneBridge<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneBridge")
            .field("scene", &self.scene)
            .field("entities", &self.entities.len())
            .field("baseline_messages", &self.protocol.message_count())
            .field("outgoing", &self.outgoing.len())
            .field("disposing", &self.disposing)
            .finish()
    }
}

impl<W: World> SceneBridge<W> {
    pub fn new(
        scene: SceneId,
        registry: Arc<ComponentRegistry>,
        pools: PoolRegistry,
        world: Arc<WorldSync<W>>,
        config: &BridgeConfig,
    ) -> Self {
        let protocol = ReplicatedState::new(
            Arc::clone(&registry),
            config.protocol.clone(),
            pools.payloads.clone(),
        );
        Self {
            scene,
            registry,
            local: SceneLocalPools::new(&config.pools),
            message_list_capacity: config.pools.message_list_capacity,
            pools,
            protocol,
            outgoing: Arc::new(OutgoingDeltaCollector::new()),
            world,
            entities: EntityMap::new(),
            outbound: None,
            disposing: false,
            stats: BridgeStats::default(),
        }
    }

    pub fn scene(&self) -> SceneId {
        self.scene
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn protocol(&self) -> &ReplicatedState {
        &self.protocol
    }

    /// Scene entity keys materialised in the world by this bridge.
    pub fn entities(&self) -> &EntityMap {
        &self.entities
    }

    /// Queue of host changes waiting to be sent to the scene.
    pub fn outgoing(&self) -> &Arc<OutgoingDeltaCollector> {
        &self.outgoing
    }

    /// A handle that validates and encodes host changes for this scene.
    pub fn host_writer(&self) -> HostWriter {
        HostWriter {
            registry: Arc::clone(&self.registry),
            payloads: self.pools.payloads.clone(),
            outgoing: Arc::clone(&self.outgoing),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.disposing
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            protocol: self.protocol.stats(),
            ..self.stats
        }
    }

    /// Process one inbound batch and return the host's pending changes
    /// encoded for the scene. The slice stays valid until the next call.
    pub fn submit(&mut self, inbound: &[u8]) -> Result<&[u8], BridgeError> {
        let span = debug_span!("submit", scene = self.scene.0, bytes = inbound.len());
        let _enter = span.enter();

        if self.disposing {
            return Ok(&[]);
        }
        self.outbound = None;

        if let Err(err) = self.process_batch(inbound, true) {
            error!(error = %err, "submit failed");
            return Err(err);
        }
        Ok(self.outbound_slice())
    }

    /// Process one inbound batch without draining the outgoing queue.
    pub fn submit_without_reply(&mut self, inbound: &[u8]) -> Result<(), BridgeError> {
        let span = debug_span!("submit", scene = self.scene.0, bytes = inbound.len(), reply = false);
        let _enter = span.enter();

        if self.disposing {
            return Ok(());
        }
        self.outbound = None;

        self.process_batch(inbound, false).inspect_err(|err| {
            error!(error = %err, "submit failed");
        })
    }

    fn process_batch(&mut self, inbound: &[u8], reply: bool) -> Result<(), BridgeError> {
        let capacity = self.message_list_capacity;
        let registry = &self.registry;
        let pools = &self.pools;
        let protocol = &mut self.protocol;

        let (decode, finalize, mut staging) =
            self.local.message_lists.scoped(|messages| -> Result<_, BridgeError> {
                messages.reserve(capacity);
                let decode = decode_batch(inbound, messages, &pools.payloads)?;
                let mut staging = SyncStagingBuffer::new(Arc::clone(registry), pools)?;
                for message in messages.drain(..) {
                    let effect = protocol.process(&message)?;
                    staging.sync(message, effect)?;
                }
                let finalize = staging.finalize_and_deserialize()?;
                Ok((decode, finalize, staging))
            })?;
        self.stats.record_decode(&decode);
        self.stats.record_finalize(&finalize);

        // The world is brought in line with the baseline before any host
        // change is taken off the queue.
        let world = Arc::clone(&self.world);
        let mut scope = world.scope(self.scene)?;
        let applied = staging.apply(&mut *scope, &mut self.entities)?;
        self.stats.record_apply(&applied);
        self.stats.batches += 1;
        if reply {
            let buffer = self.drain_outgoing()?;
            self.outbound = Some(buffer);
        }
        drop(scope);

        debug!(
            decoded = decode.decoded,
            dropped = decode.unknown_kind + decode.malformed,
            truncated = decode.truncated_bytes,
            created = applied.entities_created,
            removed = applied.entities_removed,
            attached = applied.components_attached,
            detached = applied.components_detached,
            outbound = self.outbound.as_ref().map_or(0, |buffer| buffer.len()),
            "batch applied"
        );
        Ok(())
    }

    /// Timestamp, encode and record every queued host change. Encoding
    /// finishes before the queue is committed, so a failure leaves every
    /// change queued.
    fn drain_outgoing(&mut self) -> Result<Pooled<Vec<u8>>, BridgeError> {
        let protocol = &mut self.protocol;
        let outbound = &self.pools.outbound;
        let (buffer, sent) = self.outgoing.stage_with(|pending| -> Result<_, BridgeError> {
            let mut buffer = outbound.rent()?;
            buffer.reserve_exact(pending.encoded_len());
            for message in pending.messages() {
                if !is_host_kind(message.kind) {
                    continue;
                }
                let timestamp = protocol.next_timestamp(message.kind, message.entity, message.component);
                encode_frame(
                    message.kind,
                    message.entity,
                    message.component,
                    timestamp,
                    message.payload.as_slice(),
                    &mut buffer,
                )?;
            }

            let mut sent = 0u64;
            for message in pending.commit() {
                let OutgoingMessage {
                    kind,
                    entity,
                    component,
                    payload,
                } = message;
                let delta = match kind {
                    MessageKind::Put => protocol.create_put_message(entity, component, payload),
                    MessageKind::Delete => protocol.create_delete_message(entity, component),
                    MessageKind::Append => protocol.create_append_message(entity, component, payload),
                    MessageKind::DeleteEntity | MessageKind::None => continue,
                };
                protocol.enforce_lww(delta);
                sent += 1;
            }
            Ok((buffer, sent))
        })?;
        self.stats.outgoing_sent += sent;
        Ok(buffer)
    }

    /// Encode the baseline followed by the queued host changes. Neither the
    /// baseline nor the queue is modified.
    pub fn dump_state(&mut self) -> Result<&[u8], BridgeError> {
        let span = debug_span!("dump_state", scene = self.scene.0);
        let _enter = span.enter();

        if self.disposing {
            return Ok(&[]);
        }
        self.outbound = None;

        match self.encode_state() {
            Ok(buffer) => {
                debug!(bytes = buffer.len(), "state dumped");
                self.outbound = Some(buffer);
                Ok(self.outbound_slice())
            }
            Err(err) => {
                error!(error = %err, "dump_state failed");
                Err(err)
            }
        }
    }

    fn encode_state(&self) -> Result<Pooled<Vec<u8>>, BridgeError> {
        let snapshot = self.protocol.create_snapshot(&self.pools)?;
        let mut buffer = self.pools.outbound.rent()?;
        let protocol = &self.protocol;

        self.outgoing.peek_with(|pending| -> Result<(), BridgeError> {
            let pending_len: usize = pending.iter().map(OutgoingMessage::encoded_len).sum();
            buffer.reserve_exact(protocol.snapshot_encoded_len() + pending_len);
            encode_batch(snapshot.iter(), &mut buffer)?;
            for message in pending {
                let timestamp = protocol.next_timestamp(message.kind, message.entity, message.component);
                encode_frame(
                    message.kind,
                    message.entity,
                    message.component,
                    timestamp,
                    message.payload.as_slice(),
                    &mut buffer,
                )?;
            }
            Ok(())
        })?;
        Ok(buffer)
    }

    fn outbound_slice(&self) -> &[u8] {
        self.outbound.as_deref().map_or(&[][..], Vec::as_slice)
    }

    /// Tear the bridge down. The scene's entities are tagged for removal,
    /// the baseline and outgoing queue are dropped and pooled buffers go
    /// back. Later calls return empty results. Idempotent.
    pub fn shutdown(&mut self) {
        if self.disposing {
            return;
        }
        self.disposing = true;
        self.outbound = None;

        if !self.entities.is_empty() {
            match self.world.scope(self.scene) {
                Ok(mut world) => {
                    for (_, handle) in self.entities.iter() {
                        world.mark_for_removal(handle);
                    }
                }
                Err(err) => {
                    warn!(scene = self.scene.0, error = %err, "scene entities left in the world");
                }
            }
            self.entities.clear();
        }

        self.protocol.clear();
        self.outgoing.clear();
        self.local.release_all();
        debug!(scene = self.scene.0, "bridge shut down");
    }
}

impl<W: World> Drop for SceneBridge<W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Kinds the host may queue for a scene.
fn is_host_kind(kind: MessageKind) -> bool {
    matches!(kind, MessageKind::Put | MessageKind::Delete | MessageKind::Append)
}

// ---------------------------------------------------------------------------
// HostWriter
// ---------------------------------------------------------------------------

/// Queues host changes for one scene after checking them against the
/// registry. Cheap to clone; clones feed the same queue.
#[derive(Debug, Clone)]
pub struct HostWriter {
    registry: Arc<ComponentRegistry>,
    payloads: BytePool,
    outgoing: Arc<OutgoingDeltaCollector>,
}

impl HostWriter {
    /// Queue `value` as the new state of `component` on `entity`.
    pub fn put(
        &self,
        entity: EntityKey,
        component: ComponentKey,
        value: &ComponentValue,
    ) -> Result<(), BridgeError> {
        let payload = self.encode(component, value)?;
        self.outgoing.put(entity, component, payload);
        Ok(())
    }

    pub fn delete(&self, entity: EntityKey, component: ComponentKey) -> Result<(), BridgeError> {
        if !self.registry.contains(component) {
            return Err(BridgeError::UnknownComponent(component));
        }
        self.outgoing.delete(entity, component);
        Ok(())
    }

    /// Queue `value` for an append-only component.
    pub fn append(
        &self,
        entity: EntityKey,
        component: ComponentKey,
        value: &ComponentValue,
    ) -> Result<(), BridgeError> {
        let payload = self.encode(component, value)?;
        self.outgoing.append(entity, component, payload);
        Ok(())
    }

    fn encode(&self, component: ComponentKey, value: &ComponentValue) -> Result<Payload, BridgeError> {
        let bridge = self
            .registry
            .get(component)
            .ok_or(BridgeError::UnknownComponent(component))?;
        if value.kind() != bridge.kind {
            return Err(CodecError::KindMismatch {
                expected: bridge.kind,
                found: value.kind(),
            }
            .into());
        }
        let mut buffer = self.payloads.rent()?;
        (bridge.codec().encode)(value, &mut *buffer)?;
        if buffer.is_empty() {
            return Ok(Payload::empty());
        }
        Ok(Payload::from_pooled(buffer))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentKind, Text, Transform, Visibility};
    use crate::config::PoolConfig;
    use crate::id::reserved;
    use crate::message::DeltaMessage;
    use crate::registry::RegistryBuilder;
    use crate::world::SceneWorld;

    const TRANSFORM: ComponentKey = ComponentKey(1);
    const VISIBILITY: ComponentKey = ComponentKey(2);
    const TEXT: ComponentKey = ComponentKey(3);
    const CHAT: ComponentKey = ComponentKey(4);
    const E: EntityKey = EntityKey(512);

    fn registry() -> Arc<ComponentRegistry> {
        let mut builder = RegistryBuilder::new();
        builder
            .register(TRANSFORM, "transform", ComponentKind::Transform)
            .register(VISIBILITY, "visibility", ComponentKind::Visibility)
            .register(TEXT, "text", ComponentKind::Text)
            .register(CHAT, "chat", ComponentKind::Blob);
        Arc::new(builder.build().unwrap())
    }

    struct Fixture {
        pools: PoolRegistry,
        world: Arc<WorldSync<SceneWorld>>,
        bridge: SceneBridge<SceneWorld>,
    }

    fn fixture() -> Fixture {
        fixture_with(BridgeConfig::default())
    }

    fn fixture_with(config: BridgeConfig) -> Fixture {
        let pools = PoolRegistry::new(&config.pools);
        let world = Arc::new(WorldSync::new(SceneWorld::new(), &config.sync));
        let bridge = SceneBridge::new(SceneId(7), registry(), pools.clone(), Arc::clone(&world), &config);
        Fixture { pools, world, bridge }
    }

    fn encode(messages: &[DeltaMessage]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_batch(messages, &mut out).unwrap();
        out
    }

    fn put(
        pools: &PoolRegistry,
        entity: EntityKey,
        component: ComponentKey,
        ts: u32,
        value: &ComponentValue,
    ) -> DeltaMessage {
        let bytes = value.encode().unwrap();
        DeltaMessage::put(entity, component, ts, Payload::copy_from(&pools.payloads, &bytes).unwrap())
    }

    fn visible(visible: bool) -> ComponentValue {
        ComponentValue::Visibility(Visibility {
            visible,
            propagate_to_children: false,
        })
    }

    fn decode_all(pools: &PoolRegistry, bytes: &[u8]) -> Vec<DeltaMessage> {
        let mut out = Vec::new();
        let report = decode_batch(bytes, &mut out, &pools.payloads).unwrap();
        assert!(report.is_clean());
        out
    }

    // -----------------------------------------------------------------------
    // Test 1: submit materialises entities and components
    // -----------------------------------------------------------------------
    #[test]
    fn submit_applies_batch_to_world() {
        let mut f = fixture();
        let transform = ComponentValue::Transform(Transform {
            position: [1.0, 2.0, 3.0],
            ..Transform::default()
        });
        let batch = encode(
            &[
                put(&f.pools, E, TRANSFORM, 1, &transform),
                put(&f.pools, E, VISIBILITY, 1, &visible(false)),
            ],
        );

        let reply = f.bridge.submit(&batch).unwrap();
        assert!(reply.is_empty());

        let handle = f.bridge.entities().get(E).unwrap();
        let world = f.world.scope(SceneId(0)).unwrap();
        assert_eq!(world.component_count(handle), 2);
        assert_eq!(*world.component(handle, TRANSFORM).unwrap().value, transform);
        drop(world);

        let stats = f.bridge.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.entities_created, 1);
        assert_eq!(stats.components_attached, 2);
        assert_eq!(stats.protocol.updated, 2);
    }

    // -----------------------------------------------------------------------
    // Test 2: stale updates do not reach the world
    // -----------------------------------------------------------------------
    #[test]
    fn outdated_put_is_ignored() {
        let mut f = fixture();
        let first = encode(&[put(&f.pools, E, VISIBILITY, 5, &visible(false))]);
        f.bridge.submit(&first).unwrap();
        let stale = encode(&[put(&f.pools, E, VISIBILITY, 3, &visible(true))]);
        f.bridge.submit(&stale).unwrap();

        let handle = f.bridge.entities().get(E).unwrap();
        let world = f.world.scope(SceneId(0)).unwrap();
        assert_eq!(*world.component(handle, VISIBILITY).unwrap().value, visible(false));
        drop(world);
        assert_eq!(f.bridge.stats().protocol.outdated, 1);
    }

    // -----------------------------------------------------------------------
    // Test 3: host changes come back with protocol timestamps
    // -----------------------------------------------------------------------
    #[test]
    fn outgoing_changes_are_returned_and_recorded() {
        let mut f = fixture();
        let inbound = encode(&[put(&f.pools, E, VISIBILITY, 4, &visible(true))]);
        f.bridge.submit(&inbound).unwrap();

        let writer = f.bridge.host_writer();
        writer.put(E, VISIBILITY, &visible(false)).unwrap();
        writer.delete(EntityKey(600), TRANSFORM).unwrap();
        let expected_len = f.bridge.outgoing().encoded_len();

        let reply = f.bridge.submit(&[]).unwrap().to_vec();
        assert_eq!(reply.len(), expected_len);

        let messages = decode_all(&f.pools, &reply);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageKind::Put);
        assert_eq!(messages[0].timestamp, 5);
        assert_eq!(messages[1].kind, MessageKind::Delete);
        assert_eq!(messages[1].timestamp, 0);

        // The baseline now holds the host's value.
        let baseline = f.bridge.protocol().baseline(E, VISIBILITY).unwrap();
        assert_eq!(baseline.timestamp, 5);
        assert!(f.bridge.outgoing().is_empty());
        assert_eq!(f.bridge.stats().outgoing_sent, 2);
    }

    // -----------------------------------------------------------------------
    // Test 4: submit without reply keeps the queue
    // -----------------------------------------------------------------------
    #[test]
    fn submit_without_reply_leaves_outgoing_queued() {
        let mut f = fixture();
        f.bridge.host_writer().put(E, VISIBILITY, &visible(true)).unwrap();
        f.bridge.submit_without_reply(&[]).unwrap();
        assert_eq!(f.bridge.outgoing().len(), 1);
        assert_eq!(f.bridge.stats().batches, 1);
    }

    // -----------------------------------------------------------------------
    // Test 5: dump_state is exact and read-only
    // -----------------------------------------------------------------------
    #[test]
    fn dump_state_includes_pending_without_draining() {
        let mut f = fixture();
        let inbound = encode(
            &[
                put(&f.pools, E, VISIBILITY, 2, &visible(true)),
                DeltaMessage::delete(EntityKey(513), TRANSFORM, 9),
                DeltaMessage::delete_entity(EntityKey::new(700, 1)),
            ],
        );
        f.bridge.submit(&inbound).unwrap();
        let label = ComponentValue::Text(Text {
            value: "hello".into(),
            font_size: 12.0,
        });
        f.bridge.host_writer().put(E, TEXT, &label).unwrap();

        let expected = f.bridge.protocol().snapshot_encoded_len() + f.bridge.outgoing().encoded_len();
        let count_before = f.bridge.protocol().message_count();
        let dump = f.bridge.dump_state().unwrap().to_vec();
        assert_eq!(dump.len(), expected);

        let messages = decode_all(&f.pools, &dump);
        assert_eq!(messages.len(), count_before + 1);
        assert_eq!(messages[0].kind, MessageKind::DeleteEntity);
        let last = messages.last().unwrap();
        assert_eq!((last.kind, last.component, last.timestamp), (MessageKind::Put, TEXT, 0));

        assert_eq!(f.bridge.protocol().message_count(), count_before);
        assert_eq!(f.bridge.outgoing().len(), 1);
        assert!(f.bridge.protocol().baseline(E, TEXT).is_none());
    }

    // -----------------------------------------------------------------------
    // Test 6: entity deletion tags the world entity
    // -----------------------------------------------------------------------
    #[test]
    fn delete_entity_marks_world_entity() {
        let mut f = fixture();
        let other = EntityKey(513);
        let batch = encode(
            &[
                put(&f.pools, E, VISIBILITY, 1, &visible(true)),
                put(&f.pools, other, VISIBILITY, 1, &visible(true)),
            ],
        );
        f.bridge.submit(&batch).unwrap();
        let handle = f.bridge.entities().get(E).unwrap();

        let delete = encode(&[DeltaMessage::delete_entity(E)]);
        f.bridge.submit(&delete).unwrap();

        assert!(f.bridge.entities().get(E).is_none());
        assert!(f.bridge.entities().get(other).is_some());
        let mut world = f.world.scope(SceneId(0)).unwrap();
        assert!(world.is_marked(handle));
        assert_eq!(world.sweep(), 1);
        assert_eq!(world.entity_count(), 1);
    }

    // -----------------------------------------------------------------------
    // Test 7: reserved entities are never materialised
    // -----------------------------------------------------------------------
    #[test]
    fn reserved_entities_are_skipped() {
        let mut f = fixture();
        let player = EntityKey::new(reserved::PLAYER_ENTITY, 0);
        let batch = encode(&[put(&f.pools, player, VISIBILITY, 1, &visible(true))]);
        f.bridge.submit(&batch).unwrap();
        assert!(f.bridge.entities().is_empty());
        assert_eq!(f.bridge.stats().reserved_skipped, 1);
        // The baseline still tracks it.
        assert!(f.bridge.protocol().baseline(player, VISIBILITY).is_some());
    }

    // -----------------------------------------------------------------------
    // Test 8: bad payloads are dropped, the rest applies
    // -----------------------------------------------------------------------
    #[test]
    fn undecodable_payload_is_counted_and_skipped() {
        let mut f = fixture();
        let garbage = DeltaMessage::put(E, TRANSFORM, 1, Payload::copy_from(&f.pools.payloads, &[0xFF]).unwrap());
        let batch = encode(&[garbage, put(&f.pools, E, VISIBILITY, 1, &visible(true))]);
        f.bridge.submit(&batch).unwrap();

        let stats = f.bridge.stats();
        assert_eq!(stats.deserialization_failures, 1);
        assert_eq!(stats.components_attached, 1);
    }

    // -----------------------------------------------------------------------
    // Test 9: timeout surfaces as an error and leaves the bridge usable
    // -----------------------------------------------------------------------
    #[test]
    fn world_timeout_is_reported() {
        let mut config = BridgeConfig::default();
        config.sync.acquire_timeout_ms = 10;
        let mut f = fixture_with(config);
        let batch = encode(&[put(&f.pools, E, VISIBILITY, 1, &visible(true))]);

        let held = f.world.scope(SceneId(99)).unwrap();
        let err = f.bridge.submit(&batch).unwrap_err();
        assert!(matches!(err, BridgeError::SyncTimeout(_)));
        drop(held);

        // Staging was dropped with the failed call; nothing leaked.
        assert_eq!(f.pools.batch_maps.stats().outstanding(), 0);
        assert_eq!(f.pools.components.stats(ComponentKind::Visibility).outstanding(), 0);
        assert!(f.bridge.submit(&[]).is_ok());
    }

    // -----------------------------------------------------------------------
    // Test 10: exhausted outbound pool is a hard error
    // -----------------------------------------------------------------------
    #[test]
    fn outbound_ceiling_is_enforced() {
        let config = BridgeConfig {
            pools: PoolConfig {
                outbound_ceiling: Some(1),
                ..PoolConfig::default()
            },
            ..BridgeConfig::default()
        };
        let mut f = fixture_with(config);
        let _held = f.pools.outbound.rent().unwrap();
        let err = f.bridge.submit(&[]).unwrap_err();
        assert!(matches!(err, BridgeError::PoolExhaustion(_)));
    }

    #[test]
    fn failed_reply_keeps_world_applied_and_changes_queued() {
        let config = BridgeConfig {
            pools: PoolConfig {
                outbound_ceiling: Some(1),
                ..PoolConfig::default()
            },
            ..BridgeConfig::default()
        };
        let mut f = fixture_with(config);
        let writer = f.bridge.host_writer();
        writer.put(E, CHAT, &ComponentValue::Blob(b"one".to_vec())).unwrap();
        writer.put(EntityKey(513), CHAT, &ComponentValue::Blob(b"two".to_vec())).unwrap();

        let held = f.pools.outbound.rent().unwrap();
        let batch = encode(&[put(&f.pools, E, VISIBILITY, 1, &visible(true))]);
        let err = f.bridge.submit(&batch).unwrap_err();
        assert!(matches!(err, BridgeError::PoolExhaustion(_)));

        // The scene's change reached the world; the host's stayed queued.
        let handle = f.bridge.entities().get(E).unwrap();
        let world = f.world.scope(SceneId(0)).unwrap();
        assert_eq!(*world.component(handle, VISIBILITY).unwrap().value, visible(true));
        drop(world);
        assert_eq!(f.bridge.outgoing().len(), 2);
        assert!(f.bridge.protocol().baseline(E, CHAT).is_none());

        drop(held);
        let reply = f.bridge.submit(&[]).unwrap().to_vec();
        assert_eq!(decode_all(&f.pools, &reply).len(), 2);
        assert!(f.bridge.outgoing().is_empty());
        assert_eq!(
            f.bridge.protocol().baseline(E, CHAT).unwrap().payload,
            Some(&b"one"[..])
        );
    }

    #[test]
    fn queued_payloads_move_into_the_baseline() {
        let config = BridgeConfig {
            pools: PoolConfig {
                payload_ceiling: Some(2),
                ..PoolConfig::default()
            },
            ..BridgeConfig::default()
        };
        let mut f = fixture_with(config);
        let writer = f.bridge.host_writer();
        writer.put(E, CHAT, &ComponentValue::Blob(b"one".to_vec())).unwrap();
        writer.put(EntityKey(513), CHAT, &ComponentValue::Blob(b"two".to_vec())).unwrap();

        // Both payloads are rented already; storing them must not rent again.
        let reply = f.bridge.submit(&[]).unwrap().len();
        assert_eq!(reply, 2 * crate::message::encoded_len(MessageKind::Put, 3));
        assert!(f.bridge.outgoing().is_empty());
        assert_eq!(f.bridge.stats().outgoing_sent, 2);
        assert_eq!(
            f.bridge.protocol().baseline(EntityKey(513), CHAT).unwrap().payload,
            Some(&b"two"[..])
        );
        assert_eq!(f.pools.payloads.stats().outstanding(), 2);
    }

    // -----------------------------------------------------------------------
    // Test 11: shutdown releases everything
    // -----------------------------------------------------------------------
    #[test]
    fn shutdown_returns_all_rentals() {
        let mut f = fixture();
        let batch = encode(
            &[
                put(&f.pools, E, VISIBILITY, 1, &visible(true)),
                DeltaMessage::append(E, CHAT, 1, Payload::copy_from(&f.pools.payloads, b"hi").unwrap()),
            ],
        );
        f.bridge.submit(&batch).unwrap();
        f.bridge.host_writer().put(E, CHAT, &ComponentValue::Blob(b"queued".to_vec())).unwrap();
        f.bridge.dump_state().unwrap();

        f.bridge.shutdown();
        f.bridge.shutdown();
        assert!(f.bridge.is_shut_down());
        assert!(f.bridge.submit(&batch).unwrap().is_empty());
        assert!(f.bridge.dump_state().unwrap().is_empty());

        f.world.scope(SceneId(0)).unwrap().sweep();
        assert_eq!(f.pools.outstanding(), 0);
    }

    // -----------------------------------------------------------------------
    // Test 12: host writer validation
    // -----------------------------------------------------------------------
    #[test]
    fn host_writer_rejects_unknown_and_mismatched() {
        let f = fixture();
        let writer = f.bridge.host_writer();
        let err = writer.put(E, ComponentKey(999), &visible(true)).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownComponent(ComponentKey(999))));
        assert!(writer.delete(E, ComponentKey(999)).is_err());

        let err = writer.put(E, TRANSFORM, &visible(true)).unwrap_err();
        assert!(matches!(err, BridgeError::Serialization(_)));
        assert!(err.is_soft());
        assert!(f.bridge.outgoing().is_empty());
        assert_eq!(f.pools.payloads.stats().outstanding(), 0);
    }

    #[test]
    fn appends_from_host_share_a_timestamp() {
        let mut f = fixture();
        let writer = f.bridge.host_writer();
        writer.append(E, CHAT, &ComponentValue::Blob(b"a".to_vec())).unwrap();
        writer.append(E, CHAT, &ComponentValue::Blob(b"b".to_vec())).unwrap();
        let reply = f.bridge.submit(&[]).unwrap().to_vec();
        let messages = decode_all(&f.pools, &reply);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.kind == MessageKind::Append && m.timestamp == 0));
    }
}
