//! Shared test helpers for integration tests, benchmarks and fuzz targets.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::bridge::SceneBridge;
use crate::component::{ComponentKind, ComponentValue, Text, Transform, Visibility};
use crate::config::BridgeConfig;
use crate::id::{ComponentKey, EntityKey, SceneId};
use crate::message::{decode_batch, encode_batch, encode_frame, DeltaMessage, MessageKind, Payload};
use crate::pool::PoolRegistry;
use crate::registry::{ComponentRegistry, RegistryBuilder};
use crate::sync::WorldSync;
use crate::world::SceneWorld;
use std::sync::Arc;

// ===========================================================================
// Components
// ===========================================================================

pub const TRANSFORM: ComponentKey = ComponentKey(1);
pub const VISIBILITY: ComponentKey = ComponentKey(2);
pub const TEXT: ComponentKey = ComponentKey(3);
/// Append-only blob component.
pub const CHAT: ComponentKey = ComponentKey(4);
/// Never registered.
pub const UNREGISTERED: ComponentKey = ComponentKey(999);

/// Registry with one component of every kind.
pub fn standard_registry() -> Arc<ComponentRegistry> {
    let mut builder = RegistryBuilder::new();
    builder
        .register(TRANSFORM, "transform", ComponentKind::Transform)
        .register(VISIBILITY, "visibility", ComponentKind::Visibility)
        .register(TEXT, "text", ComponentKind::Text)
        .register(CHAT, "chat", ComponentKind::Blob);
    match builder.build() {
        Ok(registry) => Arc::new(registry),
        Err(err) => panic!("standard registry is invalid: {err}"),
    }
}

/// First entity number a scene may materialise.
pub const FIRST_SCENE_ENTITY: u16 = 512;

pub fn entity(offset: u16) -> EntityKey {
    EntityKey::new(FIRST_SCENE_ENTITY + offset, 0)
}

// ===========================================================================
// Component values
// ===========================================================================

pub fn transform_at(x: f32, y: f32, z: f32) -> ComponentValue {
    ComponentValue::Transform(Transform {
        position: [x, y, z],
        ..Transform::default()
    })
}

pub fn visible(visible: bool) -> ComponentValue {
    ComponentValue::Visibility(Visibility {
        visible,
        propagate_to_children: false,
    })
}

pub fn label(text: &str) -> ComponentValue {
    ComponentValue::Text(Text {
        value: text.to_string(),
        font_size: 14.0,
    })
}

pub fn blob(bytes: &[u8]) -> ComponentValue {
    ComponentValue::Blob(bytes.to_vec())
}

fn encode_value(value: &ComponentValue) -> Vec<u8> {
    match value.encode() {
        Ok(bytes) => bytes,
        Err(err) => panic!("test value failed to encode: {err}"),
    }
}

// ===========================================================================
// Batches
// ===========================================================================

/// Builds an encoded inbound batch frame by frame.
#[derive(Debug, Default, Clone)]
pub struct BatchBuilder {
    bytes: Vec<u8>,
    frames: usize,
}

impl BatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn frame(
        mut self,
        kind: MessageKind,
        entity: EntityKey,
        component: ComponentKey,
        ts: u32,
        payload: &[u8],
    ) -> Self {
        if let Err(err) = encode_frame(kind, entity, component, ts, payload, &mut self.bytes) {
            panic!("frame failed to encode: {err}");
        }
        self.frames += 1;
        self
    }

    pub fn put(self, entity: EntityKey, component: ComponentKey, ts: u32, value: &ComponentValue) -> Self {
        let payload = encode_value(value);
        self.frame(MessageKind::Put, entity, component, ts, &payload)
    }

    pub fn put_raw(self, entity: EntityKey, component: ComponentKey, ts: u32, payload: &[u8]) -> Self {
        self.frame(MessageKind::Put, entity, component, ts, payload)
    }

    pub fn append(self, entity: EntityKey, component: ComponentKey, ts: u32, payload: &[u8]) -> Self {
        self.frame(MessageKind::Append, entity, component, ts, payload)
    }

    pub fn delete(self, entity: EntityKey, component: ComponentKey, ts: u32) -> Self {
        self.frame(MessageKind::Delete, entity, component, ts, &[])
    }

    pub fn delete_entity(self, entity: EntityKey) -> Self {
        self.frame(MessageKind::DeleteEntity, entity, ComponentKey(0), 0, &[])
    }

    /// Append bytes verbatim, e.g. a hand-built malformed frame.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

/// Build a PUT message with a pooled copy of `value`'s encoding.
pub fn put_message(
    pools: &PoolRegistry,
    entity: EntityKey,
    component: ComponentKey,
    ts: u32,
    value: &ComponentValue,
) -> DeltaMessage {
    raw_put_message(pools, entity, component, ts, &encode_value(value))
}

pub fn raw_put_message(
    pools: &PoolRegistry,
    entity: EntityKey,
    component: ComponentKey,
    ts: u32,
    payload: &[u8],
) -> DeltaMessage {
    match Payload::copy_from(&pools.payloads, payload) {
        Ok(payload) => DeltaMessage::put(entity, component, ts, payload),
        Err(err) => panic!("payload pool exhausted in test: {err}"),
    }
}

pub fn encode_messages(messages: &[DeltaMessage]) -> Vec<u8> {
    let mut out = Vec::new();
    if let Err(err) = encode_batch(messages, &mut out) {
        panic!("batch failed to encode: {err}");
    }
    out
}

/// Decode `bytes`, panicking unless every frame is well formed.
pub fn decode_messages(pools: &PoolRegistry, bytes: &[u8]) -> Vec<DeltaMessage> {
    let mut out = Vec::new();
    match decode_batch(bytes, &mut out, &pools.payloads) {
        Ok(report) if report.is_clean() => out,
        Ok(report) => panic!("batch was not clean: {report:?}"),
        Err(err) => panic!("batch failed to decode: {err}"),
    }
}

// ===========================================================================
// Bridges
// ===========================================================================

/// A shared world plus the pools every bridge in a test uses.
pub struct Harness {
    pub config: BridgeConfig,
    pub pools: PoolRegistry,
    pub registry: Arc<ComponentRegistry>,
    pub world: Arc<WorldSync<SceneWorld>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        Self {
            pools: PoolRegistry::new(&config.pools),
            registry: standard_registry(),
            world: Arc::new(WorldSync::new(SceneWorld::new(), &config.sync)),
            config,
        }
    }

    pub fn bridge(&self, scene: u32) -> SceneBridge<SceneWorld> {
        SceneBridge::new(
            SceneId(scene),
            Arc::clone(&self.registry),
            self.pools.clone(),
            Arc::clone(&self.world),
            &self.config,
        )
    }

    /// Run `f` with the world locked.
    pub fn with_world<R>(&self, f: impl FnOnce(&mut SceneWorld) -> R) -> R {
        match self.world.scope(SceneId(u32::MAX)) {
            Ok(mut world) => f(&mut *world),
            Err(err) => panic!("test could not lock the world: {err}"),
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tracing
// ===========================================================================

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
