//! Two scenes sharing one host world.
//!
//! Each scene runs on its own thread with its own bridge and submits five
//! ticks of deltas. Identical entity keys from the two scenes become
//! separate world entities. The host writes a label back to the first scene,
//! which arrives in that scene's reply.
//!
//! Run with: `cargo run -p scenesync-core --example two_scenes`

use scenesync_core::component::{ComponentKind, ComponentValue, Text, Transform, Visibility};
use scenesync_core::id::*;
use scenesync_core::message::{decode_batch, encode_batch, DeltaMessage, Payload};
use scenesync_core::pool::PoolRegistry;
use scenesync_core::registry::RegistryBuilder;
use scenesync_core::sync::WorldSync;
use scenesync_core::world::SceneWorld;
use scenesync_core::{BridgeConfig, SceneBridge};
use std::sync::Arc;
use std::thread;

const TRANSFORM: ComponentKey = ComponentKey(1);
const VISIBILITY: ComponentKey = ComponentKey(2);
const TEXT: ComponentKey = ComponentKey(3);

/// One tick of a scene: a moving cube and a blinking light.
fn scene_tick(pools: &PoolRegistry, scene: u32, tick: u32) -> Vec<u8> {
    let cube = EntityKey::new(512, 0);
    let light = EntityKey::new(513, 0);
    let values = [
        (
            cube,
            TRANSFORM,
            ComponentValue::Transform(Transform {
                position: [scene as f32, tick as f32, 0.0],
                ..Transform::default()
            }),
        ),
        (
            light,
            VISIBILITY,
            ComponentValue::Visibility(Visibility {
                visible: tick % 2 == 0,
                propagate_to_children: false,
            }),
        ),
    ];

    let mut messages = Vec::new();
    for (entity, component, value) in values {
        let bytes = value.encode().expect("built-in values encode");
        let payload = Payload::copy_from(&pools.payloads, &bytes).expect("payload pool has no ceiling");
        messages.push(DeltaMessage::put(entity, component, tick, payload));
    }

    let mut out = Vec::new();
    encode_batch(&messages, &mut out).expect("frames fit in u32");
    out
}

fn main() {
    // --- Step 1: Shared host state ---

    let config = BridgeConfig::default();
    let mut builder = RegistryBuilder::new();
    builder
        .register(TRANSFORM, "transform", ComponentKind::Transform)
        .register(VISIBILITY, "visibility", ComponentKind::Visibility)
        .register(TEXT, "text", ComponentKind::Text);
    let registry = Arc::new(builder.build().expect("keys are unique"));
    let pools = PoolRegistry::new(&config.pools);
    let world = Arc::new(WorldSync::new(SceneWorld::new(), &config.sync));

    // --- Step 2: One bridge per scene, each on its own thread ---

    let handles: Vec<_> = (1..=2u32)
        .map(|scene| {
            let registry = Arc::clone(&registry);
            let pools = pools.clone();
            let world = Arc::clone(&world);
            let config = config.clone();
            thread::spawn(move || {
                let mut bridge =
                    SceneBridge::new(SceneId(scene), registry, pools.clone(), world, &config);

                if scene == 1 {
                    let label = ComponentValue::Text(Text {
                        value: "hello from the host".to_string(),
                        font_size: 14.0,
                    });
                    bridge
                        .host_writer()
                        .put(EntityKey::new(512, 0), TEXT, &label)
                        .expect("text is registered");
                }

                for tick in 1..=5 {
                    let batch = scene_tick(&pools, scene, tick);
                    let reply = bridge.submit(&batch).expect("submit succeeds");
                    if !reply.is_empty() {
                        let mut messages = Vec::new();
                        decode_batch(reply, &mut messages, &pools.payloads).expect("reply decodes");
                        for message in &messages {
                            println!(
                                "scene {scene} tick {tick}: host sent {:?} for {} (ts {})",
                                message.kind, message.entity, message.timestamp
                            );
                        }
                    }
                }

                let stats = bridge.stats();
                println!(
                    "scene {scene}: {} batches, {} entities created, {} components attached",
                    stats.batches, stats.entities_created, stats.components_attached
                );
                bridge
            })
        })
        .collect();

    let bridges: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("scene thread panicked"))
        .collect();

    // --- Step 3: Inspect the shared world ---

    {
        let world = world.scope(SceneId(0)).expect("world is free");
        println!("world holds {} entities", world.entity_count());
        for bridge in &bridges {
            if let Some(handle) = bridge.entities().get(EntityKey::new(512, 0)) {
                let transform = world.component(handle, TRANSFORM).map(|c| (*c.value).clone());
                println!("scene {} cube: {:?}", bridge.scene().0, transform);
            }
        }
    }

    // --- Step 4: Tear down ---

    drop(bridges);
    let swept = world.scope(SceneId(0)).expect("world is free").sweep();
    println!("swept {swept} entities, {} pool rentals outstanding", pools.outstanding());
}
