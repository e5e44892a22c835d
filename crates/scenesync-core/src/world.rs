//! The host world contract and a slotmap-backed reference world.
//!
//! Staging buffers only touch the world through [`World`], and only while
//! the caller holds the [`WorldSync`](crate::sync::WorldSync) guard.

use crate::component::ComponentInstance;
use crate::id::{ComponentKey, EntityHandle, EntityKey};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::HashMap;

/// Mutations a staging buffer applies to the host world.
pub trait World {
    /// Materialise a new entity for the scene key `key`.
    fn create_entity(&mut self, key: EntityKey) -> EntityHandle;

    /// Destroy an entity immediately, releasing its components.
    fn destroy_entity(&mut self, handle: EntityHandle);

    /// Attach `instance`, returning the instance it replaced. A stale handle
    /// hands `instance` straight back.
    fn attach_component(
        &mut self,
        handle: EntityHandle,
        instance: ComponentInstance,
    ) -> Option<ComponentInstance>;

    fn detach_component(
        &mut self,
        handle: EntityHandle,
        component: ComponentKey,
    ) -> Option<ComponentInstance>;

    /// Tag an entity so the host removes it at its next sweep.
    fn mark_for_removal(&mut self, handle: EntityHandle);
}

// ---------------------------------------------------------------------------
// EntityMap
// ---------------------------------------------------------------------------

/// Scene entity keys to world handles. One per scene.
#[derive(Debug, Default)]
pub struct EntityMap {
    map: HashMap<EntityKey, EntityHandle>,
}

impl EntityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: EntityKey) -> Option<EntityHandle> {
        self.map.get(&key).copied()
    }

    pub fn insert(&mut self, key: EntityKey, handle: EntityHandle) {
        self.map.insert(key, handle);
    }

    pub fn remove(&mut self, key: EntityKey) -> Option<EntityHandle> {
        self.map.remove(&key)
    }

    /// Remove every key that deleting `deletion` covers, handing each
    /// handle to `f`. Returns how many were removed.
    pub fn remove_deleted_by(&mut self, deletion: EntityKey, mut f: impl FnMut(EntityHandle)) -> usize {
        let mut removed = 0;
        self.map.retain(|key, handle| {
            if key.is_deleted_by(deletion) {
                f(*handle);
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityKey, EntityHandle)> + '_ {
        self.map.iter().map(|(&key, &handle)| (key, handle))
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

// ---------------------------------------------------------------------------
// SceneWorld
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRecord {
    pub key: EntityKey,
    pub marked: bool,
}

/// Reference [`World`]: entities in a slotmap, components in a parallel
/// secondary map keyed by handle. Removal is tag-and-sweep.
#[derive(Debug, Default)]
pub struct SceneWorld {
    entities: SlotMap<EntityHandle, EntityRecord>,
    components: SecondaryMap<EntityHandle, HashMap<ComponentKey, ComponentInstance>>,
    marked: Vec<EntityHandle>,
}

impl SceneWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn contains(&self, handle: EntityHandle) -> bool {
        self.entities.contains_key(handle)
    }

    pub fn record(&self, handle: EntityHandle) -> Option<&EntityRecord> {
        self.entities.get(handle)
    }

    pub fn component(&self, handle: EntityHandle, key: ComponentKey) -> Option<&ComponentInstance> {
        self.components.get(handle)?.get(&key)
    }

    pub fn component_count(&self, handle: EntityHandle) -> usize {
        self.components.get(handle).map_or(0, HashMap::len)
    }

    /// Components attached across every entity.
    pub fn total_components(&self) -> usize {
        self.components.values().map(HashMap::len).sum()
    }

    pub fn is_marked(&self, handle: EntityHandle) -> bool {
        self.entities.get(handle).is_some_and(|record| record.marked)
    }

    pub fn marked_count(&self) -> usize {
        self.marked.len()
    }

    /// Destroy every tagged entity. Their components return to their pools.
    pub fn sweep(&mut self) -> usize {
        let marked = std::mem::take(&mut self.marked);
        let mut destroyed = 0;
        for handle in marked {
            if self.entities.contains_key(handle) {
                self.destroy_entity(handle);
                destroyed += 1;
            }
        }
        destroyed
    }
}

impl World for SceneWorld {
    fn create_entity(&mut self, key: EntityKey) -> EntityHandle {
        let handle = self.entities.insert(EntityRecord { key, marked: false });
        self.components.insert(handle, HashMap::new());
        handle
    }

    fn destroy_entity(&mut self, handle: EntityHandle) {
        self.entities.remove(handle);
        self.components.remove(handle);
    }

    fn attach_component(
        &mut self,
        handle: EntityHandle,
        instance: ComponentInstance,
    ) -> Option<ComponentInstance> {
        match self.components.get_mut(handle) {
            Some(components) => components.insert(instance.key, instance),
            None => Some(instance),
        }
    }

    fn detach_component(
        &mut self,
        handle: EntityHandle,
        component: ComponentKey,
    ) -> Option<ComponentInstance> {
        self.components.get_mut(handle)?.remove(&component)
    }

    fn mark_for_removal(&mut self, handle: EntityHandle) {
        if let Some(record) = self.entities.get_mut(handle) {
            if !record.marked {
                record.marked = true;
                self.marked.push(handle);
            }
        }
    }
}
