use crate::component::{ComponentCodec, ComponentKind};
use crate::id::ComponentKey;
use std::collections::HashMap;

/// A registered component: its key, a human-readable name and the kind
/// that selects its pool and codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentBridge {
    pub key: ComponentKey,
    pub name: String,
    pub kind: ComponentKind,
}

impl ComponentBridge {
    pub fn codec(&self) -> &'static ComponentCodec {
        self.kind.codec()
    }
}

/// Builder for constructing an immutable [`ComponentRegistry`].
/// Two-phase lifecycle: registration -> finalization.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    components: Vec<ComponentBridge>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase 1: Register a component under `key`.
    pub fn register(&mut self, key: ComponentKey, name: &str, kind: ComponentKind) -> &mut Self {
        self.components.push(ComponentBridge {
            key,
            name: name.to_string(),
            kind,
        });
        self
    }

    /// Phase 2: Finalize and build the immutable registry.
    pub fn build(self) -> Result<ComponentRegistry, RegistryError> {
        let mut by_key = HashMap::with_capacity(self.components.len());
        let mut name_to_key = HashMap::with_capacity(self.components.len());

        for bridge in self.components {
            if by_key.contains_key(&bridge.key) {
                return Err(RegistryError::DuplicateKey(bridge.key));
            }
            if name_to_key.contains_key(&bridge.name) {
                return Err(RegistryError::DuplicateName(bridge.name));
            }
            name_to_key.insert(bridge.name.clone(), bridge.key);
            by_key.insert(bridge.key, bridge);
        }

        Ok(ComponentRegistry { by_key, name_to_key })
    }
}

/// Immutable component registry. Frozen after build(). Thread-safe to share.
///
/// Lookups are O(1) and have no side effects.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_key: HashMap<ComponentKey, ComponentBridge>,
    name_to_key: HashMap<String, ComponentKey>,
}

impl ComponentRegistry {
    pub fn get(&self, key: ComponentKey) -> Option<&ComponentBridge> {
        self.by_key.get(&key)
    }

    pub fn contains(&self, key: ComponentKey) -> bool {
        self.by_key.contains_key(&key)
    }

    pub fn key_of(&self, name: &str) -> Option<ComponentKey> {
        self.name_to_key.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentBridge> {
        self.by_key.values()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("component key {0} registered twice")]
    DuplicateKey(ComponentKey),
    #[error("component name '{0}' registered twice")]
    DuplicateName(String),
}
