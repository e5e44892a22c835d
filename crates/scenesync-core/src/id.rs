use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a materialised entity in the host world.
    pub struct EntityHandle;
}

/// Identifies a logical entity within one scene's namespace.
///
/// The low 16 bits carry the entity number, the high 16 bits its version.
/// Scenes reuse numbers after deleting an entity by bumping the version.
/// Keys are not unique across scenes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey(pub u32);

impl EntityKey {
    const NUMBER_MASK: u32 = 0xFFFF;
    const VERSION_SHIFT: u32 = 16;

    pub fn new(number: u16, version: u16) -> Self {
        Self(u32::from(number) | (u32::from(version) << Self::VERSION_SHIFT))
    }

    pub fn number(self) -> u16 {
        (self.0 & Self::NUMBER_MASK) as u16
    }

    pub fn version(self) -> u16 {
        (self.0 >> Self::VERSION_SHIFT) as u16
    }

    /// Returns `true` if deleting `deletion` also deletes this key: same
    /// number, same or older version.
    pub fn is_deleted_by(self, deletion: EntityKey) -> bool {
        self.number() == deletion.number() && self.version() <= deletion.version()
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.number(), self.version())
    }
}

/// Identifies a component type in the host registry. Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentKey(pub u32);

impl std::fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies a scene for logging and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SceneId(pub u32);

/// Entity numbers owned by the host that scenes may not materialise.
pub mod reserved {
    pub const ROOT_ENTITY: u16 = 0;
    pub const PLAYER_ENTITY: u16 = 1;
    pub const CAMERA_ENTITY: u16 = 2;

    /// Returns `true` for numbers the host reserves for itself.
    pub fn is_reserved(number: u16) -> bool {
        number == PLAYER_ENTITY || number == CAMERA_ENTITY
    }
}
