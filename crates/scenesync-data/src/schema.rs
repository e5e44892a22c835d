//! Serde data file structs for bridge manifests.
//!
//! A manifest lists the components a host exposes to scenes. It is
//! deserialized from RON, JSON, or TOML and then resolved into a
//! `ComponentRegistry` by the loader.

use scenesync_core::component::ComponentKind;
use serde::Deserialize;

// ===========================================================================
// Components
// ===========================================================================

/// One registered component in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ComponentData {
    /// Wire key scenes use for this component.
    pub key: u32,
    pub name: String,
    /// Storage kind: `transform`, `visibility`, `text` or `blob`.
    pub kind: ComponentKind,
}

/// TOML wrapper: `[[components]]` tables.
#[derive(Debug, Clone, Deserialize)]
pub struct TomlComponents {
    pub components: Vec<ComponentData>,
}
