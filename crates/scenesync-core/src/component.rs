//! Host-side component values and their codecs.
//!
//! Component storage is a small set of tagged variants. Each
//! [`ComponentKind`] selects a [`ComponentCodec`] function table by index;
//! there is no trait-object dispatch on the decode path.

use crate::id::ComponentKey;
use crate::pool::Pooled;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Component value types
// ---------------------------------------------------------------------------

/// Spatial placement of an entity relative to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
    /// Entity number of the parent; 0 is the scene root.
    pub parent: u32,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [1.0; 3],
            parent: 0,
        }
    }
}

/// Whether an entity is rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visibility {
    pub visible: bool,
    pub propagate_to_children: bool,
}

impl Default for Visibility {
    fn default() -> Self {
        Self {
            visible: true,
            propagate_to_children: false,
        }
    }
}

/// A text label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Text {
    pub value: String,
    pub font_size: f32,
}

/// A deserialized component instance.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentValue {
    Transform(Transform),
    Visibility(Visibility),
    Text(Text),
    /// Opaque bytes the host forwards without interpreting.
    Blob(Vec<u8>),
}

impl ComponentValue {
    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentValue::Transform(_) => ComponentKind::Transform,
            ComponentValue::Visibility(_) => ComponentKind::Visibility,
            ComponentValue::Text(_) => ComponentKind::Text,
            ComponentValue::Blob(_) => ComponentKind::Blob,
        }
    }

    /// Restore the default value of the same kind, keeping allocations.
    pub fn reset(&mut self) {
        match self {
            ComponentValue::Transform(t) => *t = Transform::default(),
            ComponentValue::Visibility(v) => *v = Visibility::default(),
            ComponentValue::Text(t) => {
                t.value.clear();
                t.font_size = 0.0;
            }
            ComponentValue::Blob(bytes) => bytes.clear(),
        }
    }

    /// Serialize into wire payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        (self.kind().codec().encode)(self, &mut out)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Component kinds and codecs
// ---------------------------------------------------------------------------

/// Discriminant tag for component values, used to select pools and codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Transform,
    Visibility,
    Text,
    Blob,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 4] = [
        ComponentKind::Transform,
        ComponentKind::Visibility,
        ComponentKind::Text,
        ComponentKind::Blob,
    ];

    /// Convert to usize index for table lookups.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn codec(self) -> &'static ComponentCodec {
        &CODECS[self.index()]
    }

    pub fn default_value(self) -> ComponentValue {
        match self {
            ComponentKind::Transform => ComponentValue::Transform(Transform::default()),
            ComponentKind::Visibility => ComponentValue::Visibility(Visibility::default()),
            ComponentKind::Text => ComponentValue::Text(Text::default()),
            ComponentKind::Blob => ComponentValue::Blob(Vec::new()),
        }
    }

    pub fn pool_name(self) -> &'static str {
        match self {
            ComponentKind::Transform => "components.transform",
            ComponentKind::Visibility => "components.visibility",
            ComponentKind::Text => "components.text",
            ComponentKind::Blob => "components.blob",
        }
    }
}

/// Errors raised while converting between payload bytes and component values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to decode {kind:?} payload: {detail}")]
    Decode { kind: ComponentKind, detail: String },
    #[error("failed to encode {kind:?} value: {detail}")]
    Encode { kind: ComponentKind, detail: String },
    #[error("expected a {expected:?} value, found {found:?}")]
    KindMismatch {
        expected: ComponentKind,
        found: ComponentKind,
    },
}

/// Function table for one component kind.
pub struct ComponentCodec {
    /// Overwrite `target` with the value decoded from `payload`.
    pub decode_into: fn(&mut ComponentValue, &[u8]) -> Result<(), CodecError>,
    /// Append the serialized form of `value` to `out`.
    pub encode: fn(&ComponentValue, &mut Vec<u8>) -> Result<(), CodecError>,
}

static CODECS: [ComponentCodec; 4] = [
    ComponentCodec {
        decode_into: decode_transform,
        encode: encode_structured,
    },
    ComponentCodec {
        decode_into: decode_visibility,
        encode: encode_structured,
    },
    ComponentCodec {
        decode_into: decode_text,
        encode: encode_structured,
    },
    ComponentCodec {
        decode_into: decode_blob,
        encode: encode_blob,
    },
];

fn decode_error(kind: ComponentKind, err: bitcode::Error) -> CodecError {
    CodecError::Decode {
        kind,
        detail: err.to_string(),
    }
}

fn decode_transform(target: &mut ComponentValue, payload: &[u8]) -> Result<(), CodecError> {
    let decoded: Transform = bitcode::deserialize(payload)
        .map_err(|e| decode_error(ComponentKind::Transform, e))?;
    match target {
        ComponentValue::Transform(t) => *t = decoded,
        other => *other = ComponentValue::Transform(decoded),
    }
    Ok(())
}

fn decode_visibility(target: &mut ComponentValue, payload: &[u8]) -> Result<(), CodecError> {
    let decoded: Visibility = bitcode::deserialize(payload)
        .map_err(|e| decode_error(ComponentKind::Visibility, e))?;
    match target {
        ComponentValue::Visibility(v) => *v = decoded,
        other => *other = ComponentValue::Visibility(decoded),
    }
    Ok(())
}

fn decode_text(target: &mut ComponentValue, payload: &[u8]) -> Result<(), CodecError> {
    let decoded: Text =
        bitcode::deserialize(payload).map_err(|e| decode_error(ComponentKind::Text, e))?;
    match target {
        ComponentValue::Text(t) => {
            // Reuse the pooled string's capacity.
            t.value.clear();
            t.value.push_str(&decoded.value);
            t.font_size = decoded.font_size;
        }
        other => *other = ComponentValue::Text(decoded),
    }
    Ok(())
}

fn decode_blob(target: &mut ComponentValue, payload: &[u8]) -> Result<(), CodecError> {
    match target {
        ComponentValue::Blob(bytes) => {
            bytes.clear();
            bytes.extend_from_slice(payload);
        }
        other => *other = ComponentValue::Blob(payload.to_vec()),
    }
    Ok(())
}

fn encode_structured(value: &ComponentValue, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let kind = value.kind();
    let bytes = match value {
        ComponentValue::Transform(t) => bitcode::serialize(t),
        ComponentValue::Visibility(v) => bitcode::serialize(v),
        ComponentValue::Text(t) => bitcode::serialize(t),
        ComponentValue::Blob(_) => {
            return Err(CodecError::KindMismatch {
                expected: ComponentKind::Transform,
                found: kind,
            });
        }
    }
    .map_err(|e| CodecError::Encode {
        kind,
        detail: e.to_string(),
    })?;
    out.extend_from_slice(&bytes);
    Ok(())
}

fn encode_blob(value: &ComponentValue, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match value {
        ComponentValue::Blob(bytes) => {
            out.extend_from_slice(bytes);
            Ok(())
        }
        other => Err(CodecError::KindMismatch {
            expected: ComponentKind::Blob,
            found: other.kind(),
        }),
    }
}

// ---------------------------------------------------------------------------
// ComponentInstance
// ---------------------------------------------------------------------------

/// A pooled component value bound to its registry key. Dropping the instance
/// returns the value to its kind's pool.
#[derive(Debug)]
pub struct ComponentInstance {
    pub key: ComponentKey,
    pub value: Pooled<ComponentValue>,
}

impl ComponentInstance {
    pub fn kind(&self) -> ComponentKind {
        self.value.kind()
    }
}
