//! Delta messages and their wire framing.
//!
//! Every frame is little-endian and length-prefixed:
//!
//! ```text
//! frame      := length:u32 kind:u32 body        (length counts the whole frame)
//! PUT/APPEND := entity:u32 component:u32 timestamp:u32 payload_len:u32 payload
//! DELETE     := entity:u32 component:u32 timestamp:u32
//! DELETE_ENT := entity:u32
//! ```
//!
//! Inbound batches, outbound batches and snapshots share this layout.
//! Decoding never panics: unknown kinds are skipped by their length, frames
//! too short for their kind are skipped, and a frame longer than the
//! remaining input ends the batch.

use crate::id::{ComponentKey, EntityKey};
use crate::pool::{BytePool, PoolError, Pooled};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// Frame header: `length` + `kind`.
pub const HEADER_LEN: usize = 8;
/// Fixed part of a PUT/APPEND body.
const PUT_FIXED_LEN: usize = 16;
const DELETE_BODY_LEN: usize = 12;
const DELETE_ENTITY_BODY_LEN: usize = 4;

/// What a delta message does to its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Inert frame. Recognised but carries no change.
    None,
    Put,
    Delete,
    DeleteEntity,
    /// Grow-only component value.
    Append,
}

impl MessageKind {
    pub fn code(self) -> u32 {
        match self {
            MessageKind::None => 0,
            MessageKind::Put => 1,
            MessageKind::Delete => 2,
            MessageKind::DeleteEntity => 3,
            MessageKind::Append => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(MessageKind::None),
            1 => Some(MessageKind::Put),
            2 => Some(MessageKind::Delete),
            3 => Some(MessageKind::DeleteEntity),
            4 => Some(MessageKind::Append),
            _ => None,
        }
    }

    /// Whether frames of this kind carry a payload.
    pub fn has_payload(self) -> bool {
        matches!(self, MessageKind::Put | MessageKind::Append)
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Message payload bytes rented from a [`BytePool`]. An empty payload holds
/// no rental. The buffer goes back to its pool when the payload is dropped.
#[derive(Debug, Default)]
pub struct Payload(Option<Pooled<Vec<u8>>>);

impl Payload {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn from_pooled(buffer: Pooled<Vec<u8>>) -> Self {
        Self(Some(buffer))
    }

    /// Copy `bytes` into a fresh rental. Empty input rents nothing.
    pub fn copy_from(pool: &BytePool, bytes: &[u8]) -> Result<Self, PoolError> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }
        Ok(Self(Some(pool.rent_copy(bytes)?)))
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.0 {
            Some(buffer) => buffer.as_slice(),
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    /// Independent copy backed by its own rental.
    pub fn duplicate(&self, pool: &BytePool) -> Result<Self, PoolError> {
        Self::copy_from(pool, self.as_slice())
    }

    /// Overwrite the contents with `bytes`, reusing the current rental.
    pub fn assign(&mut self, pool: &BytePool, bytes: &[u8]) -> Result<(), PoolError> {
        if let (Some(buffer), false) = (self.0.as_mut(), bytes.is_empty()) {
            buffer.clear();
            buffer.extend_from_slice(bytes);
            return Ok(());
        }
        *self = Self::copy_from(pool, bytes)?;
        Ok(())
    }

    /// Release the rental now, leaving an empty payload.
    pub fn release(&mut self) {
        self.0 = None;
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Payload {}

// ---------------------------------------------------------------------------
// DeltaMessage
// ---------------------------------------------------------------------------

/// One state change for one (entity, component) key.
#[derive(Debug, PartialEq, Eq)]
pub struct DeltaMessage {
    pub kind: MessageKind,
    pub entity: EntityKey,
    pub component: ComponentKey,
    pub timestamp: u32,
    pub payload: Payload,
}

impl DeltaMessage {
    pub fn put(entity: EntityKey, component: ComponentKey, timestamp: u32, payload: Payload) -> Self {
        Self {
            kind: MessageKind::Put,
            entity,
            component,
            timestamp,
            payload,
        }
    }

    pub fn append(
        entity: EntityKey,
        component: ComponentKey,
        timestamp: u32,
        payload: Payload,
    ) -> Self {
        Self {
            kind: MessageKind::Append,
            entity,
            component,
            timestamp,
            payload,
        }
    }

    pub fn delete(entity: EntityKey, component: ComponentKey, timestamp: u32) -> Self {
        Self {
            kind: MessageKind::Delete,
            entity,
            component,
            timestamp,
            payload: Payload::empty(),
        }
    }

    pub fn delete_entity(entity: EntityKey) -> Self {
        Self {
            kind: MessageKind::DeleteEntity,
            entity,
            component: ComponentKey(0),
            timestamp: 0,
            payload: Payload::empty(),
        }
    }

    /// Copy of this message whose payload is a separate rental.
    pub fn duplicate(&self, pool: &BytePool) -> Result<Self, PoolError> {
        Ok(Self {
            kind: self.kind,
            entity: self.entity,
            component: self.component,
            timestamp: self.timestamp,
            payload: self.payload.duplicate(pool)?,
        })
    }

    /// Serialized size of this message.
    pub fn encoded_len(&self) -> usize {
        encoded_len(self.kind, self.payload.len())
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Errors raised by the wire codec.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("payload of {len} bytes does not fit a frame")]
    PayloadTooLarge { len: usize },
    #[error("failed to write frame: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Exact serialized size of a frame of `kind` carrying `payload_len` bytes.
pub fn encoded_len(kind: MessageKind, payload_len: usize) -> usize {
    match kind {
        MessageKind::Put | MessageKind::Append => HEADER_LEN + PUT_FIXED_LEN + payload_len,
        MessageKind::Delete => HEADER_LEN + DELETE_BODY_LEN,
        MessageKind::DeleteEntity => HEADER_LEN + DELETE_ENTITY_BODY_LEN,
        MessageKind::None => HEADER_LEN,
    }
}

/// Append the frame for `message` to `out`.
pub fn encode_message(message: &DeltaMessage, out: &mut Vec<u8>) -> Result<(), WireError> {
    encode_frame(
        message.kind,
        message.entity,
        message.component,
        message.timestamp,
        message.payload.as_slice(),
        out,
    )
}

/// Append one frame built from its parts to `out`.
pub fn encode_frame(
    kind: MessageKind,
    entity: EntityKey,
    component: ComponentKey,
    timestamp: u32,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), WireError> {
    let len = encoded_len(kind, payload.len());
    let frame_len =
        u32::try_from(len).map_err(|_| WireError::PayloadTooLarge { len: payload.len() })?;

    out.reserve(len);
    out.write_u32::<LittleEndian>(frame_len)?;
    out.write_u32::<LittleEndian>(kind.code())?;
    match kind {
        MessageKind::Put | MessageKind::Append => {
            out.write_u32::<LittleEndian>(entity.0)?;
            out.write_u32::<LittleEndian>(component.0)?;
            out.write_u32::<LittleEndian>(timestamp)?;
            out.write_u32::<LittleEndian>(payload.len() as u32)?;
            out.extend_from_slice(payload);
        }
        MessageKind::Delete => {
            out.write_u32::<LittleEndian>(entity.0)?;
            out.write_u32::<LittleEndian>(component.0)?;
            out.write_u32::<LittleEndian>(timestamp)?;
        }
        MessageKind::DeleteEntity => {
            out.write_u32::<LittleEndian>(entity.0)?;
        }
        MessageKind::None => {}
    }
    Ok(())
}

/// Encode every message in order.
pub fn encode_batch<'a>(
    messages: impl IntoIterator<Item = &'a DeltaMessage>,
    out: &mut Vec<u8>,
) -> Result<(), WireError> {
    for message in messages {
        encode_message(message, out)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Summary of one `decode_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeReport {
    /// Messages pushed to the output list.
    pub decoded: usize,
    /// Frames with an unrecognised kind code.
    pub unknown_kind: usize,
    /// Inert frames.
    pub inert: usize,
    /// Frames whose body was too short for their kind.
    pub malformed: usize,
    /// Trailing bytes that did not form a complete frame.
    pub truncated_bytes: usize,
}

impl DecodeReport {
    pub fn is_clean(&self) -> bool {
        self.unknown_kind == 0 && self.malformed == 0 && self.truncated_bytes == 0
    }
}

enum FrameError {
    Short,
    Pool(PoolError),
}

impl From<std::io::Error> for FrameError {
    fn from(_: std::io::Error) -> Self {
        FrameError::Short
    }
}

impl From<PoolError> for FrameError {
    fn from(err: PoolError) -> Self {
        FrameError::Pool(err)
    }
}

/// Decode every frame in `bytes`, pushing messages onto `out`. Payloads are
/// copied into rentals from `payloads`.
///
/// Only pool exhaustion is an error; malformed input is reported and skipped.
pub fn decode_batch(
    bytes: &[u8],
    out: &mut Vec<DeltaMessage>,
    payloads: &BytePool,
) -> Result<DecodeReport, WireError> {
    let mut report = DecodeReport::default();
    let mut offset = 0;

    while bytes.len() - offset >= HEADER_LEN {
        let mut header = &bytes[offset..offset + HEADER_LEN];
        let length = header.read_u32::<LittleEndian>()? as usize;
        let code = header.read_u32::<LittleEndian>()?;
        let remaining = bytes.len() - offset;

        if length < HEADER_LEN || length > remaining {
            warn!(offset, length, remaining, "frame length out of bounds, dropping rest of batch");
            report.truncated_bytes = remaining;
            return Ok(report);
        }

        let body = &bytes[offset + HEADER_LEN..offset + length];
        offset += length;

        let Some(kind) = MessageKind::from_code(code) else {
            warn!(code, length, "skipping frame with unknown kind");
            report.unknown_kind += 1;
            continue;
        };

        match decode_body(kind, body, payloads) {
            Ok(Some(message)) => {
                out.push(message);
                report.decoded += 1;
            }
            Ok(None) => report.inert += 1,
            Err(FrameError::Short) => {
                warn!(?kind, body_len = body.len(), "skipping frame with short body");
                report.malformed += 1;
            }
            Err(FrameError::Pool(err)) => return Err(err.into()),
        }
    }

    report.truncated_bytes += bytes.len() - offset;
    if report.truncated_bytes > 0 {
        warn!(trailing = report.truncated_bytes, "batch ends with a partial frame header");
    }
    Ok(report)
}

fn decode_body(
    kind: MessageKind,
    mut body: &[u8],
    payloads: &BytePool,
) -> Result<Option<DeltaMessage>, FrameError> {
    let message = match kind {
        MessageKind::Put | MessageKind::Append => {
            let entity = EntityKey(body.read_u32::<LittleEndian>()?);
            let component = ComponentKey(body.read_u32::<LittleEndian>()?);
            let timestamp = body.read_u32::<LittleEndian>()?;
            let payload_len = body.read_u32::<LittleEndian>()? as usize;
            if payload_len > body.len() {
                return Err(FrameError::Short);
            }
            let payload = Payload::copy_from(payloads, &body[..payload_len])?;
            DeltaMessage {
                kind,
                entity,
                component,
                timestamp,
                payload,
            }
        }
        MessageKind::Delete => {
            let entity = EntityKey(body.read_u32::<LittleEndian>()?);
            let component = ComponentKey(body.read_u32::<LittleEndian>()?);
            let timestamp = body.read_u32::<LittleEndian>()?;
            DeltaMessage::delete(entity, component, timestamp)
        }
        MessageKind::DeleteEntity => {
            DeltaMessage::delete_entity(EntityKey(body.read_u32::<LittleEndian>()?))
        }
        MessageKind::None => return Ok(None),
    };
    Ok(Some(message))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::byte_pool;

    fn pool() -> BytePool {
        byte_pool("test.payloads", 16, None)
    }

    fn put(pool: &BytePool, entity: u32, component: u32, ts: u32, bytes: &[u8]) -> DeltaMessage {
        DeltaMessage::put(
            EntityKey(entity),
            ComponentKey(component),
            ts,
            Payload::copy_from(pool, bytes).unwrap(),
        )
    }

    #[test]
    fn put_frame_layout() {
        let pool = pool();
        let mut out = Vec::new();
        encode_message(&put(&pool, 512, 1, 7, &[0xAA, 0xBB]), &mut out).unwrap();

        assert_eq!(out.len(), 26);
        assert_eq!(&out[0..4], &26u32.to_le_bytes());
        assert_eq!(&out[4..8], &1u32.to_le_bytes());
        assert_eq!(&out[8..12], &512u32.to_le_bytes());
        assert_eq!(&out[12..16], &1u32.to_le_bytes());
        assert_eq!(&out[16..20], &7u32.to_le_bytes());
        assert_eq!(&out[20..24], &2u32.to_le_bytes());
        assert_eq!(&out[24..], &[0xAA, 0xBB]);
    }

    #[test]
    fn encoded_len_matches_output() {
        let pool = pool();
        let messages = [
            put(&pool, 1, 2, 3, b"hello"),
            DeltaMessage::delete(EntityKey(1), ComponentKey(2), 4),
            DeltaMessage::delete_entity(EntityKey(9)),
        ];
        for message in &messages {
            let mut out = Vec::new();
            encode_message(message, &mut out).unwrap();
            assert_eq!(out.len(), message.encoded_len());
        }
        assert_eq!(encoded_len(MessageKind::Delete, 0), 20);
        assert_eq!(encoded_len(MessageKind::DeleteEntity, 0), 12);
    }

    #[test]
    fn decode_reads_every_kind() {
        let pool = pool();
        let source = vec![
            put(&pool, 512, 1, 1, b"abc"),
            DeltaMessage::delete(EntityKey(512), ComponentKey(1), 2),
            DeltaMessage::append(
                EntityKey(513),
                ComponentKey(3),
                5,
                Payload::copy_from(&pool, b"z").unwrap(),
            ),
            DeltaMessage::delete_entity(EntityKey(513)),
        ];
        let mut bytes = Vec::new();
        encode_batch(&source, &mut bytes).unwrap();

        let mut decoded = Vec::new();
        let report = decode_batch(&bytes, &mut decoded, &pool).unwrap();
        assert_eq!(report.decoded, 4);
        assert!(report.is_clean());
        assert_eq!(decoded, source);
    }

    #[test]
    fn unknown_kind_is_skipped_by_length() {
        let pool = pool();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&12u32.to_le_bytes());
        bytes.extend_from_slice(&99u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        encode_message(&DeltaMessage::delete_entity(EntityKey(5)), &mut bytes).unwrap();

        let mut decoded = Vec::new();
        let report = decode_batch(&bytes, &mut decoded, &pool).unwrap();
        assert_eq!(report.unknown_kind, 1);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].kind, MessageKind::DeleteEntity);
    }

    #[test]
    fn oversized_length_stops_decoding() {
        let pool = pool();
        let mut bytes = Vec::new();
        encode_message(&DeltaMessage::delete_entity(EntityKey(5)), &mut bytes).unwrap();
        bytes.extend_from_slice(&1000u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());

        let mut decoded = Vec::new();
        let report = decode_batch(&bytes, &mut decoded, &pool).unwrap();
        assert_eq!(report.decoded, 1);
        assert_eq!(report.truncated_bytes, 8);
    }

    #[test]
    fn short_body_is_malformed_not_fatal() {
        let pool = pool();
        let mut bytes = Vec::new();
        // DELETE frame with only 4 body bytes.
        bytes.extend_from_slice(&12u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&7u32.to_le_bytes());
        encode_message(&DeltaMessage::delete_entity(EntityKey(5)), &mut bytes).unwrap();

        let mut decoded = Vec::new();
        let report = decode_batch(&bytes, &mut decoded, &pool).unwrap();
        assert_eq!(report.malformed, 1);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn payload_len_beyond_frame_is_malformed() {
        let pool = pool();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&26u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&500u32.to_le_bytes());
        bytes.extend_from_slice(&[0, 0]);

        let mut decoded = Vec::new();
        let report = decode_batch(&bytes, &mut decoded, &pool).unwrap();
        assert_eq!(report.malformed, 1);
        assert!(decoded.is_empty());
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn trailing_partial_header_is_reported() {
        let pool = pool();
        let mut decoded = Vec::new();
        let report = decode_batch(&[1, 2, 3], &mut decoded, &pool).unwrap();
        assert_eq!(report.truncated_bytes, 3);
        assert!(decoded.is_empty());
    }

    #[test]
    fn inert_frames_are_counted() {
        let pool = pool();
        let mut bytes = Vec::new();
        encode_message(
            &DeltaMessage {
                kind: MessageKind::None,
                entity: EntityKey(0),
                component: ComponentKey(0),
                timestamp: 0,
                payload: Payload::empty(),
            },
            &mut bytes,
        )
        .unwrap();
        let mut decoded = Vec::new();
        let report = decode_batch(&bytes, &mut decoded, &pool).unwrap();
        assert_eq!(report.inert, 1);
        assert!(decoded.is_empty());
    }

    #[test]
    fn decode_propagates_pool_exhaustion() {
        let pool = byte_pool("tiny", 1, Some(1));
        let mut bytes = Vec::new();
        let source = byte_pool("source", 4, None);
        encode_message(&put(&source, 1, 1, 1, b"a"), &mut bytes).unwrap();
        encode_message(&put(&source, 2, 1, 1, b"b"), &mut bytes).unwrap();

        let mut decoded = Vec::new();
        let err = decode_batch(&bytes, &mut decoded, &pool).unwrap_err();
        assert!(matches!(err, WireError::Pool(PoolError::Exhausted { .. })));
    }

    #[test]
    fn payload_released_on_drop() {
        let pool = pool();
        let message = put(&pool, 1, 1, 1, b"data");
        let copy = message.duplicate(&pool).unwrap();
        assert_eq!(pool.stats().outstanding(), 2);
        assert_eq!(copy, message);
        drop(message);
        drop(copy);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn empty_payload_rents_nothing() {
        let pool = pool();
        let payload = Payload::copy_from(&pool, &[]).unwrap();
        assert!(payload.is_empty());
        assert_eq!(pool.stats().rented, 0);
    }
}
