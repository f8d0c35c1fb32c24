//! Wire records.
//!
//! An [`Envelope`] is one transport message: the host's broadcast tick plus
//! any number of independent [`EntityEvent`]s. Layout (big-endian):
//!
//! ```text
//! tick:u32  count:varint  record*
//! record := kind:u8 id:i32 [tag:string] [len:varint payload:bytes]
//! kind   := 1 Create (tag + payload) | 2 Delta (payload) | 3 Destroy
//! string := len:varint utf8
//! ```
//!
//! Varints are unsigned LEB128. Whether an envelope is reliable is a property
//! of the channel it travels on, not of the bytes.

use std::fmt;

use anyhow::{bail, ensure, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Session-unique entity id, assigned once by the host and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Record discriminant as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Create = 1,
    Delta = 2,
    Destroy = 3,
}

impl EventKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(EventKind::Create),
            2 => Some(EventKind::Delta),
            3 => Some(EventKind::Destroy),
            _ => None,
        }
    }
}

/// Lifecycle/state event for one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    /// Instantiate `type_tag` and load the creation snapshot.
    Create {
        id: EntityId,
        type_tag: String,
        payload: Bytes,
    },
    /// Delta-field update.
    Delta { id: EntityId, payload: Bytes },
    /// Remove the entity; the id is retired.
    Destroy { id: EntityId },
}

impl EntityEvent {
    pub fn id(&self) -> EntityId {
        match self {
            EntityEvent::Create { id, .. }
            | EntityEvent::Delta { id, .. }
            | EntityEvent::Destroy { id } => *id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            EntityEvent::Create { .. } => EventKind::Create,
            EntityEvent::Delta { .. } => EventKind::Delta,
            EntityEvent::Destroy { .. } => EventKind::Destroy,
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind() as u8);
        buf.put_i32(self.id().0 as i32);
        match self {
            EntityEvent::Create {
                type_tag, payload, ..
            } => {
                put_string(buf, type_tag);
                put_bytes(buf, payload);
            }
            EntityEvent::Delta { payload, .. } => put_bytes(buf, payload),
            EntityEvent::Destroy { .. } => {}
        }
    }

    fn decode_from(buf: &mut Bytes) -> anyhow::Result<Self> {
        ensure!(buf.remaining() >= 5, "truncated record header");
        let raw_kind = buf.get_u8();
        let kind = EventKind::from_u8(raw_kind)
            .with_context(|| format!("unknown record kind {raw_kind}"))?;
        let id = EntityId(buf.get_i32() as u32);
        Ok(match kind {
            EventKind::Create => {
                let type_tag = get_string(buf).context("create type tag")?;
                let payload = get_bytes(buf).context("create payload")?;
                EntityEvent::Create {
                    id,
                    type_tag,
                    payload,
                }
            }
            EventKind::Delta => EntityEvent::Delta {
                id,
                payload: get_bytes(buf).context("delta payload")?,
            },
            EventKind::Destroy => EntityEvent::Destroy { id },
        })
    }
}

/// One broadcast: a host tick and the records produced for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub tick: u32,
    pub records: Vec<EntityEvent>,
    /// Creation/destruction envelopes must arrive; delta envelopes may not.
    pub reliable: bool,
}

impl Envelope {
    pub fn reliable(tick: u32, records: Vec<EntityEvent>) -> Self {
        Self {
            tick,
            records,
            reliable: true,
        }
    }

    pub fn unreliable(tick: u32, records: Vec<EntityEvent>) -> Self {
        Self {
            tick,
            records,
            reliable: false,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.records.len() * 16);
        buf.put_u32(self.tick);
        put_varint(&mut buf, self.records.len() as u64);
        for record in &self.records {
            record.encode_into(&mut buf);
        }
        buf.freeze()
    }

    /// Decodes an envelope received on a channel with the given reliability.
    pub fn decode(mut buf: Bytes, reliable: bool) -> anyhow::Result<Self> {
        ensure!(buf.remaining() >= 4, "truncated envelope header");
        let tick = buf.get_u32();
        let count = get_varint(&mut buf).context("record count")?;
        // Smallest record (Destroy) is 5 bytes.
        ensure!(
            count <= (buf.remaining() / 5) as u64,
            "record count {count} exceeds envelope size"
        );
        let mut records = Vec::with_capacity(count as usize);
        for i in 0..count {
            records.push(EntityEvent::decode_from(&mut buf).with_context(|| format!("record {i}"))?);
        }
        ensure!(
            !buf.has_remaining(),
            "{} trailing bytes after envelope",
            buf.remaining()
        );
        Ok(Self {
            tick,
            records,
            reliable,
        })
    }
}

/// Appends an unsigned LEB128 varint.
pub fn put_varint(buf: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Reads an unsigned LEB128 varint of at most 10 bytes.
pub fn get_varint<B: Buf>(buf: &mut B) -> anyhow::Result<u64> {
    let mut value = 0u64;
    for i in 0..10 {
        ensure!(buf.has_remaining(), "truncated varint");
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    bail!("varint longer than 10 bytes")
}

pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    put_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

pub fn get_bytes(buf: &mut Bytes) -> anyhow::Result<Bytes> {
    let len = get_varint(buf)?;
    ensure!(
        len <= buf.remaining() as u64,
        "length {len} exceeds remaining {}",
        buf.remaining()
    );
    Ok(buf.split_to(len as usize))
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn get_string(buf: &mut Bytes) -> anyhow::Result<String> {
    let raw = get_bytes(buf)?;
    String::from_utf8(raw.to_vec()).context("invalid utf-8")
}
