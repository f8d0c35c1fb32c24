//! State codec.
//!
//! Entity types declare their replicated fields statically as a table of
//! [`FieldSpec`]s. Each field carries [`FieldFlags`] saying whether it goes
//! into the creation snapshot, into every delta, and whether the receiver
//! should smooth it rather than snap to it.
//!
//! [`StateCodec`] turns the flagged subset of an entity's fields into an
//! opaque payload and back. [`FieldCodec`] is the stock implementation:
//! fields are written in declaration order, each in its kind's binary form,
//! with no per-field tags.

use anyhow::{ensure, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    math::Vec3,
    wire::{get_string, put_string},
};

bitflags::bitflags! {
    /// Which payloads a field participates in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FieldFlags: u8 {
        const SNAPSHOT = 1 << 0;
        const DELTA = 1 << 1;
        const SMOOTH = 1 << 2;

        /// Sent only at creation.
        const INIT = Self::SNAPSHOT.bits();
        /// Sent at creation and on every update.
        const SYNC = Self::SNAPSHOT.bits() | Self::DELTA.bits();
        /// Like `SYNC`, blended on the receiver.
        const SMOOTHED = Self::SYNC.bits() | Self::SMOOTH.bits();
    }
}

/// Binary shape of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    U32,
    I32,
    F32,
    Vec3,
    Str,
}

/// A field value in transit between an entity and a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    U32(u32),
    I32(i32),
    F32(f32),
    Vec3(Vec3),
    Str(String),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::U32(_) => FieldKind::U32,
            FieldValue::I32(_) => FieldKind::I32,
            FieldValue::F32(_) => FieldKind::F32,
            FieldValue::Vec3(_) => FieldKind::Vec3,
            FieldValue::Str(_) => FieldKind::Str,
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        match self {
            FieldValue::Bool(v) => buf.put_u8(u8::from(*v)),
            FieldValue::U32(v) => buf.put_u32(*v),
            FieldValue::I32(v) => buf.put_i32(*v),
            FieldValue::F32(v) => buf.put_f32(*v),
            FieldValue::Vec3(v) => {
                buf.put_f32(v.x);
                buf.put_f32(v.y);
                buf.put_f32(v.z);
            }
            FieldValue::Str(v) => put_string(buf, v),
        }
    }

    fn read(kind: FieldKind, buf: &mut Bytes) -> anyhow::Result<Self> {
        let fixed = match kind {
            FieldKind::Bool => 1,
            FieldKind::U32 | FieldKind::I32 | FieldKind::F32 => 4,
            FieldKind::Vec3 => 12,
            FieldKind::Str => 0,
        };
        ensure!(buf.remaining() >= fixed, "truncated {kind:?} field");
        Ok(match kind {
            FieldKind::Bool => match buf.get_u8() {
                0 => FieldValue::Bool(false),
                1 => FieldValue::Bool(true),
                other => anyhow::bail!("invalid bool byte {other}"),
            },
            FieldKind::U32 => FieldValue::U32(buf.get_u32()),
            FieldKind::I32 => FieldValue::I32(buf.get_i32()),
            FieldKind::F32 => FieldValue::F32(buf.get_f32()),
            FieldKind::Vec3 => {
                FieldValue::Vec3(Vec3::new(buf.get_f32(), buf.get_f32(), buf.get_f32()))
            }
            FieldKind::Str => FieldValue::Str(get_string(buf)?),
        })
    }
}

/// Static description of one replicated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub flags: FieldFlags,
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind, flags: FieldFlags) -> Self {
        Self { name, kind, flags }
    }

    pub fn is_smoothed(&self) -> bool {
        self.flags.contains(FieldFlags::SMOOTH)
    }
}

/// Field-level access to an entity's replicated state.
///
/// `field`/`set_field` are indexed by position in `fields()`. The codec only
/// ever passes `set_field` a value whose kind matches the declared spec.
pub trait SyncState: Send {
    fn fields(&self) -> &'static [FieldSpec];
    fn field(&self, index: usize) -> FieldValue;
    fn set_field(&mut self, index: usize, value: FieldValue);
}

/// Turns an entity's flagged fields into payload bytes and back.
pub trait StateCodec: Send + Sync {
    fn encode_snapshot<S: SyncState + ?Sized>(&self, state: &S) -> Bytes;
    fn encode_delta<S: SyncState + ?Sized>(&self, state: &S) -> Bytes;
    /// On error `state` is left untouched.
    fn decode_snapshot<S: SyncState + ?Sized>(&self, state: &mut S, payload: &Bytes)
        -> anyhow::Result<()>;
    /// On error `state` is left untouched.
    fn decode_delta<S: SyncState + ?Sized>(&self, state: &mut S, payload: &Bytes)
        -> anyhow::Result<()>;
}

/// Declaration-order binary codec over [`SyncState`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldCodec;

impl FieldCodec {
    fn encode<S: SyncState + ?Sized>(state: &S, mask: FieldFlags) -> Bytes {
        let mut buf = BytesMut::new();
        for (index, spec) in state.fields().iter().enumerate() {
            if spec.flags.intersects(mask) {
                let value = state.field(index);
                debug_assert_eq!(value.kind(), spec.kind, "field {}", spec.name);
                value.write(&mut buf);
            }
        }
        buf.freeze()
    }

    fn decode<S: SyncState + ?Sized>(
        state: &mut S,
        payload: &Bytes,
        mask: FieldFlags,
    ) -> anyhow::Result<()> {
        let mut buf = payload.clone();
        let mut parsed = Vec::new();
        for (index, spec) in state.fields().iter().enumerate() {
            if spec.flags.intersects(mask) {
                let value = FieldValue::read(spec.kind, &mut buf)
                    .with_context(|| format!("field `{}`", spec.name))?;
                parsed.push((index, value));
            }
        }
        ensure!(
            !buf.has_remaining(),
            "{} trailing payload bytes",
            buf.remaining()
        );
        for (index, value) in parsed {
            state.set_field(index, value);
        }
        Ok(())
    }
}

impl StateCodec for FieldCodec {
    fn encode_snapshot<S: SyncState + ?Sized>(&self, state: &S) -> Bytes {
        Self::encode(state, FieldFlags::SNAPSHOT)
    }

    fn encode_delta<S: SyncState + ?Sized>(&self, state: &S) -> Bytes {
        Self::encode(state, FieldFlags::DELTA)
    }

    fn decode_snapshot<S: SyncState + ?Sized>(
        &self,
        state: &mut S,
        payload: &Bytes,
    ) -> anyhow::Result<()> {
        Self::decode(state, payload, FieldFlags::SNAPSHOT)
    }

    fn decode_delta<S: SyncState + ?Sized>(
        &self,
        state: &mut S,
        payload: &Bytes,
    ) -> anyhow::Result<()> {
        Self::decode(state, payload, FieldFlags::DELTA)
    }
}
