//! Demo entity: a point moving at constant velocity inside a box.
//!
//! `label` is creation-only, `position` is synced and smoothed, `velocity` is
//! synced raw so the shadow can dead-reckon with it.

use std::any::Any;

use crate::{
    codec::{FieldFlags, FieldKind, FieldSpec, FieldValue, SyncState},
    entity::{EntityFactory, HostEntity, ShadowEntity},
    math::Vec3,
};

pub const MOVER_TAG: &str = "mover";

const LABEL: usize = 0;
const POSITION: usize = 1;
const VELOCITY: usize = 2;

const MOVER_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("label", FieldKind::Str, FieldFlags::INIT),
    FieldSpec::new("position", FieldKind::Vec3, FieldFlags::SMOOTHED),
    FieldSpec::new("velocity", FieldKind::Vec3, FieldFlags::SYNC),
];

/// Authoritative mover.
#[derive(Debug, Clone)]
pub struct Mover {
    pub label: String,
    pub position: Vec3,
    pub velocity: Vec3,
    /// Seconds simulated per broadcast.
    pub step_secs: f32,
    /// Half-extent of the box the mover bounces in.
    pub bounds: f32,
}

impl Mover {
    pub fn new(label: impl Into<String>, position: Vec3, velocity: Vec3, step_secs: f32) -> Self {
        Self {
            label: label.into(),
            position,
            velocity,
            step_secs,
            bounds: 100.0,
        }
    }
}

fn bounce(pos: &mut f32, vel: &mut f32, bounds: f32) {
    if pos.abs() > bounds {
        *pos = pos.clamp(-bounds, bounds);
        *vel = -*vel;
    }
}

impl SyncState for Mover {
    fn fields(&self) -> &'static [FieldSpec] {
        MOVER_FIELDS
    }

    fn field(&self, index: usize) -> FieldValue {
        match index {
            LABEL => FieldValue::Str(self.label.clone()),
            POSITION => FieldValue::Vec3(self.position),
            _ => FieldValue::Vec3(self.velocity),
        }
    }

    fn set_field(&mut self, index: usize, value: FieldValue) {
        match (index, value) {
            (LABEL, FieldValue::Str(v)) => self.label = v,
            (POSITION, FieldValue::Vec3(v)) => self.position = v,
            (VELOCITY, FieldValue::Vec3(v)) => self.velocity = v,
            _ => {}
        }
    }
}

impl HostEntity for Mover {
    fn type_tag(&self) -> &str {
        MOVER_TAG
    }

    fn on_tick(&mut self) {
        self.position += self.velocity * self.step_secs;
        bounce(&mut self.position.x, &mut self.velocity.x, self.bounds);
        bounce(&mut self.position.y, &mut self.velocity.y, self.bounds);
        bounce(&mut self.position.z, &mut self.velocity.z, self.bounds);
    }
}

/// Peer-side mover.
///
/// `position` is what gets displayed. Received positions land in `target`;
/// interpolation walks from where the shadow was when the update landed
/// (`from`) toward it.
#[derive(Debug, Clone, Default)]
pub struct ShadowMover {
    pub label: String,
    pub position: Vec3,
    pub velocity: Vec3,
    pub target: Vec3,
    from: Vec3,
    pub destroyed: bool,
}

impl ShadowMover {
    pub fn register(factory: &mut EntityFactory) {
        factory.register_default::<ShadowMover>(MOVER_TAG);
    }
}

impl SyncState for ShadowMover {
    fn fields(&self) -> &'static [FieldSpec] {
        MOVER_FIELDS
    }

    fn field(&self, index: usize) -> FieldValue {
        match index {
            LABEL => FieldValue::Str(self.label.clone()),
            POSITION => FieldValue::Vec3(self.target),
            _ => FieldValue::Vec3(self.velocity),
        }
    }

    fn set_field(&mut self, index: usize, value: FieldValue) {
        match (index, value) {
            (LABEL, FieldValue::Str(v)) => self.label = v,
            (POSITION, FieldValue::Vec3(v)) => self.target = v,
            (VELOCITY, FieldValue::Vec3(v)) => self.velocity = v,
            _ => {}
        }
    }
}

/// Displayed value of a field at `blend`: smoothed fields walk from `from`,
/// the rest snap straight to `to`.
fn blended(spec: &FieldSpec, from: Vec3, to: Vec3, blend: f32) -> Vec3 {
    if spec.is_smoothed() {
        from.lerp(to, blend)
    } else {
        to
    }
}

impl ShadowEntity for ShadowMover {
    fn on_create(&mut self) {
        self.position = self.target;
        self.from = self.target;
    }

    fn on_update(&mut self, latency_delta_secs: f32) {
        self.from = self.position;
        // A late envelope describes where the host was; lead the target.
        if latency_delta_secs > 0.0 {
            self.target += self.velocity * latency_delta_secs;
        }
    }

    fn on_destroy(&mut self) {
        self.destroyed = true;
    }

    fn interpolate(&mut self, blend: f32) {
        self.position = blended(&MOVER_FIELDS[POSITION], self.from, self.target, blend);
    }

    fn extrapolate(&mut self, dt_secs: f32) {
        self.position += self.velocity * dt_secs;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FieldCodec, StateCodec};

    #[test]
    fn host_mover_advances_and_bounces() {
        let mut m = Mover::new("m", Vec3::new(98.0, 0.0, 0.0), Vec3::new(20.0, 0.0, 0.0), 0.1);
        m.on_tick();
        assert_eq!(m.position.x, 100.0);
        assert_eq!(m.velocity.x, 20.0);
        m.on_tick();
        assert_eq!(m.position.x, 100.0);
        assert_eq!(m.velocity.x, -20.0);
    }

    #[test]
    fn shadow_follows_snapshot_then_blends() {
        let host = Mover::new("m", Vec3::new(1.0, 0.0, 0.0), Vec3::new(10.0, 0.0, 0.0), 0.1);
        let mut shadow = ShadowMover::default();
        FieldCodec
            .decode_snapshot(&mut shadow, &FieldCodec.encode_snapshot(&host))
            .unwrap();
        shadow.on_create();
        assert_eq!(shadow.label, "m");
        assert_eq!(shadow.position, Vec3::new(1.0, 0.0, 0.0));

        let mut host = host;
        host.on_tick();
        FieldCodec
            .decode_delta(&mut shadow, &FieldCodec.encode_delta(&host))
            .unwrap();
        shadow.on_update(0.0);
        assert_eq!(shadow.position, Vec3::new(1.0, 0.0, 0.0));

        shadow.interpolate(0.5);
        assert_eq!(shadow.position, Vec3::new(1.5, 0.0, 0.0));
        shadow.interpolate(1.0);
        assert_eq!(shadow.position, Vec3::new(2.0, 0.0, 0.0));
        shadow.extrapolate(0.5);
        assert_eq!(shadow.position, Vec3::new(7.0, 0.0, 0.0));
    }

    #[test]
    fn only_smoothed_fields_blend() {
        let from = Vec3::ZERO;
        let to = Vec3::new(4.0, 0.0, 0.0);
        assert_eq!(
            blended(&MOVER_FIELDS[POSITION], from, to, 0.25),
            Vec3::new(1.0, 0.0, 0.0)
        );
        assert_eq!(blended(&MOVER_FIELDS[VELOCITY], from, to, 0.25), to);
    }

    #[test]
    fn late_update_leads_target() {
        let mut shadow = ShadowMover {
            velocity: Vec3::new(2.0, 0.0, 0.0),
            ..ShadowMover::default()
        };
        shadow.on_update(0.5);
        assert_eq!(shadow.target, Vec3::new(1.0, 0.0, 0.0));
        shadow.on_update(-0.5);
        assert_eq!(shadow.target, Vec3::new(1.0, 0.0, 0.0));
    }
}
