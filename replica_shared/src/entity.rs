//! Entity capability surfaces.
//!
//! - [`HostEntity`]: authoritative object owned by the host scheduler.
//! - [`ShadowEntity`]: peer-side mirror driven by the reconciler.
//! - [`EntityFactory`]: type tag -> shadow constructor.

use std::{any::Any, collections::HashMap};

use crate::codec::SyncState;

/// Authoritative entity registered with the host.
pub trait HostEntity: SyncState {
    /// Tag the peer uses to pick a shadow constructor.
    fn type_tag(&self) -> &str;

    /// Called once per broadcast, before the delta is taken.
    fn on_tick(&mut self) {}
}

/// Peer-side mirror of a host entity.
///
/// All callbacks run on the reconciler's tick context.
pub trait ShadowEntity: SyncState {
    /// Creation snapshot has been loaded.
    fn on_create(&mut self) {}

    /// A delta has been loaded. `latency_delta_secs` is how much later than
    /// usual its envelope arrived (negative when early).
    fn on_update(&mut self, _latency_delta_secs: f32) {}

    fn on_destroy(&mut self) {}

    /// Blend toward the last confirmed state; `blend` is in `0.0..=1.0`.
    fn interpolate(&mut self, blend: f32);

    /// Advance predicted state by `dt_secs`.
    fn extrapolate(&mut self, dt_secs: f32);

    fn as_any(&self) -> &dyn Any;
}

/// Constructor for one shadow type.
pub type ShadowCtor = Box<dyn Fn() -> Box<dyn ShadowEntity> + Send + Sync>;

/// Registry of shadow constructors keyed by type tag.
#[derive(Default)]
pub struct EntityFactory {
    ctors: HashMap<String, ShadowCtor>,
    fallback: Option<ShadowCtor>,
}

impl EntityFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor for `type_tag`, replacing any previous one.
    pub fn register<F>(&mut self, type_tag: impl Into<String>, ctor: F) -> &mut Self
    where
        F: Fn() -> Box<dyn ShadowEntity> + Send + Sync + 'static,
    {
        self.ctors.insert(type_tag.into(), Box::new(ctor));
        self
    }

    /// Registers `T::default()` for `type_tag`.
    pub fn register_default<T>(&mut self, type_tag: impl Into<String>) -> &mut Self
    where
        T: ShadowEntity + Default + 'static,
    {
        self.register(type_tag, || Box::new(T::default()))
    }

    /// Constructor used for tags nobody registered.
    pub fn set_fallback<F>(&mut self, ctor: F) -> &mut Self
    where
        F: Fn() -> Box<dyn ShadowEntity> + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(ctor));
        self
    }

    pub fn knows(&self, type_tag: &str) -> bool {
        self.ctors.contains_key(type_tag)
    }

    /// Instantiates `type_tag`, or the fallback, or nothing.
    pub fn create(&self, type_tag: &str) -> Option<Box<dyn ShadowEntity>> {
        self.ctors
            .get(type_tag)
            .or(self.fallback.as_ref())
            .map(|ctor| ctor())
    }
}
