//! Peer reconciler.
//!
//! Two contexts touch a reconciler:
//! - delivery: [`PeerReconciler::on_envelope_received`], from any number of
//!   network tasks, possibly with envelopes out of order. It only ever writes
//!   the per-id pending slot.
//! - simulation: [`PeerReconciler::tick`], once per local frame. It alone
//!   instantiates, mutates and destroys shadow entities.
//!
//! Per id there is at most one pending event. Newer events supersede older
//! unapplied ones, except that a `Delta` landing on a pending `Create` rides
//! along with it so both apply in the same tick. A `Destroy` supersedes
//! anything.
//!
//! Between updates a live shadow interpolates with blend
//! `elapsed / observed_interval`; once a full interval passes without news it
//! snaps to the target (blend 1.0) and then dead-reckons by `dt` each frame.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Context;
use bytes::Bytes;
use replica_shared::{
    clock::Clock,
    codec::StateCodec,
    config::ReplicationConfig,
    entity::{EntityFactory, ShadowEntity},
    latency::LatencyEstimator,
    tick::TickFilter,
    wire::{EntityEvent, EntityId, Envelope},
};
use tracing::{debug, trace, warn};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Where an id stands on this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    /// `Create` queued, entity not instantiated yet.
    Pending,
    /// Entity instantiated and receiving deltas.
    Live,
}

/// Timing bookkeeping of a live shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowTiming {
    pub last_update: Duration,
    pub observed_interval: Duration,
    /// When the shadow ran out of fresh data and started extrapolating.
    pub extrapolating_since: Option<Duration>,
}

/// Counters of routine drops and failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub envelopes: u64,
    pub undecodable: u64,
    pub stale_deltas: u64,
    pub unknown_ids: u64,
    pub duplicate_creates: u64,
    pub superseded: u64,
    pub unknown_types: u64,
    pub codec_failures: u64,
}

enum Pending {
    Create {
        type_tag: String,
        snapshot: Bytes,
        delta: Option<Bytes>,
    },
    Delta(Bytes),
    Destroy,
}

struct Slot {
    pending: Option<Pending>,
    /// Latency delta of the batch that delivered `pending`.
    latency: f64,
}

/// Delivery-side state, guarded by one lock.
struct Inbound {
    ticks: TickFilter,
    latency: LatencyEstimator,
    slots: BTreeMap<EntityId, Slot>,
    stats: ReconcilerStats,
}

impl Inbound {
    fn queue(&mut self, record: EntityEvent, fresh: bool, latency: f64) {
        match record {
            EntityEvent::Create {
                id,
                type_tag,
                payload,
            } => {
                if self.slots.contains_key(&id) {
                    self.stats.duplicate_creates += 1;
                    trace!(%id, "duplicate create ignored");
                    return;
                }
                self.slots.insert(
                    id,
                    Slot {
                        pending: Some(Pending::Create {
                            type_tag,
                            snapshot: payload,
                            delta: None,
                        }),
                        latency,
                    },
                );
            }
            EntityEvent::Delta { id, payload } => {
                if !fresh {
                    self.stats.stale_deltas += 1;
                    return;
                }
                let Some(slot) = self.slots.get_mut(&id) else {
                    self.stats.unknown_ids += 1;
                    trace!(%id, "delta for unknown id dropped");
                    return;
                };
                let superseded = match slot.pending.take() {
                    Some(Pending::Create {
                        type_tag,
                        snapshot,
                        delta,
                    }) => {
                        slot.pending = Some(Pending::Create {
                            type_tag,
                            snapshot,
                            delta: Some(payload),
                        });
                        delta.is_some()
                    }
                    Some(Pending::Destroy) => {
                        slot.pending = Some(Pending::Destroy);
                        trace!(%id, "delta after destroy dropped");
                        return;
                    }
                    Some(Pending::Delta(_)) => {
                        slot.pending = Some(Pending::Delta(payload));
                        true
                    }
                    None => {
                        slot.pending = Some(Pending::Delta(payload));
                        false
                    }
                };
                slot.latency = latency;
                if superseded {
                    self.stats.superseded += 1;
                }
            }
            EntityEvent::Destroy { id } => {
                let Some(slot) = self.slots.get_mut(&id) else {
                    self.stats.unknown_ids += 1;
                    trace!(%id, "destroy for unknown id dropped");
                    return;
                };
                if slot.pending.replace(Pending::Destroy).is_some() {
                    self.stats.superseded += 1;
                }
            }
        }
    }

    /// Empties every pending slot. Slots whose event is a `Destroy` are
    /// removed with it, retiring the id.
    fn take_pending(&mut self) -> Vec<(EntityId, Pending, f64)> {
        let mut taken = Vec::new();
        let mut retired = Vec::new();
        for (id, slot) in self.slots.iter_mut() {
            if let Some(event) = slot.pending.take() {
                if matches!(event, Pending::Destroy) {
                    retired.push(*id);
                }
                taken.push((*id, event, slot.latency));
            }
        }
        for id in retired {
            self.slots.remove(&id);
        }
        taken
    }
}

struct Shadow {
    entity: Box<dyn ShadowEntity>,
    last_update: Duration,
    observed_interval: Duration,
    extrapolating_since: Option<Duration>,
}

impl Shadow {
    fn advance(&mut self, now: Duration, dt: f32) {
        let elapsed = now.saturating_sub(self.last_update);
        if elapsed < self.observed_interval {
            let blend = elapsed.as_nanos() as f64 / self.observed_interval.as_nanos() as f64;
            self.entity.interpolate(blend as f32);
        } else if self.extrapolating_since.is_none() {
            self.entity.interpolate(1.0);
            self.extrapolating_since = Some(now);
        } else {
            self.entity.extrapolate(dt);
        }
    }

    fn timing(&self) -> ShadowTiming {
        ShadowTiming {
            last_update: self.last_update,
            observed_interval: self.observed_interval,
            extrapolating_since: self.extrapolating_since,
        }
    }
}

/// Simulation-side state.
#[derive(Default)]
struct Shadows {
    live: BTreeMap<EntityId, Shadow>,
    unknown_types: u64,
    codec_failures: u64,
}

/// Applies inbound envelopes to shadow entities and keeps them moving
/// smoothly between updates.
pub struct PeerReconciler<C: StateCodec> {
    codec: C,
    factory: EntityFactory,
    clock: Arc<dyn Clock>,
    inbound: Mutex<Inbound>,
    shadows: Mutex<Shadows>,
}

impl<C: StateCodec> PeerReconciler<C> {
    pub fn new(
        codec: C,
        factory: EntityFactory,
        cfg: &ReplicationConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            codec,
            factory,
            clock,
            inbound: Mutex::new(Inbound {
                ticks: TickFilter::new(cfg.tick_wrap_window),
                latency: LatencyEstimator::new(cfg.latency_window),
                slots: BTreeMap::new(),
                stats: ReconcilerStats::default(),
            }),
            shadows: Mutex::new(Shadows::default()),
        }
    }

    /// Decodes raw transport bytes and queues the envelope.
    pub fn on_data(&self, reliable: bool, bytes: Bytes) -> anyhow::Result<()> {
        match Envelope::decode(bytes, reliable).context("decode envelope") {
            Ok(envelope) => {
                self.on_envelope_received(envelope);
                Ok(())
            }
            Err(e) => {
                lock(&self.inbound).stats.undecodable += 1;
                Err(e)
            }
        }
    }

    /// Queues the records of one envelope. Safe to call from any thread,
    /// concurrently with [`tick`](Self::tick).
    pub fn on_envelope_received(&self, envelope: Envelope) {
        let now = self.clock.now();
        let mut inbound = lock(&self.inbound);
        let latency = inbound.latency.on_arrival(now);
        let fresh = inbound.ticks.observe(envelope.tick);
        inbound.stats.envelopes += 1;
        if !fresh {
            trace!(
                tick = envelope.tick,
                last_seen = ?inbound.ticks.last_seen(),
                "stale envelope, deltas dropped"
            );
        }
        for record in envelope.records {
            inbound.queue(record, fresh, latency);
        }
    }

    /// Runs one local frame: applies pending events, then interpolates or
    /// extrapolates every live shadow that no event updated this frame.
    pub fn tick(&self, dt: f32) {
        let now = self.clock.now();
        let events = lock(&self.inbound).take_pending();

        let mut shadows = lock(&self.shadows);
        let mut touched = BTreeSet::new();
        let mut rejected = Vec::new();
        for (id, event, latency) in events {
            match event {
                Pending::Create {
                    type_tag,
                    snapshot,
                    delta,
                } => {
                    if !self.instantiate(&mut shadows, id, &type_tag, &snapshot, now) {
                        rejected.push(id);
                        continue;
                    }
                    touched.insert(id);
                    if let Some(payload) = delta {
                        self.apply_delta(&mut shadows, id, &payload, latency, now);
                    }
                }
                Pending::Delta(payload) => {
                    if self.apply_delta(&mut shadows, id, &payload, latency, now) {
                        touched.insert(id);
                    }
                }
                Pending::Destroy => {
                    if let Some(mut shadow) = shadows.live.remove(&id) {
                        shadow.entity.on_destroy();
                        debug!(%id, "shadow destroyed");
                    }
                }
            }
        }

        for (id, shadow) in shadows.live.iter_mut() {
            if !touched.contains(id) {
                shadow.advance(now, dt);
            }
        }
        drop(shadows);

        if !rejected.is_empty() {
            let mut inbound = lock(&self.inbound);
            for id in rejected {
                inbound.slots.remove(&id);
            }
        }
    }

    fn instantiate(
        &self,
        shadows: &mut Shadows,
        id: EntityId,
        type_tag: &str,
        snapshot: &Bytes,
        now: Duration,
    ) -> bool {
        let Some(mut entity) = self.factory.create(type_tag) else {
            shadows.unknown_types += 1;
            warn!(%id, type_tag, "unknown type tag, create dropped");
            return false;
        };
        if let Err(e) = self.codec.decode_snapshot(&mut *entity, snapshot) {
            shadows.codec_failures += 1;
            warn!(%id, type_tag, error = %e, "snapshot decode failed, create dropped");
            return false;
        }
        entity.on_create();
        shadows.live.insert(
            id,
            Shadow {
                entity,
                last_update: now,
                observed_interval: Duration::ZERO,
                extrapolating_since: None,
            },
        );
        debug!(%id, type_tag, "shadow created");
        true
    }

    fn apply_delta(
        &self,
        shadows: &mut Shadows,
        id: EntityId,
        payload: &Bytes,
        latency: f64,
        now: Duration,
    ) -> bool {
        let Some(shadow) = shadows.live.get_mut(&id) else {
            return false;
        };
        if let Err(e) = self.codec.decode_delta(&mut *shadow.entity, payload) {
            shadows.codec_failures += 1;
            warn!(%id, error = %e, "delta decode failed, update skipped");
            return false;
        }
        shadow.entity.on_update(latency as f32);
        shadow.observed_interval = now.saturating_sub(shadow.last_update);
        shadow.last_update = now;
        shadow.extrapolating_since = None;
        true
    }

    /// Ids known to this peer, pending or live.
    pub fn len(&self) -> usize {
        lock(&self.inbound).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shadow_state(&self, id: EntityId) -> Option<ShadowState> {
        if lock(&self.shadows).live.contains_key(&id) {
            return Some(ShadowState::Live);
        }
        lock(&self.inbound)
            .slots
            .contains_key(&id)
            .then_some(ShadowState::Pending)
    }

    /// Ids of instantiated shadows, ascending.
    pub fn shadow_ids(&self) -> Vec<EntityId> {
        lock(&self.shadows).live.keys().copied().collect()
    }

    /// Runs `f` against a live shadow.
    pub fn with_shadow<R>(&self, id: EntityId, f: impl FnOnce(&dyn ShadowEntity) -> R) -> Option<R> {
        lock(&self.shadows)
            .live
            .get(&id)
            .map(|shadow| f(&*shadow.entity))
    }

    pub fn shadow_timing(&self, id: EntityId) -> Option<ShadowTiming> {
        lock(&self.shadows).live.get(&id).map(Shadow::timing)
    }

    /// Most recent accepted envelope tick.
    pub fn last_seen_tick(&self) -> Option<u32> {
        lock(&self.inbound).ticks.last_seen()
    }

    /// Latency delta of the most recent envelope, in seconds.
    pub fn latency_delta(&self) -> f64 {
        lock(&self.inbound).latency.latest()
    }

    pub fn stats(&self) -> ReconcilerStats {
        let mut stats = lock(&self.inbound).stats;
        let shadows = lock(&self.shadows);
        stats.unknown_types = shadows.unknown_types;
        stats.codec_failures = shadows.codec_failures;
        stats
    }
}
