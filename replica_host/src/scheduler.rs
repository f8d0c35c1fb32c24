//! Host scheduler.
//!
//! Owns the authoritative entity registry and decides what goes on the wire:
//! - `add_entity`: next id, reliable single-record `Create` envelope.
//! - `remove_entity`: reliable single-record `Destroy` envelope.
//! - `tick`: every `update_period` seconds, one unreliable envelope with a
//!   `Delta` per live entity under a fresh tick number.
//! - `on_peer_connected`: reliable `Create` for every live entity, to that
//!   peer only.
//!
//! Sends go straight to the transport, or through a [`DeliveryQueue`] when
//! network emulation is configured. Envelopes are dispatched while the
//! registry lock is held so no peer can see a `Destroy` before the `Create`
//! it cancels.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use replica_shared::{
    clock::Clock,
    codec::StateCodec,
    config::ReplicationConfig,
    entity::HostEntity,
    transport::{PeerId, Transport},
    wire::{EntityEvent, EntityId, Envelope},
};
use tracing::{debug, trace, warn};

use crate::delivery::{DeliveryQueue, Outbound, Target};

type Registry = BTreeMap<EntityId, Box<dyn HostEntity>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Authoritative registry plus snapshot production.
pub struct HostScheduler<T: Transport, C: StateCodec> {
    transport: T,
    codec: C,
    clock: Arc<dyn Clock>,
    update_period: f32,

    next_id: AtomicU32,
    tick: AtomicU32,
    accumulator: Mutex<f32>,
    registry: Mutex<Registry>,
    delivery: Option<Mutex<DeliveryQueue>>,
}

impl<T: Transport, C: StateCodec> HostScheduler<T, C> {
    pub fn new(transport: T, codec: C, cfg: &ReplicationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            codec,
            clock,
            update_period: cfg.update_period_secs,
            next_id: AtomicU32::new(0),
            tick: AtomicU32::new(0),
            accumulator: Mutex::new(0.0),
            registry: Mutex::new(BTreeMap::new()),
            delivery: cfg
                .emulation
                .clone()
                .map(|emu| Mutex::new(DeliveryQueue::new(emu))),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Tick number of the most recent delta broadcast.
    pub fn current_tick(&self) -> u32 {
        self.tick.load(Ordering::SeqCst)
    }

    pub fn entity_count(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        lock(&self.registry).keys().copied().collect()
    }

    /// Runs `f` against a live entity.
    pub fn with_entity<R>(
        &self,
        id: EntityId,
        f: impl FnOnce(&mut dyn HostEntity) -> R,
    ) -> Option<R> {
        let mut registry = lock(&self.registry);
        registry.get_mut(&id).map(|e| f(&mut **e))
    }

    /// Envelopes waiting in the emulation queue.
    pub fn pending_deliveries(&self) -> usize {
        self.delivery.as_ref().map_or(0, |q| lock(q).len())
    }

    /// Unreliable envelopes discarded by emulated loss so far.
    pub fn dropped_deliveries(&self) -> u64 {
        self.delivery.as_ref().map_or(0, |q| lock(q).dropped())
    }

    /// Registers `entity`, assigns it the next id and announces it.
    pub fn add_entity(&self, entity: Box<dyn HostEntity>) -> EntityId {
        let mut registry = lock(&self.registry);
        let id = EntityId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let record = self.create_record(id, &*entity);
        registry.insert(id, entity);
        debug!(%id, live = registry.len(), "entity added");

        let env = Envelope::reliable(self.current_tick(), vec![record]);
        self.dispatch(Target::All, &env);
        id
    }

    /// Unregisters `id` and announces its destruction. Returns the entity if
    /// it was live.
    pub fn remove_entity(&self, id: EntityId) -> Option<Box<dyn HostEntity>> {
        let mut registry = lock(&self.registry);
        let entity = registry.remove(&id)?;
        debug!(%id, live = registry.len(), "entity removed");

        let env = Envelope::reliable(self.current_tick(), vec![EntityEvent::Destroy { id }]);
        self.dispatch(Target::All, &env);
        Some(entity)
    }

    /// Sends a newly connected peer a `Create` for every live entity.
    pub fn on_peer_connected(&self, peer: PeerId) {
        let registry = lock(&self.registry);
        let records = registry
            .iter()
            .map(|(id, entity)| self.create_record(*id, &**entity))
            .collect::<Vec<_>>();
        debug!(peer = ?peer, entities = records.len(), "sending initial snapshot");

        let env = Envelope::reliable(self.current_tick(), records);
        self.dispatch(Target::Peer(peer), &env);
    }

    /// Advances host time by `dt` seconds: broadcasts deltas when an update
    /// period has elapsed, then releases due emulated envelopes.
    pub fn tick(&self, dt: f32) {
        let broadcast_due = {
            let mut acc = lock(&self.accumulator);
            *acc += dt;
            if *acc >= self.update_period {
                *acc = 0.0;
                true
            } else {
                false
            }
        };
        if broadcast_due {
            self.broadcast_deltas();
        }
        self.flush();
    }

    fn broadcast_deltas(&self) {
        let mut registry = lock(&self.registry);
        let tick = self.tick.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let records = registry
            .iter_mut()
            .map(|(id, entity)| {
                entity.on_tick();
                EntityEvent::Delta {
                    id: *id,
                    payload: self.codec.encode_delta(&**entity),
                }
            })
            .collect::<Vec<_>>();
        trace!(tick, records = records.len(), "delta broadcast");

        let env = Envelope::unreliable(tick, records);
        self.dispatch(Target::All, &env);
    }

    /// Sends every emulated envelope whose release time has passed.
    pub fn flush(&self) {
        let Some(queue) = &self.delivery else {
            return;
        };
        let due = lock(queue).due(self.clock.now());
        for out in due {
            self.send_now(out);
        }
    }

    fn create_record(&self, id: EntityId, entity: &dyn HostEntity) -> EntityEvent {
        EntityEvent::Create {
            id,
            type_tag: entity.type_tag().to_string(),
            payload: self.codec.encode_snapshot(entity),
        }
    }

    fn dispatch(&self, target: Target, env: &Envelope) {
        let out = Outbound {
            target,
            reliable: env.reliable,
            bytes: env.encode(),
        };
        match &self.delivery {
            Some(queue) => lock(queue).schedule(self.clock.now(), out),
            None => self.send_now(out),
        }
    }

    fn send_now(&self, out: Outbound) {
        match out.target {
            Target::All => {
                self.transport.broadcast(out.reliable, out.bytes);
            }
            Target::Peer(peer) => {
                if let Err(e) = self.transport.send(peer, out.reliable, out.bytes) {
                    warn!(peer = ?peer, reliable = out.reliable, error = %e, "send failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_shared::{
        clock::ManualClock,
        codec::{FieldCodec, FieldValue, SyncState},
        config::NetEmulation,
        math::Vec3,
        mover::{Mover, MOVER_TAG},
        transport::{Datagram, LoopbackPeer, LoopbackTransport},
    };

    fn mover() -> Box<dyn HostEntity> {
        Box::new(Mover::new(
            "m",
            Vec3::ZERO,
            Vec3::new(1.0, 0.0, 0.0),
            0.1,
        ))
    }

    fn setup(
        emulation: Option<NetEmulation>,
    ) -> (
        HostScheduler<LoopbackTransport, FieldCodec>,
        LoopbackPeer,
        ManualClock,
    ) {
        let transport = LoopbackTransport::new();
        let peer = transport.connect();
        let clock = ManualClock::new();
        let cfg = ReplicationConfig {
            emulation,
            ..ReplicationConfig::default()
        };
        let host = HostScheduler::new(transport, FieldCodec, &cfg, Arc::new(clock.clone()));
        (host, peer, clock)
    }

    fn decode(d: &Datagram) -> Envelope {
        Envelope::decode(d.bytes.clone(), d.reliable).unwrap()
    }

    #[test]
    fn ids_are_sequential_and_never_reused() {
        let (host, _peer, _clock) = setup(None);
        let a = host.add_entity(mover());
        let b = host.add_entity(mover());
        host.remove_entity(a);
        let c = host.add_entity(mover());
        assert_eq!((a, b, c), (EntityId(0), EntityId(1), EntityId(2)));
        assert_eq!(host.entity_ids(), vec![EntityId(1), EntityId(2)]);
    }

    #[test]
    fn add_sends_reliable_create() {
        let (host, mut peer, _clock) = setup(None);
        let id = host.add_entity(mover());
        let got = peer.drain();
        assert_eq!(got.len(), 1);
        let env = decode(&got[0]);
        assert!(env.reliable);
        assert_eq!(env.tick, 0);
        match &env.records[..] {
            [EntityEvent::Create {
                id: rid, type_tag, ..
            }] => {
                assert_eq!(*rid, id);
                assert_eq!(type_tag, MOVER_TAG);
            }
            other => panic!("unexpected records {other:?}"),
        }
    }

    #[test]
    fn remove_sends_reliable_destroy_once() {
        let (host, mut peer, _clock) = setup(None);
        let id = host.add_entity(mover());
        peer.drain();
        assert!(host.remove_entity(id).is_some());
        assert!(host.remove_entity(id).is_none());
        let got = peer.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(decode(&got[0]).records, vec![EntityEvent::Destroy { id }]);
        assert_eq!(host.entity_count(), 0);
    }

    #[test]
    fn tick_broadcasts_after_update_period() {
        let (host, mut peer, _clock) = setup(None);
        host.add_entity(mover());
        host.add_entity(mover());
        peer.drain();

        host.tick(0.05);
        assert!(peer.drain().is_empty());
        host.tick(0.05);
        let got = peer.drain();
        assert_eq!(got.len(), 1);
        let env = decode(&got[0]);
        assert!(!env.reliable);
        assert_eq!(env.tick, 1);
        assert_eq!(env.records.len(), 2);
        assert!(env
            .records
            .iter()
            .all(|r| matches!(r, EntityEvent::Delta { .. })));
        assert_eq!(host.current_tick(), 1);
    }

    #[test]
    fn tick_runs_entity_logic_before_snapshotting() {
        let (host, _peer, _clock) = setup(None);
        let id = host.add_entity(mover());
        host.tick(0.1);
        let x = host
            .with_entity(id, |e| match e.field(1) {
                FieldValue::Vec3(p) => p.x,
                _ => f32::NAN,
            })
            .unwrap();
        assert!((x - 0.1).abs() < 1e-6);
    }

    #[test]
    fn tick_counter_wraps() {
        let (host, _peer, _clock) = setup(None);
        host.tick.store(u32::MAX, Ordering::SeqCst);
        host.tick(0.1);
        assert_eq!(host.current_tick(), 0);
    }

    #[test]
    fn late_joiner_gets_every_live_entity() {
        let (host, _early, _clock) = setup(None);
        host.add_entity(mover());
        let gone = host.add_entity(mover());
        host.add_entity(mover());
        host.remove_entity(gone);
        host.tick(0.1);

        let mut late = host.transport().connect();
        host.on_peer_connected(late.id);
        let got = late.drain();
        assert_eq!(got.len(), 1);
        let env = decode(&got[0]);
        assert!(env.reliable);
        assert_eq!(env.tick, 1);
        let ids: Vec<EntityId> = env.records.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![EntityId(0), EntityId(2)]);
    }

    #[test]
    fn emulated_latency_defers_delivery() {
        let (host, mut peer, clock) = setup(Some(NetEmulation {
            drop_probability: 0.0,
            latency_ms: 100,
            seed: Some(1),
        }));
        host.add_entity(mover());
        assert!(peer.drain().is_empty());
        assert_eq!(host.pending_deliveries(), 1);

        clock.advance_secs(0.01);
        host.tick(0.01);
        assert!(peer.drain().is_empty());

        clock.advance_secs(0.2);
        host.tick(0.01);
        assert_eq!(peer.drain().len(), 1);
        assert_eq!(host.pending_deliveries(), 0);
    }

    #[test]
    fn emulated_loss_drops_deltas_but_not_creates() {
        let (host, mut peer, clock) = setup(Some(NetEmulation {
            drop_probability: 1.0,
            latency_ms: 0,
            seed: Some(1),
        }));
        host.add_entity(mover());
        for _ in 0..5 {
            clock.advance_secs(0.1);
            host.tick(0.1);
        }
        let got = peer.drain();
        assert_eq!(got.len(), 1);
        assert!(got[0].reliable);
        assert_eq!(host.dropped_deliveries(), 5);
    }

    #[test]
    fn dead_peer_does_not_stop_the_tick() {
        let (host, peer, _clock) = setup(None);
        assert_eq!(host.dropped_deliveries(), 0);
        let mut other = host.transport().connect();
        drop(peer);
        host.add_entity(mover());
        host.tick(0.1);
        assert_eq!(other.drain().len(), 2);
    }
}
