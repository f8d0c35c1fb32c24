//! Host and peers wired through the in-process transport.

use replica_shared::{
    codec::{FieldValue, SyncState},
    config::ReplicationConfig,
    wire::{EntityEvent, EntityId},
};
use replica_tests::{init_tracing, Call, LoopbackRig, Probe, RecordingShadow};

fn shadow_labels(rig: &LoopbackRig, peer: usize) -> Vec<(EntityId, String)> {
    let reconciler = &rig.peers[peer].reconciler;
    reconciler
        .shadow_ids()
        .into_iter()
        .filter_map(|id| {
            reconciler.with_shadow(id, |s| {
                let shadow = s.as_any().downcast_ref::<RecordingShadow>()?;
                Some((id, shadow.label.clone()))
            })?
        })
        .collect()
}

fn host_labels(rig: &LoopbackRig) -> Vec<(EntityId, String)> {
    rig.host
        .entity_ids()
        .into_iter()
        .filter_map(|id| {
            let label = rig.host.with_entity(id, |e| match e.field(0) {
                FieldValue::Str(label) => label,
                _ => String::new(),
            })?;
            Some((id, label))
        })
        .collect()
}

#[test]
fn end_to_end_first_entity_and_first_delta() {
    init_tracing();
    let mut rig = LoopbackRig::new(ReplicationConfig::default());
    let observer = rig.add_peer();
    let applier = rig.add_peer();

    let id = rig.host.add_entity(Probe::boxed("first"));
    assert_eq!(id, EntityId(0));

    rig.host.tick(0.1);
    assert_eq!(rig.host.current_tick(), 1);

    let envelopes = rig.peers[observer].take_envelopes();
    assert_eq!(envelopes.len(), 2);
    assert!(envelopes[0].reliable);
    assert!(matches!(
        envelopes[0].records.as_slice(),
        [EntityEvent::Create { id: EntityId(0), .. }]
    ));
    assert!(!envelopes[1].reliable);
    assert_eq!(envelopes[1].tick, 1);
    assert!(matches!(
        envelopes[1].records.as_slice(),
        [EntityEvent::Delta { id: EntityId(0), .. }]
    ));

    rig.peers[applier].pump();
    rig.peers[applier].reconciler.tick(0.1);
    assert_eq!(
        rig.peers[applier].log.take(),
        vec![
            Call::Created {
                label: "first".into(),
                value: 0
            },
            Call::Updated {
                label: "first".into(),
                value: 1,
                latency: 0.0
            },
        ]
    );
}

#[test]
fn peers_converge_on_host_entity_set() {
    init_tracing();
    let mut rig = LoopbackRig::new(ReplicationConfig::default());
    rig.add_peer();

    // (add label) or (remove nth live entity)
    let script: &[(bool, &str, usize)] = &[
        (true, "a", 0),
        (true, "b", 0),
        (true, "c", 0),
        (false, "", 1),
        (true, "d", 0),
        (false, "", 0),
        (true, "e", 0),
        (true, "f", 0),
        (false, "", 2),
        (false, "", 0),
        (true, "g", 0),
    ];

    for (step, &(add, label, nth)) in script.iter().enumerate() {
        if add {
            rig.host.add_entity(Probe::boxed(label));
        } else {
            let id = rig.host.entity_ids()[nth];
            assert!(rig.host.remove_entity(id).is_some());
        }
        if step == 5 {
            rig.add_peer();
        }
        rig.step(0.05);

        let expected = host_labels(&rig);
        for peer in 0..rig.peers.len() {
            assert_eq!(shadow_labels(&rig, peer), expected, "peer {peer} step {step}");
        }
    }

    assert_eq!(
        rig.host.entity_ids(),
        vec![EntityId(3), EntityId(5), EntityId(6)]
    );
}

#[test]
fn duplicate_create_delivery_instantiates_once() {
    init_tracing();
    let mut rig = LoopbackRig::new(ReplicationConfig::default());
    rig.add_peer();
    rig.host.add_entity(Probe::boxed("dup"));

    let datagrams = rig.peers[0].link.drain();
    assert_eq!(datagrams.len(), 1);
    let create = datagrams[0].clone();
    let reconciler = &rig.peers[0].reconciler;
    reconciler
        .on_data(create.reliable, create.bytes.clone())
        .unwrap();
    reconciler
        .on_data(create.reliable, create.bytes.clone())
        .unwrap();
    reconciler.tick(0.0);
    reconciler.on_data(create.reliable, create.bytes).unwrap();
    reconciler.tick(0.0);

    let created = rig.peers[0]
        .log
        .take()
        .into_iter()
        .filter(|c| matches!(c, Call::Created { .. }))
        .count();
    assert_eq!(created, 1);
    assert_eq!(rig.peers[0].reconciler.len(), 1);
    assert_eq!(rig.peers[0].reconciler.stats().duplicate_creates, 2);
}

#[test]
fn removed_before_peer_ticks_never_goes_live() {
    init_tracing();
    let mut rig = LoopbackRig::new(ReplicationConfig::default());
    rig.add_peer();
    let id = rig.host.add_entity(Probe::boxed("brief"));
    rig.host.remove_entity(id);
    rig.pump_all();
    rig.peers[0].reconciler.tick(0.0);

    assert!(rig.peers[0].log.take().is_empty());
    assert!(rig.peers[0].reconciler.is_empty());
}

#[test]
fn late_joiner_gets_snapshot_not_history() {
    init_tracing();
    let mut rig = LoopbackRig::new(ReplicationConfig::default());
    let id = rig.host.add_entity(Probe::boxed("old"));
    rig.host.tick(0.1);
    rig.host.tick(0.1);
    rig.host.tick(0.1);

    let peer = rig.add_peer();
    let envelopes = rig.peers[peer].take_envelopes();
    assert_eq!(envelopes.len(), 1);
    assert!(envelopes[0].reliable);
    assert_eq!(envelopes[0].tick, 3);
    match envelopes[0].records.as_slice() {
        [EntityEvent::Create { id: got, type_tag, .. }] => {
            assert_eq!(*got, id);
            assert_eq!(type_tag, replica_tests::PROBE_TAG);
        }
        other => panic!("unexpected records {other:?}"),
    }
}
