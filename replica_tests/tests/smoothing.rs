//! Interpolation and extrapolation timing as seen through shadow callbacks.

use std::time::Duration;

use replica_shared::config::ReplicationConfig;
use replica_tests::{init_tracing, Call, LoopbackRig, Probe};

fn assert_close(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1e-5,
        "expected {expected}, got {actual}"
    );
}

/// Peer 0 holds one live probe whose last delta landed 100ms after its
/// create, so the observed update interval is 100ms. The clock sits at 100ms.
fn rig_with_observed_interval() -> LoopbackRig {
    let mut rig = LoopbackRig::new(ReplicationConfig::default());
    rig.add_peer();
    rig.host.add_entity(Probe::boxed("s"));
    rig.pump_all();
    rig.peers[0].reconciler.tick(0.0);

    rig.clock.advance(Duration::from_millis(100));
    rig.host.tick(0.1);
    rig.pump_all();
    rig.peers[0].reconciler.tick(0.1);
    assert_eq!(
        rig.peers[0].log.take(),
        vec![
            Call::Created {
                label: "s".into(),
                value: 0
            },
            Call::Updated {
                label: "s".into(),
                value: 1,
                latency: 0.0
            },
        ]
    );
    rig
}

#[test]
fn blend_follows_elapsed_over_observed_interval() {
    init_tracing();
    let rig = rig_with_observed_interval();
    let peer = &rig.peers[0];

    for (step_ms, expected) in [(40u64, 0.4f32), (30, 0.7)] {
        rig.clock.advance(Duration::from_millis(step_ms));
        peer.reconciler.tick(step_ms as f32 / 1000.0);
        match peer.log.take().as_slice() {
            [Call::Interpolated { blend, .. }] => assert_close(*blend, expected),
            other => panic!("unexpected calls {other:?}"),
        }
    }
}

#[test]
fn extrapolates_with_per_frame_dt_after_interval_runs_out() {
    init_tracing();
    let rig = rig_with_observed_interval();
    let peer = &rig.peers[0];

    rig.clock.advance(Duration::from_millis(100));
    peer.reconciler.tick(0.1);
    assert_eq!(
        peer.log.take(),
        vec![Call::Interpolated {
            label: "s".into(),
            blend: 1.0
        }]
    );

    for dt in [0.016f32, 0.020, 0.016] {
        rig.clock.advance(Duration::from_secs_f32(dt));
        peer.reconciler.tick(dt);
    }
    assert_eq!(
        peer.log.take(),
        vec![
            Call::Extrapolated {
                label: "s".into(),
                dt: 0.016
            },
            Call::Extrapolated {
                label: "s".into(),
                dt: 0.020
            },
            Call::Extrapolated {
                label: "s".into(),
                dt: 0.016
            },
        ]
    );
    let timing = peer
        .reconciler
        .shadow_timing(replica_shared::wire::EntityId(0))
        .unwrap();
    assert_eq!(timing.extrapolating_since, Some(Duration::from_millis(200)));
}

#[test]
fn new_delta_resumes_interpolation() {
    init_tracing();
    let mut rig = rig_with_observed_interval();

    rig.clock.advance(Duration::from_millis(150));
    rig.peers[0].reconciler.tick(0.15);
    rig.clock.advance(Duration::from_millis(16));
    rig.peers[0].reconciler.tick(0.016);
    rig.peers[0].log.take();

    // The next delta lands 166ms after the previous one.
    rig.host.tick(0.1);
    rig.pump_all();
    rig.peers[0].reconciler.tick(0.0);
    match rig.peers[0].log.take().as_slice() {
        [Call::Updated {
            value: 2, latency, ..
        }] => assert_close(*latency, 0.066),
        other => panic!("unexpected calls {other:?}"),
    }

    rig.clock.advance(Duration::from_millis(83));
    rig.peers[0].reconciler.tick(0.083);
    match rig.peers[0].log.take().as_slice() {
        [Call::Interpolated { blend, .. }] => assert_close(*blend, 83.0 / 166.0),
        other => panic!("unexpected calls {other:?}"),
    }
}

#[test]
fn frames_with_fresh_data_skip_smoothing() {
    init_tracing();
    let mut rig = rig_with_observed_interval();
    for _ in 0..3 {
        rig.clock.advance(Duration::from_millis(100));
        rig.host.tick(0.1);
        rig.pump_all();
        rig.peers[0].reconciler.tick(0.1);
        assert!(matches!(
            rig.peers[0].log.take().as_slice(),
            [Call::Updated { .. }]
        ));
    }
}
