//! Shared fixtures for the integration tests.
//!
//! - [`Probe`] / [`RecordingShadow`]: a tiny entity type whose shadow logs
//!   every lifecycle and smoothing call.
//! - [`LoopbackRig`]: a host scheduler and any number of reconcilers wired
//!   through a [`LoopbackTransport`] and one [`ManualClock`].

use std::{
    any::Any,
    sync::{Arc, Mutex},
    time::Duration,
};

use replica_host::HostScheduler;
use replica_peer::PeerReconciler;
use replica_shared::{
    clock::ManualClock,
    codec::{FieldCodec, FieldFlags, FieldKind, FieldSpec, FieldValue, SyncState},
    config::ReplicationConfig,
    entity::{EntityFactory, HostEntity, ShadowEntity},
    transport::{Datagram, LoopbackPeer, LoopbackTransport},
    wire::Envelope,
};

pub const PROBE_TAG: &str = "probe";

const PROBE_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("label", FieldKind::Str, FieldFlags::INIT),
    FieldSpec::new("value", FieldKind::I32, FieldFlags::SMOOTHED),
];

/// Installs a test-friendly subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Host-side probe. `value` goes up by one per update period.
#[derive(Debug, Clone)]
pub struct Probe {
    pub label: String,
    pub value: i32,
}

impl Probe {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: 0,
        }
    }

    pub fn boxed(label: impl Into<String>) -> Box<dyn HostEntity> {
        Box::new(Self::new(label))
    }
}

impl SyncState for Probe {
    fn fields(&self) -> &'static [FieldSpec] {
        PROBE_FIELDS
    }

    fn field(&self, index: usize) -> FieldValue {
        match index {
            0 => FieldValue::Str(self.label.clone()),
            _ => FieldValue::I32(self.value),
        }
    }

    fn set_field(&mut self, index: usize, value: FieldValue) {
        match (index, value) {
            (0, FieldValue::Str(v)) => self.label = v,
            (1, FieldValue::I32(v)) => self.value = v,
            _ => {}
        }
    }
}

impl HostEntity for Probe {
    fn type_tag(&self) -> &str {
        PROBE_TAG
    }

    fn on_tick(&mut self) {
        self.value += 1;
    }
}

/// One recorded shadow callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Created { label: String, value: i32 },
    Updated {
        label: String,
        value: i32,
        latency: f32,
    },
    Destroyed { label: String },
    Interpolated { label: String, blend: f32 },
    Extrapolated { label: String, dt: f32 },
}

/// Calls recorded by every [`RecordingShadow`] built from one factory.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }

    /// Takes everything recorded so far.
    pub fn take(&self) -> Vec<Call> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

/// Shadow of a [`Probe`].
#[derive(Debug)]
pub struct RecordingShadow {
    pub label: String,
    pub value: i32,
    log: CallLog,
}

impl SyncState for RecordingShadow {
    fn fields(&self) -> &'static [FieldSpec] {
        PROBE_FIELDS
    }

    fn field(&self, index: usize) -> FieldValue {
        match index {
            0 => FieldValue::Str(self.label.clone()),
            _ => FieldValue::I32(self.value),
        }
    }

    fn set_field(&mut self, index: usize, value: FieldValue) {
        match (index, value) {
            (0, FieldValue::Str(v)) => self.label = v,
            (1, FieldValue::I32(v)) => self.value = v,
            _ => {}
        }
    }
}

impl ShadowEntity for RecordingShadow {
    fn on_create(&mut self) {
        self.log.push(Call::Created {
            label: self.label.clone(),
            value: self.value,
        });
    }

    fn on_update(&mut self, latency_delta_secs: f32) {
        self.log.push(Call::Updated {
            label: self.label.clone(),
            value: self.value,
            latency: latency_delta_secs,
        });
    }

    fn on_destroy(&mut self) {
        self.log.push(Call::Destroyed {
            label: self.label.clone(),
        });
    }

    fn interpolate(&mut self, blend: f32) {
        self.log.push(Call::Interpolated {
            label: self.label.clone(),
            blend,
        });
    }

    fn extrapolate(&mut self, dt_secs: f32) {
        self.log.push(Call::Extrapolated {
            label: self.label.clone(),
            dt: dt_secs,
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory knowing only [`PROBE_TAG`], logging into `log`.
pub fn recording_factory(log: &CallLog) -> EntityFactory {
    let mut factory = EntityFactory::new();
    let log = log.clone();
    factory.register(PROBE_TAG, move || {
        Box::new(RecordingShadow {
            label: String::new(),
            value: 0,
            log: log.clone(),
        })
    });
    factory
}

pub type LoopbackHost = HostScheduler<LoopbackTransport, FieldCodec>;
pub type LoopbackReconciler = PeerReconciler<FieldCodec>;

/// A connected peer inside a [`LoopbackRig`].
pub struct RigPeer {
    pub link: LoopbackPeer,
    pub reconciler: LoopbackReconciler,
    pub log: CallLog,
}

impl RigPeer {
    /// Feeds every delivered datagram into the reconciler.
    pub fn pump(&mut self) -> usize {
        let delivered = self.link.drain();
        let n = delivered.len();
        for Datagram { reliable, bytes } in delivered {
            // Test envelopes are always well-formed.
            let _ = self.reconciler.on_data(reliable, bytes);
        }
        n
    }

    /// Decodes everything delivered without applying it.
    pub fn take_envelopes(&mut self) -> Vec<Envelope> {
        self.link
            .drain()
            .into_iter()
            .filter_map(|d| Envelope::decode(d.bytes, d.reliable).ok())
            .collect()
    }
}

/// Host and peers sharing one transport and one clock.
pub struct LoopbackRig {
    pub cfg: ReplicationConfig,
    pub clock: ManualClock,
    pub transport: LoopbackTransport,
    pub host: LoopbackHost,
    pub peers: Vec<RigPeer>,
}

impl LoopbackRig {
    pub fn new(cfg: ReplicationConfig) -> Self {
        let clock = ManualClock::new();
        let transport = LoopbackTransport::new();
        let host = HostScheduler::new(
            transport.clone(),
            FieldCodec,
            &cfg,
            Arc::new(clock.clone()),
        );
        Self {
            cfg,
            clock,
            transport,
            host,
            peers: Vec::new(),
        }
    }

    /// Connects a peer and lets the host greet it. Returns its index.
    pub fn add_peer(&mut self) -> usize {
        let link = self.transport.connect();
        let log = CallLog::default();
        let reconciler = PeerReconciler::new(
            FieldCodec,
            recording_factory(&log),
            &self.cfg,
            Arc::new(self.clock.clone()),
        );
        self.host.on_peer_connected(link.id);
        self.peers.push(RigPeer {
            link,
            reconciler,
            log,
        });
        self.peers.len() - 1
    }

    pub fn pump_all(&mut self) {
        for peer in &mut self.peers {
            peer.pump();
        }
    }

    /// One frame everywhere: advance the clock, tick the host, deliver and
    /// tick every peer.
    pub fn step(&mut self, dt: f32) {
        self.clock.advance(Duration::from_secs_f32(dt));
        self.host.tick(dt);
        self.pump_all();
        for peer in &self.peers {
            peer.reconciler.tick(dt);
        }
    }
}
