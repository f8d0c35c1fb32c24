//! Network-condition emulation.
//!
//! Outbound envelopes are held in a release-time ordered queue. Each gets
//! `latency ± latency/2` of uniform jitter; once due, unreliable envelopes are
//! discarded with the configured probability and everything else is handed
//! back for sending.
//!
//! Reliable envelopes are never dropped and never overtake each other: a
//! reliable channel can be slow but it is ordered and lossless.

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use replica_shared::{config::NetEmulation, transport::PeerId};
use tracing::trace;

/// Who an outbound envelope goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    Peer(PeerId),
}

/// One encoded envelope on its way out.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub target: Target,
    pub reliable: bool,
    pub bytes: Bytes,
}

/// Release-time ordered queue with drop/jitter emulation.
pub struct DeliveryQueue {
    emulation: NetEmulation,
    rng: StdRng,
    // (release time, insertion seq) keeps equal release times FIFO.
    pending: BTreeMap<(Duration, u64), Outbound>,
    seq: u64,
    last_reliable_release: Duration,
    dropped: u64,
}

impl DeliveryQueue {
    pub fn new(emulation: NetEmulation) -> Self {
        let rng = match emulation.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            emulation,
            rng,
            pending: BTreeMap::new(),
            seq: 0,
            last_reliable_release: Duration::ZERO,
            dropped: 0,
        }
    }

    fn release_time(&mut self, now: Duration) -> Duration {
        let latency = self.emulation.latency();
        if latency.is_zero() {
            return now;
        }
        let half = latency.as_secs_f64() / 2.0;
        let jitter = self.rng.gen_range(-half..=half);
        let delay = (latency.as_secs_f64() + jitter).max(0.0);
        now + Duration::from_secs_f64(delay)
    }

    /// Queues `out` for release at `now + latency ± jitter`.
    pub fn schedule(&mut self, now: Duration, out: Outbound) {
        let mut release = self.release_time(now);
        if out.reliable {
            release = release.max(self.last_reliable_release);
            self.last_reliable_release = release;
        }
        trace!(?release, reliable = out.reliable, "envelope delayed");
        self.pending.insert((release, self.seq), out);
        self.seq += 1;
    }

    /// Removes every entry due at `now` and returns the survivors of the drop
    /// roll, in release order. Each entry is released at most once.
    pub fn due(&mut self, now: Duration) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let item = entry.remove();
            if !item.reliable && self.rng.gen::<f32>() < self.emulation.drop_probability {
                self.dropped += 1;
                trace!("envelope dropped");
                continue;
            }
            out.push(item);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Unreliable envelopes discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
