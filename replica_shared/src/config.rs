//! Configuration system.
//!
//! Loads replication configuration from JSON strings/files. Every policy
//! constant of the protocol (broadcast period, wraparound tolerance, latency
//! window, emulated network conditions) lives here instead of in code.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Root configuration shared by host/peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Host listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Local simulation tick rate.
    pub tick_hz: u32,
    /// Seconds between host delta broadcasts.
    #[serde(default = "default_update_period")]
    pub update_period_secs: f32,
    /// Distance from either end of the tick range inside which a smaller tick
    /// is treated as a wraparound rather than a stale envelope.
    #[serde(default = "default_wrap_window")]
    pub tick_wrap_window: u32,
    /// Number of inter-arrival samples in the latency moving average.
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
    /// Emulated network conditions on the host's outbound path.
    #[serde(default)]
    pub emulation: Option<NetEmulation>,
}

/// Artificial latency/loss applied by the host before envelopes hit the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetEmulation {
    /// Probability in `0.0..=1.0` that a released envelope is discarded.
    #[serde(default)]
    pub drop_probability: f32,
    /// Base one-way delay; jitter of up to half of it is added or removed.
    #[serde(default)]
    pub latency_ms: u64,
    /// Seed for the drop/jitter RNG. Entropy-seeded when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl NetEmulation {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

fn default_update_period() -> f32 {
    0.1
}

fn default_wrap_window() -> u32 {
    1000
}

fn default_latency_window() -> usize {
    20
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 64,
            update_period_secs: default_update_period(),
            tick_wrap_window: default_wrap_window(),
            latency_window: default_latency_window(),
            emulation: None,
        }
    }
}

impl ReplicationConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Local frame duration derived from `tick_hz`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.tick_hz.max(1) as f32)
    }
}
