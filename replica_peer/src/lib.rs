//! `replica_peer`
//!
//! Receiving side of the replication protocol:
//! - Staleness filtering of envelopes by wrapping tick
//! - One pending event per entity id, applied once per local frame
//! - Interpolation towards the latest state, then dead reckoning
//! - Network peer pumping both channels into the reconciler

pub mod client;
pub mod reconciler;

pub use client::PeerClient;
pub use reconciler::PeerReconciler;
