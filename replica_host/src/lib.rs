//! `replica_host`
//!
//! Authoritative side of the replication protocol:
//! - Entity registry with stable, never reused ids
//! - Periodic delta snapshots under a wrapping tick counter
//! - Optional latency/loss emulation on the outbound path
//! - TCP/UDP host wiring peers into the scheduler
//!
//! Networking model:
//! - TCP: handshake, `Create`/`Destroy` envelopes
//! - UDP: `Delta` envelopes

pub mod delivery;
pub mod scheduler;
pub mod server;

pub use scheduler::HostScheduler;
pub use server::HostServer;
