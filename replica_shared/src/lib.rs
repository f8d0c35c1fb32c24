//! `replica_shared`
//!
//! Pieces used by both the authoritative host and its peers.
//!
//! Design goals:
//! - Best effort: every failure degrades to "this one update is lost".
//! - Explicit collaborators: transport, codec and clock are passed in, never
//!   looked up globally.
//! - Field selection is declared statically per entity type; no reflection.
//! - No `unsafe`.

pub mod clock;
pub mod codec;
pub mod config;
pub mod entity;
pub mod latency;
pub mod math;
pub mod mover;
pub mod net;
pub mod tick;
pub mod transport;
pub mod wire;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::clock::*;
    pub use crate::codec::*;
    pub use crate::config::*;
    pub use crate::entity::*;
    pub use crate::math::*;
    pub use crate::transport::*;
    pub use crate::wire::*;
}
