//! Application layer: policy and orchestration.
//!
//! The [`engine`] owns the single dispatch loop; the [`arbiter`] decides
//! which discovered wearable gets the radio's one connection slot; the
//! [`handshake`] machine authenticates whichever wearable it is handed.

pub mod arbiter;
pub mod engine;
pub mod handshake;

pub use arbiter::ConnectionArbiter;
pub use engine::Engine;
pub use handshake::{HandshakeEvent, HandshakeMachine, HandshakeState, HandshakeTimeouts};
