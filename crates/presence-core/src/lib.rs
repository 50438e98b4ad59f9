//! # presence-core
//!
//! Shared library for the wearable presence daemon containing the message
//! framing codec and the device registry domain logic.
//!
//! This crate is consumed by the `presence-daemon` binary. It has zero
//! dependencies on OS APIs, network sockets, or the async runtime, which keeps
//! every type in here unit-testable with plain synchronous tests.
//!
//! # Architecture overview
//!
//! The daemon authenticates short-range wireless wearables against a remote
//! trust authority (the "Oracle") and maintains a live picture of who is
//! present.  This crate defines the two pure pieces of that system:
//!
//! - **`protocol`** – How logical messages travel over the wearable's narrow
//!   radio channel.  Each transport unit is 20 bytes: a one-byte tag followed
//!   by up to 19 payload bytes.  `encode_frames` fragments an outbound
//!   message; [`FrameBuffer`] reassembles inbound fragments.
//!
//! - **`domain`** – The registry of known devices and their liveness state
//!   (`active` or `stale`), including the re-verification queue consumed by
//!   the connection arbiter.  All liveness arithmetic uses milliseconds since
//!   the Unix epoch, from one clock source ([`now_ms`]).

pub mod domain;
pub mod protocol;

pub use domain::clock::now_ms;
pub use domain::registry::{
    ClientPresence, DeviceId, DeviceRecord, DeviceRegistry, DeviceState, RegistrySnapshot,
};
pub use protocol::frame::{encode_frames, FrameBuffer, FrameError, FRAME_PAYLOAD, FRAME_SIZE};
