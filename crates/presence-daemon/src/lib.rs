//! # presence-daemon
//!
//! The wearable presence daemon.  Discovers short-range wireless wearables,
//! authenticates each one through a challenge/response handshake brokered by
//! the remote Oracle, and maintains a live registry of who is present for the
//! front-end relay.
//!
//! Layered like the rest of the workspace:
//!
//! - **`application`** – the discovery/connection arbiter, the handshake
//!   state machine, and the single dispatch loop that ties them together.
//! - **`infrastructure`** – the radio capability boundary, the Oracle HTTP
//!   client, the presence relay socket server, and configuration storage.
//!
//! The library target exists so integration tests can drive the whole
//! pipeline in-process; `main.rs` only does wiring.

pub mod application;
pub mod infrastructure;
