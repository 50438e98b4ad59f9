//! Radio capability boundary.
//!
//! The daemon never talks to radio hardware directly.  A backend (real
//! hardware, or the [`mock`] simulator) owns the adapter and exchanges typed
//! messages with the core over a channel pair:
//!
//! - [`RadioEvent`] – hardware happenings delivered *to* the dispatch loop
//!   (discovery adverts, connect/disconnect, inbound frames).
//! - [`RadioCommand`] – operations requested *by* the core (scan control,
//!   connect, frame writes, clean teardown).
//!
//! One connection exists at a time, so commands that act on "the current
//! connection" carry no peripheral handle; the backend tracks it.
//!
//! # GATT roles
//!
//! The wearable exposes one user service with three characteristics: a read
//! channel (device → host, notifying), a write channel (host → device), and a
//! disconnect channel the host writes an empty payload to when it wants the
//! device to tear the link down itself.

pub mod mock;

use presence_core::{encode_frames, DeviceId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// User service UUID advertised by wearables.
pub const USER_SERVICE_UUID: &str = "2220";

/// Read characteristic UUID (device → host, notify).
pub const READ_CHARACTERISTIC_UUID: &str = "2221";

/// Write characteristic UUID (host → device).
pub const WRITE_CHARACTERISTIC_UUID: &str = "2222";

/// Disconnect characteristic UUID (host-triggered clean teardown).
pub const DISCONNECT_CHARACTERISTIC_UUID: &str = "2223";

/// Events produced by the radio backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// Adapter power state changed; scanning is only possible when powered on.
    StateChange { powered_on: bool },
    /// An advertisement carrying a wearable identifier was observed.
    Discover { id: DeviceId, rssi: i16 },
    /// A requested connection was established and its services resolved.
    Connected { id: DeviceId },
    /// A requested connection could not be established.
    ConnectFailed { id: DeviceId, reason: String },
    /// The write channel of the connected wearable is usable.
    WriteChannelReady,
    /// One transport unit arrived on the read channel.
    Frame(Vec<u8>),
    /// The connection dropped, for any reason.
    Disconnected,
}

/// Operations the core requests from the radio backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    StartScan,
    StopScan,
    Connect { id: DeviceId },
    /// Write one transport unit to the connected wearable's write channel.
    WriteFrame(Vec<u8>),
    /// Write an empty payload to the disconnect channel and drop the link.
    RequestDisconnect,
}

/// Creates the command channel and a [`RadioHandle`] bound to it.
///
/// The backend consumes the returned receiver.
pub fn radio_channel(capacity: usize) -> (RadioHandle, mpsc::Receiver<RadioCommand>) {
    let (tx, rx) = mpsc::channel(capacity);
    (RadioHandle { commands: tx }, rx)
}

/// Cloneable sending side of the radio command channel.
///
/// Send failures mean the backend is gone; they are logged rather than
/// propagated because nothing in the core can recover a dead radio.
#[derive(Debug, Clone)]
pub struct RadioHandle {
    commands: mpsc::Sender<RadioCommand>,
}

impl RadioHandle {
    pub async fn start_scan(&self) {
        self.send(RadioCommand::StartScan).await;
    }

    pub async fn stop_scan(&self) {
        self.send(RadioCommand::StopScan).await;
    }

    pub async fn connect(&self, id: &str) {
        self.send(RadioCommand::Connect { id: id.to_string() }).await;
    }

    pub async fn request_disconnect(&self) {
        self.send(RadioCommand::RequestDisconnect).await;
    }

    /// Fragments `message` with the framing codec and writes the transport
    /// units to the wearable strictly in order.
    pub async fn write_message(&self, message: &str) {
        debug!("writing message to wearable: {message}");
        for frame in encode_frames(message) {
            self.send(RadioCommand::WriteFrame(frame)).await;
        }
    }

    async fn send(&self, command: RadioCommand) {
        if self.commands.send(command).await.is_err() {
            warn!("radio backend is gone; command dropped");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
