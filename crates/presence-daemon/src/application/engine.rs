//! Single dispatch loop tying the radio, the arbiter and the handshake
//! machine together.
//!
//! All state mutation happens here, one event at a time, so the arbiter and
//! the machine need no interior locking beyond the shared registry.  Frames
//! are reassembled at this boundary and the machine only ever sees complete
//! messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use presence_core::FrameBuffer;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::arbiter::ConnectionArbiter;
use crate::application::handshake::{HandshakeEvent, HandshakeMachine};
use crate::infrastructure::radio::RadioEvent;

pub struct Engine {
    arbiter: ConnectionArbiter,
    machine: HandshakeMachine,
    frames: FrameBuffer,
    radio_events: mpsc::Receiver<RadioEvent>,
    machine_events: mpsc::Receiver<HandshakeEvent>,
}

impl Engine {
    pub fn new(
        arbiter: ConnectionArbiter,
        machine: HandshakeMachine,
        radio_events: mpsc::Receiver<RadioEvent>,
        machine_events: mpsc::Receiver<HandshakeEvent>,
    ) -> Self {
        Self {
            arbiter,
            machine,
            frames: FrameBuffer::new(),
            radio_events,
            machine_events,
        }
    }

    /// Runs until the shutdown flag clears or the radio event stream ends.
    pub async fn run(mut self, running: Arc<AtomicBool>) {
        info!("engine dispatch loop started");
        while running.load(Ordering::Relaxed) {
            tokio::select! {
                event = self.radio_events.recv() => {
                    match event {
                        Some(event) => self.on_radio_event(event).await,
                        None => {
                            warn!("radio event stream closed, stopping engine");
                            break;
                        }
                    }
                }
                event = self.machine_events.recv() => {
                    // The machine holds a sender, so this arm cannot end
                    // before the loop does.
                    if let Some(event) = event {
                        self.machine.handle(event).await;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    // Periodic wakeup so a cleared shutdown flag is noticed.
                }
            }
        }
        info!("engine dispatch loop stopped");
    }

    async fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::StateChange { powered_on } => {
                self.arbiter.on_power_change(powered_on).await;
            }
            RadioEvent::Discover { id, rssi } => {
                self.arbiter.on_discover(&id, rssi).await;
            }
            RadioEvent::Connected { id } => {
                self.machine
                    .handle(HandshakeEvent::ConnectedToWearable { id })
                    .await;
            }
            RadioEvent::ConnectFailed { id, reason } => {
                self.arbiter.on_connect_failed(&id, &reason).await;
            }
            RadioEvent::WriteChannelReady => {
                self.machine.handle(HandshakeEvent::WriteChannelReady).await;
            }
            RadioEvent::Frame(frame) => match self.frames.accept(&frame) {
                Ok(Some(message)) => {
                    self.machine
                        .handle(HandshakeEvent::DataFromWearable(message))
                        .await;
                }
                Ok(None) => {}
                Err(e) => {
                    // A malformed frame poisons the whole message.
                    warn!("dropping frame: {e}");
                    self.frames.clear();
                }
            },
            RadioEvent::Disconnected => {
                debug!("wearable disconnected");
                self.frames.clear();
                self.machine.handle(HandshakeEvent::Reset).await;
                self.arbiter.on_disconnect().await;
            }
        }
    }
}
