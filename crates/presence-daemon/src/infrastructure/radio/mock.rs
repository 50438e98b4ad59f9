//! Scripted radio backend for tests and demos.
//!
//! Simulates an adapter plus a population of wearables that follow the
//! handshake protocol from the device side: submit a plaintext block when
//! told the purpose, acknowledge (or not) the Oracle ciphertext, and echo an
//! "encrypted" version of the host's random block.  Scripts control each
//! step so failure paths (silent devices, rejected ciphertext, bad echoes)
//! are as easy to produce as the happy path.
//!
//! The simulated cipher is string reversal: pair a wearable using
//! [`EchoRule::ReverseReceived`] with an oracle double that decrypts by
//! reversing, and the round-trip comparison succeeds.

use presence_core::{encode_frames, FrameBuffer};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{radio_channel, RadioCommand, RadioEvent, RadioHandle};

/// How a scripted wearable answers the host's random block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoRule {
    /// Echo the received block reversed (matches the reversing oracle double).
    ReverseReceived,
    /// Echo a fixed string, typically to force a comparison mismatch.
    Fixed(String),
    /// Never answer, forcing the host's timeout.
    Silent,
}

/// How a scripted wearable answers the Oracle-encrypted ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiphertextReply {
    /// Accept with the `OK` status.
    Accept,
    /// Reject with a non-`OK` status.
    Reject,
    /// Never answer, forcing the host's timeout.
    Silent,
}

/// Where a wearable is in its device-side half of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    SubmittedBlock,
    AckedCiphertext,
}

/// One scripted wearable.
#[derive(Debug, Clone)]
pub struct MockWearable {
    pub id: String,
    /// Plaintext block the wearable submits after the purpose keyword.
    pub submit_block: String,
    pub ciphertext_reply: CiphertextReply,
    pub echo: EchoRule,
    phase: Phase,
}

impl MockWearable {
    /// A wearable that completes the whole handshake against the reversing
    /// oracle double.
    pub fn cooperative(id: &str, submit_block: &str) -> Self {
        Self {
            id: id.to_string(),
            submit_block: submit_block.to_string(),
            ciphertext_reply: CiphertextReply::Accept,
            echo: EchoRule::ReverseReceived,
            phase: Phase::Idle,
        }
    }

    pub fn with_ciphertext_reply(mut self, reply: CiphertextReply) -> Self {
        self.ciphertext_reply = reply;
        self
    }

    pub fn with_echo(mut self, echo: EchoRule) -> Self {
        self.echo = echo;
        self
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
    }

    /// Produces the wearable's reply to one complete inbound message.
    fn respond(&mut self, message: &str) -> Option<String> {
        match self.phase {
            Phase::Idle if message == "LOGIN" || message == "HEARTBEAT" => {
                self.phase = Phase::SubmittedBlock;
                Some(self.submit_block.clone())
            }
            Phase::SubmittedBlock => match self.ciphertext_reply {
                CiphertextReply::Accept => {
                    self.phase = Phase::AckedCiphertext;
                    Some("OK".to_string())
                }
                CiphertextReply::Reject => Some("ERR".to_string()),
                CiphertextReply::Silent => None,
            },
            Phase::AckedCiphertext => match &self.echo {
                EchoRule::ReverseReceived => Some(message.chars().rev().collect()),
                EchoRule::Fixed(reply) => Some(reply.clone()),
                EchoRule::Silent => None,
            },
            _ => {
                debug!("mock wearable {} ignoring message: {message}", self.id);
                None
            }
        }
    }
}

/// Spawns the simulator task and returns the capability channel pair.
///
/// The simulator announces the adapter as powered on immediately, emits one
/// advertisement per wearable each time scanning starts, and plays each
/// wearable's script over the framed link once connected.
pub fn spawn_mock_radio(
    wearables: Vec<MockWearable>,
) -> (RadioHandle, mpsc::Receiver<RadioEvent>) {
    let (handle, commands) = radio_channel(64);
    let (events_tx, events_rx) = mpsc::channel(64);

    tokio::spawn(run_mock_radio(wearables, commands, events_tx));

    (handle, events_rx)
}

async fn run_mock_radio(
    mut wearables: Vec<MockWearable>,
    mut commands: mpsc::Receiver<RadioCommand>,
    events: mpsc::Sender<RadioEvent>,
) {
    let mut connected: Option<usize> = None;
    let mut inbound = FrameBuffer::new();

    if events
        .send(RadioEvent::StateChange { powered_on: true })
        .await
        .is_err()
    {
        return;
    }

    while let Some(command) = commands.recv().await {
        match command {
            RadioCommand::StartScan => {
                for wearable in &wearables {
                    let advert = RadioEvent::Discover {
                        id: wearable.id.clone(),
                        rssi: -42,
                    };
                    if events.send(advert).await.is_err() {
                        return;
                    }
                }
            }
            RadioCommand::StopScan => {}
            RadioCommand::Connect { id } => {
                let outcome = match wearables.iter_mut().position(|w| w.id == id) {
                    Some(index) => {
                        wearables[index].reset();
                        connected = Some(index);
                        RadioEvent::Connected { id }
                    }
                    None => RadioEvent::ConnectFailed {
                        id,
                        reason: "no such wearable in the simulation".to_string(),
                    },
                };
                let connected_ok = matches!(outcome, RadioEvent::Connected { .. });
                if events.send(outcome).await.is_err() {
                    return;
                }
                if connected_ok && events.send(RadioEvent::WriteChannelReady).await.is_err() {
                    return;
                }
            }
            RadioCommand::WriteFrame(frame) => {
                let Some(index) = connected else {
                    warn!("mock radio: frame written with no connection");
                    continue;
                };
                match inbound.accept(&frame) {
                    Ok(Some(message)) => {
                        if let Some(reply) = wearables[index].respond(&message) {
                            for reply_frame in encode_frames(&reply) {
                                if events.send(RadioEvent::Frame(reply_frame)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("mock radio: dropping malformed outbound frame: {e}"),
                }
            }
            RadioCommand::RequestDisconnect => {
                inbound.clear();
                if connected.take().is_some() && events.send(RadioEvent::Disconnected).await.is_err()
                {
                    return;
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooperative_wearable_plays_full_script() {
        let mut wearable = MockWearable::cooperative("ABC123", "AABBCCDD");

        assert_eq!(wearable.respond("HEARTBEAT").as_deref(), Some("AABBCCDD"));
        assert_eq!(wearable.respond("CIPHERTEXT").as_deref(), Some("OK"));
        assert_eq!(wearable.respond("1234").as_deref(), Some("4321"));
    }

    #[test]
    fn test_idle_wearable_ignores_non_purpose_message() {
        let mut wearable = MockWearable::cooperative("ABC123", "AABB");
        assert_eq!(wearable.respond("GARBAGE"), None);
    }

    #[test]
    fn test_rejecting_wearable_answers_err() {
        let mut wearable = MockWearable::cooperative("ABC123", "AABB")
            .with_ciphertext_reply(CiphertextReply::Reject);
        wearable.respond("LOGIN");
        assert_eq!(wearable.respond("CIPHERTEXT").as_deref(), Some("ERR"));
    }

    #[test]
    fn test_silent_wearable_never_acknowledges() {
        let mut wearable = MockWearable::cooperative("ABC123", "AABB")
            .with_ciphertext_reply(CiphertextReply::Silent);
        wearable.respond("LOGIN");
        assert_eq!(wearable.respond("CIPHERTEXT"), None);
    }

    #[tokio::test]
    async fn test_scan_emits_one_advert_per_wearable() {
        let (handle, mut events) = spawn_mock_radio(vec![
            MockWearable::cooperative("AAA", "01"),
            MockWearable::cooperative("BBB", "02"),
        ]);

        assert_eq!(
            events.recv().await,
            Some(RadioEvent::StateChange { powered_on: true })
        );
        handle.start_scan().await;
        let mut seen = Vec::new();
        for _ in 0..2 {
            if let Some(RadioEvent::Discover { id, .. }) = events.recv().await {
                seen.push(id);
            }
        }
        assert_eq!(seen, vec!["AAA".to_string(), "BBB".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_to_unknown_wearable_fails() {
        let (handle, mut events) = spawn_mock_radio(vec![]);
        events.recv().await; // power-on

        handle.connect("GHOST").await;
        match events.recv().await {
            Some(RadioEvent::ConnectFailed { id, .. }) => assert_eq!(id, "GHOST"),
            other => panic!("expected ConnectFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_emits_connected_then_write_channel_ready() {
        let (handle, mut events) =
            spawn_mock_radio(vec![MockWearable::cooperative("ABC123", "01")]);
        events.recv().await; // power-on

        handle.connect("ABC123").await;
        assert_eq!(
            events.recv().await,
            Some(RadioEvent::Connected {
                id: "ABC123".to_string()
            })
        );
        assert_eq!(events.recv().await, Some(RadioEvent::WriteChannelReady));
    }
}
