//! Handshake state machine: mutual authentication between the host and one
//! wearable, brokered by the Oracle.
//!
//! A deterministic finite-state machine with a single active session,
//! mirroring the single-slot connection lock held by the arbiter:
//!
//! ```text
//! discovery ──connected──► connected ──write channel──► writeChannelFound
//!                                                             │ wearable block
//!                                                             ▼
//!                                                   encryptBlockViaOracle
//!                                                             │ ciphertext
//!                                                             ▼
//!                                                  sendCiphertextToWearable
//!                                                             │ "OK"
//!                                                             ▼
//!                                                  sendRandomBlockToWearable
//!                                                             │ encrypted echo
//!                                                             ▼
//!                                                     decryptBlockViaOracle
//!                                                        match │ mismatch
//!                                                             ▼
//!                                       successfulHandshake / unsuccessfulHandshake
//! ```
//!
//! Every waiting state arms one deadline; a timeout routes to
//! `unsuccessfulHandshake`.  A hardware disconnect raises [`HandshakeEvent::Reset`],
//! which is accepted from every state and returns to `discovery` with all
//! session secrets cleared.  Events not listed for the current state are
//! logged no-ops, never panics.
//!
//! # Timer discipline
//!
//! Exactly one timer is ever outstanding.  Arming spawns a sleeper task that
//! posts [`HandshakeEvent::Timeout`] carrying a generation number back into
//! the dispatch loop; every transition disarms (aborts the sleeper and bumps
//! the generation), so a timeout already sitting in the event queue when its
//! state exits is recognized as stale and ignored.  A stale timer can
//! therefore never fire into a later session.

use std::sync::Arc;
use std::time::Duration;

use presence_core::{now_ms, DeviceId, DeviceRegistry, DeviceState};
use rand::RngCore;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::infrastructure::oracle::Oracle;
use crate::infrastructure::radio::RadioHandle;
use crate::infrastructure::relay::{LoginStatus, LoginTarget};

/// Why this handshake is running; decides whether the relay hears about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// The front-end asked to log this wearable in; outcome is reported.
    Login,
    /// Routine presence re-verification; outcome is not reported.
    Heartbeat,
}

/// States of the machine.  The enum is closed: the compiler rejects a
/// transition function that forgets one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Discovery,
    Connected,
    WriteChannelFound,
    EncryptBlockViaOracle,
    SendCiphertextToWearable,
    SendRandomBlockToWearable,
    DecryptBlockViaOracle,
    SuccessfulHandshake,
    UnsuccessfulHandshake,
}

/// Events consumed by [`HandshakeMachine::handle`].
#[derive(Debug)]
pub enum HandshakeEvent {
    /// The arbiter connected a wearable and is handing it over.
    ConnectedToWearable { id: DeviceId },
    /// The write channel of the connected wearable became usable.
    WriteChannelReady,
    /// One complete reassembled message arrived from the wearable.
    DataFromWearable(String),
    /// Stage-1 reply from the Oracle.
    EncryptedBlockFromOracle(String),
    /// Stage-2 reply from the Oracle.
    DecryptedBlockFromOracle(String),
    /// The per-state deadline elapsed; carries the arming generation.
    Timeout(u64),
    /// Hardware disconnect: unconditional return to discovery.
    Reset,
}

/// Per-state deadlines.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeTimeouts {
    /// States waiting on the wearable.
    pub device: Duration,
    /// States waiting on the Oracle.
    pub oracle: Duration,
}

impl Default for HandshakeTimeouts {
    fn default() -> Self {
        Self {
            device: Duration::from_secs(5),
            oracle: Duration::from_secs(7),
        }
    }
}

/// Secrets and identity of the session in flight.  Created on entry to
/// `connected`, destroyed on reset; exactly one exists at a time.
#[derive(Debug, Default)]
struct HandshakeSession {
    wearable_id: DeviceId,
    /// Decided in `writeChannelFound`; `None` until then.
    purpose: Option<Purpose>,
    /// Plaintext block the wearable submitted.
    wearable_block: String,
    /// Our random challenge block, upper-case hex.
    our_block: String,
    /// The wearable's encrypted echo of our block.
    wearable_ciphertext: String,
}

/// The state machine.  One instance exists; the dispatch loop owns it and
/// feeds it events one at a time, so no interior locking is needed.
pub struct HandshakeMachine {
    state: HandshakeState,
    session: Option<HandshakeSession>,
    timeouts: HandshakeTimeouts,
    timer_generation: u64,
    timer: Option<JoinHandle<()>>,
    radio: RadioHandle,
    oracle: Arc<dyn Oracle>,
    registry: Arc<Mutex<DeviceRegistry>>,
    login_target: LoginTarget,
    status_tx: broadcast::Sender<LoginStatus>,
    /// Loopback into the dispatch loop for timer and Oracle events.
    events_tx: mpsc::Sender<HandshakeEvent>,
}

impl HandshakeMachine {
    /// Builds the machine and its loopback channel.  The returned receiver
    /// must be drained by the dispatch loop alongside the radio events.
    pub fn new(
        radio: RadioHandle,
        oracle: Arc<dyn Oracle>,
        registry: Arc<Mutex<DeviceRegistry>>,
        login_target: LoginTarget,
        status_tx: broadcast::Sender<LoginStatus>,
        timeouts: HandshakeTimeouts,
    ) -> (Self, mpsc::Receiver<HandshakeEvent>) {
        let (events_tx, events_rx) = mpsc::channel(32);
        let machine = Self {
            state: HandshakeState::Discovery,
            session: None,
            timeouts,
            timer_generation: 0,
            timer: None,
            radio,
            oracle,
            registry,
            login_target,
            status_tx,
            events_tx,
        };
        (machine, events_rx)
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Returns `true` while a deadline is pending.
    pub fn timer_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Consumes one event.  Unlisted (state, event) pairs are ignored.
    pub async fn handle(&mut self, event: HandshakeEvent) {
        match event {
            HandshakeEvent::Reset => self.reset(),

            HandshakeEvent::Timeout(generation) => {
                if generation != self.timer_generation {
                    trace!("ignoring stale timeout (generation {generation})");
                    return;
                }
                match self.state {
                    HandshakeState::Connected
                    | HandshakeState::WriteChannelFound
                    | HandshakeState::EncryptBlockViaOracle
                    | HandshakeState::SendCiphertextToWearable
                    | HandshakeState::SendRandomBlockToWearable
                    | HandshakeState::DecryptBlockViaOracle => {
                        warn!("handshake timed out in {:?}", self.state);
                        self.enter_unsuccessful().await;
                    }
                    _ => trace!("timeout in {:?} ignored", self.state),
                }
            }

            HandshakeEvent::ConnectedToWearable { id } => {
                if self.state != HandshakeState::Discovery {
                    debug!("connect handover for {id} ignored in {:?}", self.state);
                    return;
                }
                self.session = Some(HandshakeSession {
                    wearable_id: id,
                    ..HandshakeSession::default()
                });
                self.enter_connected();
            }

            HandshakeEvent::WriteChannelReady => {
                if self.state != HandshakeState::Connected {
                    trace!("write channel event ignored in {:?}", self.state);
                    return;
                }
                self.enter_write_channel_found().await;
            }

            HandshakeEvent::DataFromWearable(message) => match self.state {
                HandshakeState::WriteChannelFound => {
                    debug!("wearable submitted plaintext block: {message}");
                    if let Some(session) = self.session.as_mut() {
                        session.wearable_block = message;
                    }
                    self.enter_encrypt_via_oracle();
                }
                HandshakeState::SendCiphertextToWearable => {
                    if message == "OK" {
                        self.enter_send_random_block().await;
                    } else {
                        warn!("wearable rejected our ciphertext: {message}");
                        self.enter_unsuccessful().await;
                    }
                }
                HandshakeState::SendRandomBlockToWearable => {
                    debug!("wearable echoed encrypted block: {message}");
                    if let Some(session) = self.session.as_mut() {
                        session.wearable_ciphertext = message;
                    }
                    self.enter_decrypt_via_oracle();
                }
                _ => trace!("wearable data ignored in {:?}: {message}", self.state),
            },

            HandshakeEvent::EncryptedBlockFromOracle(block) => {
                if self.state != HandshakeState::EncryptBlockViaOracle {
                    trace!("oracle ciphertext ignored in {:?}", self.state);
                    return;
                }
                debug!("oracle returned ciphertext: {block}");
                self.enter_send_ciphertext(block).await;
            }

            HandshakeEvent::DecryptedBlockFromOracle(block) => {
                if self.state != HandshakeState::DecryptBlockViaOracle {
                    trace!("oracle plaintext ignored in {:?}", self.state);
                    return;
                }
                let matches = self
                    .session
                    .as_ref()
                    .is_some_and(|s| block.eq_ignore_ascii_case(&s.our_block));
                if matches {
                    self.enter_successful().await;
                } else {
                    warn!("decrypted block does not match our challenge");
                    self.enter_unsuccessful().await;
                }
            }
        }
    }

    // ── State entry actions ───────────────────────────────────────────────────

    fn enter_connected(&mut self) {
        self.transition(HandshakeState::Connected);
        self.arm_timer(self.timeouts.device);
    }

    async fn enter_write_channel_found(&mut self) {
        self.transition(HandshakeState::WriteChannelFound);
        let Some(id) = self.session.as_ref().map(|s| s.wearable_id.clone()) else {
            self.abandon_without_session().await;
            return;
        };

        // The purpose keyword tells the wearable why we connected; `login`
        // consumes the front-end's priority target.
        let purpose = if self.login_target.take_if(&id).await {
            Purpose::Login
        } else {
            Purpose::Heartbeat
        };
        if let Some(session) = self.session.as_mut() {
            session.purpose = Some(purpose);
        }

        match purpose {
            Purpose::Login => {
                info!("starting login handshake with {id}");
                self.radio.write_message("login").await;
            }
            Purpose::Heartbeat => {
                debug!("starting heartbeat handshake with {id}");
                self.radio.write_message("heartbeat").await;
            }
        }
        self.arm_timer(self.timeouts.device);
    }

    fn enter_encrypt_via_oracle(&mut self) {
        self.transition(HandshakeState::EncryptBlockViaOracle);
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let oracle = Arc::clone(&self.oracle);
        let events = self.events_tx.clone();
        let id = session.wearable_id.clone();
        let block = session.wearable_block.clone();
        tokio::spawn(async move {
            match oracle.encrypt(&id, &block).await {
                Ok(ciphertext) => {
                    let _ = events
                        .send(HandshakeEvent::EncryptedBlockFromOracle(ciphertext))
                        .await;
                }
                // No reply event: the state's deadline handles it.
                Err(e) => warn!("oracle encrypt for {id} failed: {e}"),
            }
        });
        self.arm_timer(self.timeouts.oracle);
    }

    async fn enter_send_ciphertext(&mut self, ciphertext: String) {
        self.transition(HandshakeState::SendCiphertextToWearable);
        self.radio.write_message(&ciphertext).await;
        self.arm_timer(self.timeouts.device);
    }

    async fn enter_send_random_block(&mut self) {
        self.transition(HandshakeState::SendRandomBlockToWearable);

        // 128-bit challenge, upper-case hex on the wire.
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let block = hex::encode(bytes).to_ascii_uppercase();
        if let Some(session) = self.session.as_mut() {
            session.our_block = block.clone();
        }

        debug!("sending challenge block to wearable");
        self.radio.write_message(&block).await;
        self.arm_timer(self.timeouts.device);
    }

    fn enter_decrypt_via_oracle(&mut self) {
        self.transition(HandshakeState::DecryptBlockViaOracle);
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let oracle = Arc::clone(&self.oracle);
        let events = self.events_tx.clone();
        let id = session.wearable_id.clone();
        let ciphertext = session.wearable_ciphertext.clone();
        tokio::spawn(async move {
            match oracle.decrypt(&id, &ciphertext).await {
                Ok(plaintext) => {
                    let _ = events
                        .send(HandshakeEvent::DecryptedBlockFromOracle(plaintext))
                        .await;
                }
                Err(e) => warn!("oracle decrypt for {id} failed: {e}"),
            }
        });
        self.arm_timer(self.timeouts.oracle);
    }

    async fn enter_successful(&mut self) {
        self.transition(HandshakeState::SuccessfulHandshake);
        let Some(session) = self.session.as_ref() else {
            return;
        };
        info!("handshake with {} succeeded", session.wearable_id);

        {
            let mut registry = self.registry.lock().await;
            registry.upsert(&session.wearable_id, DeviceState::Active, now_ms());
            registry.clear_checking(&session.wearable_id);
        }

        if session.purpose == Some(Purpose::Login) {
            // Err here only means no relay session is listening.
            let _ = self.status_tx.send(LoginStatus {
                user_id: session.wearable_id.clone(),
                success: true,
            });
        }
        self.radio.request_disconnect().await;
    }

    async fn enter_unsuccessful(&mut self) {
        self.transition(HandshakeState::UnsuccessfulHandshake);
        if let Some(session) = self.session.as_ref() {
            info!("handshake with {} failed", session.wearable_id);
            if session.purpose == Some(Purpose::Login) {
                let _ = self.status_tx.send(LoginStatus {
                    user_id: session.wearable_id.clone(),
                    success: false,
                });
            }
        }
        self.radio.request_disconnect().await;
    }

    /// Unconditional return to discovery: session secrets dropped, timer
    /// disarmed.  Raised only by a hardware disconnect.
    fn reset(&mut self) {
        debug!("resetting handshake state machine");
        self.disarm_timer();
        self.session = None;
        self.state = HandshakeState::Discovery;
    }

    /// A waiting state found no session.  Cannot happen through the dispatch
    /// loop; recover by failing the handshake rather than crashing.
    async fn abandon_without_session(&mut self) {
        error!("no session in {:?}; abandoning handshake", self.state);
        self.enter_unsuccessful().await;
    }

    // ── Timers and transitions ────────────────────────────────────────────────

    fn transition(&mut self, next: HandshakeState) {
        self.disarm_timer();
        debug!("handshake: {:?} -> {next:?}", self.state);
        self.state = next;
    }

    fn arm_timer(&mut self, deadline: Duration) {
        self.disarm_timer();
        let generation = self.timer_generation;
        let events = self.events_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = events.send(HandshakeEvent::Timeout(generation)).await;
        }));
    }

    fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // A timeout already queued before the abort carries the old
        // generation and will be recognized as stale.
        self.timer_generation += 1;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::oracle::OracleError;
    use crate::infrastructure::radio::{radio_channel, RadioCommand};
    use async_trait::async_trait;

    /// Oracle double with canned replies; `None` means "never answers".
    struct FakeOracle {
        encrypt_reply: Option<String>,
        decrypt_reply: Option<String>,
    }

    #[async_trait]
    impl Oracle for FakeOracle {
        async fn encrypt(&self, _id: &str, _plaintext: &str) -> Result<String, OracleError> {
            self.encrypt_reply
                .clone()
                .ok_or_else(|| OracleError::Refused("scripted".to_string()))
        }

        async fn decrypt(&self, _id: &str, _ciphertext: &str) -> Result<String, OracleError> {
            self.decrypt_reply
                .clone()
                .ok_or_else(|| OracleError::Refused("scripted".to_string()))
        }
    }

    struct Harness {
        machine: HandshakeMachine,
        events: mpsc::Receiver<HandshakeEvent>,
        commands: mpsc::Receiver<RadioCommand>,
        status_rx: broadcast::Receiver<LoginStatus>,
        registry: Arc<Mutex<DeviceRegistry>>,
        login_target: LoginTarget,
    }

    fn harness(oracle: FakeOracle, timeouts: HandshakeTimeouts) -> Harness {
        let (radio, commands) = radio_channel(64);
        let registry = Arc::new(Mutex::new(DeviceRegistry::new()));
        let login_target = LoginTarget::new();
        let (status_tx, status_rx) = broadcast::channel(8);
        let (machine, events) = HandshakeMachine::new(
            radio,
            Arc::new(oracle),
            Arc::clone(&registry),
            login_target.clone(),
            status_tx,
            timeouts,
        );
        Harness {
            machine,
            events,
            commands,
            status_rx,
            registry,
            login_target,
        }
    }

    /// Long deadlines so only scripted Oracle replies appear on the loopback.
    fn patient() -> HandshakeTimeouts {
        HandshakeTimeouts {
            device: Duration::from_secs(60),
            oracle: Duration::from_secs(60),
        }
    }

    fn drain_commands(h: &mut Harness) -> Vec<RadioCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = h.commands.try_recv() {
            commands.push(command);
        }
        commands
    }

    /// Drives the machine from discovery to `DecryptBlockViaOracle` and
    /// returns the challenge block it generated.
    async fn walk_to_decrypt(h: &mut Harness, id: &str) -> String {
        h.machine
            .handle(HandshakeEvent::ConnectedToWearable { id: id.to_string() })
            .await;
        assert_eq!(h.machine.state(), HandshakeState::Connected);

        h.machine.handle(HandshakeEvent::WriteChannelReady).await;
        assert_eq!(h.machine.state(), HandshakeState::WriteChannelFound);

        h.machine
            .handle(HandshakeEvent::DataFromWearable("AABBCCDD".to_string()))
            .await;
        assert_eq!(h.machine.state(), HandshakeState::EncryptBlockViaOracle);

        // The spawned Oracle task posts its reply to the loopback channel.
        let reply = h.events.recv().await.expect("oracle reply");
        h.machine.handle(reply).await;
        assert_eq!(h.machine.state(), HandshakeState::SendCiphertextToWearable);

        h.machine
            .handle(HandshakeEvent::DataFromWearable("OK".to_string()))
            .await;
        assert_eq!(h.machine.state(), HandshakeState::SendRandomBlockToWearable);
        let our_block = h.machine.session.as_ref().unwrap().our_block.clone();

        h.machine
            .handle(HandshakeEvent::DataFromWearable("1234ECHO".to_string()))
            .await;
        assert_eq!(h.machine.state(), HandshakeState::DecryptBlockViaOracle);
        our_block
    }

    #[tokio::test]
    async fn test_heartbeat_walk_sends_purpose_ciphertext_and_challenge() {
        let mut h = harness(
            FakeOracle {
                encrypt_reply: Some("CTBLOCK".to_string()),
                decrypt_reply: None,
            },
            patient(),
        );

        let our_block = walk_to_decrypt(&mut h, "ABC123").await;
        assert_eq!(our_block.len(), 32, "challenge is 16 bytes of hex");

        let frames: Vec<Vec<u8>> = drain_commands(&mut h)
            .into_iter()
            .filter_map(|c| match c {
                RadioCommand::WriteFrame(frame) => Some(frame),
                _ => None,
            })
            .collect();
        // Purpose keyword, Oracle ciphertext, and challenge each end with '3'.
        assert_eq!(frames[0], b"1HEARTBEAT".to_vec());
        assert_eq!(frames[1], vec![b'3']);
        assert_eq!(frames[2], b"1CTBLOCK".to_vec());
        assert!(frames.last().unwrap() == &vec![b'3']);
    }

    #[tokio::test]
    async fn test_matching_decrypted_block_succeeds_case_insensitively() {
        let mut h = harness(
            FakeOracle {
                encrypt_reply: Some("CT".to_string()),
                decrypt_reply: None,
            },
            patient(),
        );
        // Pre-age the device so success also proves the queue is cleared.
        {
            let mut registry = h.registry.lock().await;
            registry.upsert("ABC123", DeviceState::Active, 0);
            registry.sweep(20_000, 15_000, 60_000);
            assert!(registry.needs_checking("ABC123"));
        }

        let our_block = walk_to_decrypt(&mut h, "ABC123").await;
        h.machine
            .handle(HandshakeEvent::DecryptedBlockFromOracle(
                our_block.to_ascii_lowercase(),
            ))
            .await;

        assert_eq!(h.machine.state(), HandshakeState::SuccessfulHandshake);
        assert!(!h.machine.timer_armed(), "no timer may outlive the outcome");

        let registry = h.registry.lock().await;
        assert_eq!(
            registry.get("ABC123").unwrap().state,
            DeviceState::Active
        );
        assert!(!registry.needs_checking("ABC123"));
        drop(registry);

        // Heartbeat purpose: nothing for the relay.
        assert!(h.status_rx.try_recv().is_err());
        // Clean teardown requested.
        assert!(drain_commands(&mut h)
            .iter()
            .any(|c| matches!(c, RadioCommand::RequestDisconnect)));
    }

    #[tokio::test]
    async fn test_mismatched_decrypted_block_fails() {
        let mut h = harness(
            FakeOracle {
                encrypt_reply: Some("CT".to_string()),
                decrypt_reply: None,
            },
            patient(),
        );
        walk_to_decrypt(&mut h, "ABC123").await;

        h.machine
            .handle(HandshakeEvent::DecryptedBlockFromOracle(
                "0000000000000000".to_string(),
            ))
            .await;
        assert_eq!(h.machine.state(), HandshakeState::UnsuccessfulHandshake);
        assert!(!h.machine.timer_armed());
        assert!(drain_commands(&mut h)
            .iter()
            .any(|c| matches!(c, RadioCommand::RequestDisconnect)));
    }

    #[tokio::test]
    async fn test_non_ok_status_routes_to_unsuccessful() {
        let mut h = harness(
            FakeOracle {
                encrypt_reply: Some("CT".to_string()),
                decrypt_reply: None,
            },
            patient(),
        );
        h.machine
            .handle(HandshakeEvent::ConnectedToWearable {
                id: "ABC123".to_string(),
            })
            .await;
        h.machine.handle(HandshakeEvent::WriteChannelReady).await;
        h.machine
            .handle(HandshakeEvent::DataFromWearable("AABB".to_string()))
            .await;
        let reply = h.events.recv().await.expect("oracle reply");
        h.machine.handle(reply).await;

        h.machine
            .handle(HandshakeEvent::DataFromWearable("ERR".to_string()))
            .await;
        assert_eq!(h.machine.state(), HandshakeState::UnsuccessfulHandshake);
    }

    #[tokio::test]
    async fn test_login_purpose_sends_login_and_consumes_target() {
        let mut h = harness(
            FakeOracle {
                encrypt_reply: None,
                decrypt_reply: None,
            },
            patient(),
        );
        h.login_target.request("XYZ999").await;

        h.machine
            .handle(HandshakeEvent::ConnectedToWearable {
                id: "XYZ999".to_string(),
            })
            .await;
        h.machine.handle(HandshakeEvent::WriteChannelReady).await;

        let frames: Vec<RadioCommand> = drain_commands(&mut h);
        assert_eq!(frames[0], RadioCommand::WriteFrame(b"1LOGIN".to_vec()));
        assert!(!h.login_target.is("XYZ999").await, "target consumed");
    }

    #[tokio::test]
    async fn test_timeout_emits_login_failure_exactly_once() {
        let mut h = harness(
            FakeOracle {
                encrypt_reply: Some("CT".to_string()),
                decrypt_reply: None,
            },
            HandshakeTimeouts {
                device: Duration::from_millis(20),
                oracle: Duration::from_millis(20),
            },
        );
        h.login_target.request("XYZ999").await;

        h.machine
            .handle(HandshakeEvent::ConnectedToWearable {
                id: "XYZ999".to_string(),
            })
            .await;
        h.machine.handle(HandshakeEvent::WriteChannelReady).await;
        h.machine
            .handle(HandshakeEvent::DataFromWearable("AABB".to_string()))
            .await;
        let reply = h.events.recv().await.expect("oracle reply");
        h.machine.handle(reply).await;
        assert_eq!(h.machine.state(), HandshakeState::SendCiphertextToWearable);

        // The wearable never answers; pump loopback events until the live
        // deadline routes the machine to the failure state.
        while h.machine.state() != HandshakeState::UnsuccessfulHandshake {
            let event = h.events.recv().await.expect("loopback event");
            h.machine.handle(event).await;
        }

        let status = h.status_rx.try_recv().expect("one failure notification");
        assert_eq!(status.user_id, "XYZ999");
        assert!(!status.success);
        assert!(h.status_rx.try_recv().is_err(), "exactly once");
    }

    #[tokio::test]
    async fn test_stale_timeout_is_ignored_after_transition() {
        let mut h = harness(
            FakeOracle {
                encrypt_reply: None,
                decrypt_reply: None,
            },
            HandshakeTimeouts {
                device: Duration::from_millis(10),
                oracle: Duration::from_millis(10),
            },
        );

        h.machine
            .handle(HandshakeEvent::ConnectedToWearable {
                id: "ABC123".to_string(),
            })
            .await;

        // Let the connected-state deadline fire and sit in the queue.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stale = h.events.recv().await.expect("queued timeout");
        assert!(matches!(stale, HandshakeEvent::Timeout(_)));

        // Transition first, then deliver the stale timeout.
        h.machine.handle(HandshakeEvent::WriteChannelReady).await;
        assert_eq!(h.machine.state(), HandshakeState::WriteChannelFound);
        h.machine.handle(stale).await;
        assert_eq!(
            h.machine.state(),
            HandshakeState::WriteChannelFound,
            "stale timeout must not fail the newer state"
        );
    }

    #[tokio::test]
    async fn test_reset_returns_to_discovery_and_clears_session() {
        let mut h = harness(
            FakeOracle {
                encrypt_reply: Some("CT".to_string()),
                decrypt_reply: None,
            },
            patient(),
        );
        walk_to_decrypt(&mut h, "ABC123").await;

        h.machine.handle(HandshakeEvent::Reset).await;
        assert_eq!(h.machine.state(), HandshakeState::Discovery);
        assert!(h.machine.session.is_none());
        assert!(!h.machine.timer_armed());
    }

    #[tokio::test]
    async fn test_connect_handover_outside_discovery_is_ignored() {
        let mut h = harness(
            FakeOracle {
                encrypt_reply: None,
                decrypt_reply: None,
            },
            patient(),
        );
        h.machine
            .handle(HandshakeEvent::ConnectedToWearable {
                id: "FIRST".to_string(),
            })
            .await;
        h.machine
            .handle(HandshakeEvent::ConnectedToWearable {
                id: "SECOND".to_string(),
            })
            .await;

        assert_eq!(h.machine.state(), HandshakeState::Connected);
        assert_eq!(h.machine.session.as_ref().unwrap().wearable_id, "FIRST");
    }

    #[tokio::test]
    async fn test_wearable_data_in_discovery_is_ignored() {
        let mut h = harness(
            FakeOracle {
                encrypt_reply: None,
                decrypt_reply: None,
            },
            patient(),
        );
        h.machine
            .handle(HandshakeEvent::DataFromWearable("NOISE".to_string()))
            .await;
        assert_eq!(h.machine.state(), HandshakeState::Discovery);
        assert!(drain_commands(&mut h).is_empty());
    }
}
