//! Presence relay socket server.
//!
//! The front-end display connects over plain TCP and receives newline-framed
//! JSON messages:
//!
//! - `activePeripherals` – a registry snapshot, pushed on a fixed cadence.
//! - `loginStatus` – pushed when a login-purpose handshake finishes, carrying
//!   `result` (`success` | `fail`) and the wearable's `userId`.
//!
//! The front-end can also write requests; `{"login": "<id>"}` names the
//! wearable the arbiter should prioritize connecting to next (the user is
//! standing at the display trying to log in).
//!
//! In mock-data mode (`--mock`) the snapshot pushes carry a random subset of
//! four canned users instead of the live registry, so the front-end can be
//! developed without radio hardware.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use presence_core::{ClientPresence, DeviceId, DeviceRegistry, DeviceState, RegistrySnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{broadcast, Mutex},
    time::{interval, timeout},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error type for the relay server.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The TCP listener could not be bound.
    #[error("failed to bind relay listener on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

// ── Login target ──────────────────────────────────────────────────────────────

/// The externally requested priority login target.
///
/// Set by the relay when the front-end submits a login request; consulted by
/// the arbiter's decision predicate and consumed by the handshake state
/// machine when it engages that wearable.
#[derive(Debug, Clone, Default)]
pub struct LoginTarget {
    inner: Arc<Mutex<Option<DeviceId>>>,
}

impl LoginTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current target.
    pub async fn request(&self, id: &str) {
        let mut slot = self.inner.lock().await;
        if let Some(previous) = slot.replace(id.to_string()) {
            debug!("login target {previous} superseded by {id}");
        }
    }

    /// Returns `true` when `id` is the current target.
    pub async fn is(&self, id: &str) -> bool {
        self.inner.lock().await.as_deref() == Some(id)
    }

    /// Clears and reports the target if it names `id`.
    pub async fn take_if(&self, id: &str) -> bool {
        let mut slot = self.inner.lock().await;
        if slot.as_deref() == Some(id) {
            *slot = None;
            true
        } else {
            false
        }
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

/// Outcome of a login-purpose handshake, broadcast to every relay session.
#[derive(Debug, Clone)]
pub struct LoginStatus {
    pub user_id: DeviceId,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginResult {
    Success,
    Fail,
}

/// Messages written to the front-end, tagged by message code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum RelayMessage {
    ActivePeripherals(RegistrySnapshot),
    #[serde(rename_all = "camelCase")]
    LoginStatus {
        result: LoginResult,
        user_id: DeviceId,
    },
}

impl From<LoginStatus> for RelayMessage {
    fn from(status: LoginStatus) -> Self {
        RelayMessage::LoginStatus {
            result: if status.success {
                LoginResult::Success
            } else {
                LoginResult::Fail
            },
            user_id: status.user_id,
        }
    }
}

/// Requests read from the front-end.
#[derive(Debug, Deserialize)]
struct RelayRequest {
    login: DeviceId,
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Relay server settings, drawn from the `[relay]` config section.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub bind_address: String,
    pub port: u16,
    pub update_interval: Duration,
    /// Serve canned mock users instead of the live registry.
    pub mock_data: bool,
}

/// Runs the relay accept loop until `running` is cleared.
///
/// Each accepted connection gets its own task so one slow front-end never
/// stalls another.
///
/// # Errors
///
/// Returns [`RelayError::BindFailed`] when the listener cannot be bound.
pub async fn run_relay(
    settings: RelaySettings,
    registry: Arc<Mutex<DeviceRegistry>>,
    login_target: LoginTarget,
    status_tx: broadcast::Sender<LoginStatus>,
    running: Arc<AtomicBool>,
) -> Result<(), RelayError> {
    let addr = format!("{}:{}", settings.bind_address, settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| RelayError::BindFailed {
            addr: addr.clone(),
            source,
        })?;
    info!("relay listening on {addr}");

    while running.load(Ordering::Relaxed) {
        // Bounded wait so the shutdown flag is observed promptly.
        let accepted = match timeout(Duration::from_millis(500), listener.accept()).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("relay accept error: {e}");
                continue;
            }
            Err(_elapsed) => continue,
        };

        let (stream, peer) = accepted;
        let session = RelaySession {
            id: Uuid::new_v4(),
            settings: settings.clone(),
            registry: Arc::clone(&registry),
            login_target: login_target.clone(),
            status_rx: status_tx.subscribe(),
        };
        info!("relay session {} opened from {peer}", session.id);
        tokio::spawn(session.run(stream));
    }

    info!("relay stopped");
    Ok(())
}

struct RelaySession {
    id: Uuid,
    settings: RelaySettings,
    registry: Arc<Mutex<DeviceRegistry>>,
    login_target: LoginTarget,
    status_rx: broadcast::Receiver<LoginStatus>,
}

impl RelaySession {
    async fn run(mut self, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut push_timer = interval(self.settings.update_interval);

        loop {
            tokio::select! {
                _ = push_timer.tick() => {
                    let snapshot = if self.settings.mock_data {
                        mock_snapshot()
                    } else {
                        self.registry.lock().await.snapshot()
                    };
                    let message = RelayMessage::ActivePeripherals(snapshot);
                    if write_message(&mut write_half, &message).await.is_err() {
                        break;
                    }
                }
                status = self.status_rx.recv() => match status {
                    Ok(status) => {
                        let message = RelayMessage::from(status);
                        if write_message(&mut write_half, &message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("relay session {} lagged, skipped {skipped} notifications", self.id);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_request(&line).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("relay session {} read error: {e}", self.id);
                        break;
                    }
                },
            }
        }

        info!("relay session {} closed", self.id);
    }

    async fn handle_request(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<RelayRequest>(line) {
            Ok(request) => {
                info!("login requested for {}", request.login);
                self.login_target.request(&request.login).await;
            }
            Err(e) => warn!("relay session {}: unintelligible request ({e}): {line}", self.id),
        }
    }
}

async fn write_message(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    message: &RelayMessage,
) -> std::io::Result<()> {
    // serde_json cannot fail on these types; treat it as a broken pipe if it does.
    let mut payload = serde_json::to_vec(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    payload.push(b'\n');
    write_half.write_all(&payload).await
}

// ── Mock data ─────────────────────────────────────────────────────────────────

/// Canned user identifiers served in mock-data mode.
const MOCK_USER_IDS: [&str; 4] = ["0001", "0002", "0003", "0004"];

/// A random subset of the canned users, all reported active.
fn mock_snapshot() -> RegistrySnapshot {
    use rand::seq::SliceRandom;
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let mut ids = MOCK_USER_IDS.to_vec();
    ids.shuffle(&mut rng);
    let count = rng.gen_range(0..=ids.len());

    let mut clients: Vec<ClientPresence> = ids[..count]
        .iter()
        .map(|id| ClientPresence {
            id: id.to_string(),
            state: DeviceState::Active,
        })
        .collect();
    clients.sort_by(|a, b| a.id.cmp(&b.id));
    RegistrySnapshot { clients }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_status_serializes_to_front_end_shape() {
        let message = RelayMessage::from(LoginStatus {
            user_id: "XYZ999".to_string(),
            success: false,
        });
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(
            json,
            r#"{"type":"loginStatus","data":{"result":"fail","userId":"XYZ999"}}"#
        );
    }

    #[test]
    fn test_active_peripherals_serializes_to_front_end_shape() {
        let message = RelayMessage::ActivePeripherals(RegistrySnapshot {
            clients: vec![ClientPresence {
                id: "ABC123".to_string(),
                state: DeviceState::Active,
            }],
        });
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(
            json,
            r#"{"type":"activePeripherals","data":{"clients":[{"id":"ABC123","state":"active"}]}}"#
        );
    }

    #[test]
    fn test_relay_request_parses_login_field() {
        let request: RelayRequest = serde_json::from_str(r#"{"login":"XYZ999"}"#).unwrap();
        assert_eq!(request.login, "XYZ999");
    }

    #[test]
    fn test_mock_snapshot_stays_within_canned_population() {
        for _ in 0..32 {
            let snapshot = mock_snapshot();
            assert!(snapshot.clients.len() <= MOCK_USER_IDS.len());
            for client in &snapshot.clients {
                assert!(MOCK_USER_IDS.contains(&client.id.as_str()));
                assert_eq!(client.state, DeviceState::Active);
            }
        }
    }

    #[tokio::test]
    async fn test_login_target_take_if_consumes_only_matching_id() {
        let target = LoginTarget::new();
        target.request("XYZ999").await;

        assert!(!target.take_if("ABC123").await);
        assert!(target.is("XYZ999").await);

        assert!(target.take_if("XYZ999").await);
        assert!(!target.is("XYZ999").await);
        // Already consumed.
        assert!(!target.take_if("XYZ999").await);
    }

    #[tokio::test]
    async fn test_login_target_latest_request_wins() {
        let target = LoginTarget::new();
        target.request("FIRST").await;
        target.request("SECOND").await;
        assert!(!target.is("FIRST").await);
        assert!(target.is("SECOND").await);
    }
}
